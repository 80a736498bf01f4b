//! Rate limiting logic: window counters, decisions and the request lifecycle.

mod counter;
mod decision;
mod key;
mod limiter;
mod policy;
mod request;
mod script;

pub use counter::{CounterReading, MemoryWindowCounter, StoreError, WindowCounter};
pub use decision::{decide, Verdict};
pub use key::{
    default_key_prefix, CallerKeySource, CounterKey, KeyResolver, ANONYMOUS_CALLER,
    DEFAULT_NAMESPACE,
};
pub use limiter::{
    default_over_limit_message, FailurePolicy, OverLimitFormatter, PolicyResolver,
    RateLimitState, RateLimiter, RateLimiterBuilder, Rejection, LIMIT_HEADER, REMAINING_HEADER,
    RESET_HEADER,
};
pub use policy::{parse_method, RatePolicy, RouteConfig, RouteSettings, RouteTable};
pub use request::RequestView;
pub use script::{
    RedisScriptClient, ScriptClient, ScriptHandle, ScriptedWindowCounter, WINDOW_SCRIPT,
};

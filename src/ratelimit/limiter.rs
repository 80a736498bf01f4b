//! Per-request rate limit lifecycle.
//!
//! For every inbound request the limiter decides whether the request is
//! subject to rate limiting, resolves its effective policy, increments the
//! shared window counter and turns the reading into a [`Verdict`]. The host
//! stores the resulting [`RateLimitState`] with the request, rejects it if
//! [`RateLimiter::rejection`] says so, and calls [`RateLimiter::annotate`] on
//! whatever response is finally produced.

use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, instrument, trace, warn};

use super::counter::WindowCounter;
use super::decision::{decide, Verdict};
use super::key::{default_key_prefix, CounterKey, KeyResolver, DEFAULT_NAMESPACE};
use super::policy::{RatePolicy, RouteSettings, RouteTable};
use super::request::RequestView;
use crate::config::RateLimitingConfig;
use crate::error::{RatekeeperError, Result};

/// Header carrying the requests left in the current window.
pub const REMAINING_HEADER: HeaderName = HeaderName::from_static("x-rate-limit-remaining");
/// Header carrying the window limit.
pub const LIMIT_HEADER: HeaderName = HeaderName::from_static("x-rate-limit-limit");
/// Header carrying the Unix timestamp at which the window resets.
pub const RESET_HEADER: HeaderName = HeaderName::from_static("x-rate-limit-reset");

/// Strategy resolving the default policy of a request.
pub type PolicyResolver = Arc<dyn Fn(&RequestView<'_>) -> RatePolicy + Send + Sync>;

/// Strategy producing the error message of a rejected request.
pub type OverLimitFormatter = Arc<dyn Fn(&Verdict) -> String + Send + Sync>;

/// What to do with a request when the counter store cannot be reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Log the failure and let the request through without rate limit headers
    #[default]
    Open,
    /// Reject the request with `503 Service Unavailable`
    Closed,
}

/// Rate limit state attached to an in-flight request.
///
/// A request carries no state until it has been evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitState {
    /// Not subject to rate limiting; the counter was not touched
    Exempt,
    /// Counted and decided
    Evaluated(Verdict),
    /// The counter store failed while evaluating the request
    StoreUnavailable,
}

impl RateLimitState {
    /// The verdict, if the request was evaluated.
    pub fn verdict(&self) -> Option<&Verdict> {
        match self {
            RateLimitState::Evaluated(verdict) => Some(verdict),
            _ => None,
        }
    }
}

/// A response the host must send instead of running the handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    /// Response status
    pub status: StatusCode,
    /// Error message placed in the response body
    pub message: String,
}

/// The core rate limiter that applies policies to requests.
///
/// This struct is immutable once built and can be shared across tasks.
#[derive(Clone)]
pub struct RateLimiter {
    counter: Arc<dyn WindowCounter>,
    routes: RouteTable,
    namespace: String,
    methods: Vec<Method>,
    headers_enabled: bool,
    enabled_by_default: bool,
    failure_policy: FailurePolicy,
    default_policy: PolicyResolver,
    key_prefix: KeyResolver,
    caller_key: KeyResolver,
    over_limit: OverLimitFormatter,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("routes", &self.routes)
            .field("namespace", &self.namespace)
            .field("methods", &self.methods)
            .field("headers_enabled", &self.headers_enabled)
            .field("enabled_by_default", &self.enabled_by_default)
            .field("failure_policy", &self.failure_policy)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    /// Start building a limiter on top of a window counter.
    pub fn builder(counter: Arc<dyn WindowCounter>) -> RateLimiterBuilder {
        RateLimiterBuilder::new(counter)
    }

    /// Whether the request is subject to rate limiting.
    ///
    /// Returns the route settings to apply, or `None` for exempt requests.
    pub fn applicable_settings(&self, request: &RequestView<'_>) -> Option<RouteSettings> {
        if !self.methods.contains(request.method) {
            return None;
        }

        let settings = self
            .routes
            .get(request.method, request.route)
            .copied()
            .unwrap_or_default();

        settings
            .is_enabled(self.enabled_by_default)
            .then_some(settings)
    }

    /// The effective policy: route overrides merged onto the default policy.
    pub fn resolve_policy(
        &self,
        request: &RequestView<'_>,
        settings: &RouteSettings,
    ) -> RatePolicy {
        (self.default_policy)(request).merge(settings)
    }

    /// The counter key of a request.
    pub fn counter_key(&self, request: &RequestView<'_>) -> CounterKey {
        CounterKey::new(
            &self.namespace,
            &(self.key_prefix)(request),
            &(self.caller_key)(request),
        )
    }

    /// Classify, count and decide a request.
    #[instrument(skip(self, request), fields(method = %request.method, route = %request.route))]
    pub async fn evaluate(&self, request: &RequestView<'_>) -> RateLimitState {
        let Some(settings) = self.applicable_settings(request) else {
            trace!("Request exempt from rate limiting");
            return RateLimitState::Exempt;
        };

        let policy = self.resolve_policy(request, &settings);
        let key = self.counter_key(request);

        trace!(
            key = %key,
            limit = policy.limit,
            window = policy.window,
            "Checking rate limit"
        );

        let reading = match self.counter.increment(key.as_str(), policy.window).await {
            Ok(reading) => reading,
            Err(e) => {
                warn!(
                    key = %key,
                    error = %e,
                    failure_policy = ?self.failure_policy,
                    "Rate limit store unavailable"
                );
                return RateLimitState::StoreUnavailable;
            }
        };

        let now = chrono::Utc::now().timestamp();
        let verdict = decide(policy.limit, policy.window, reading.count, reading.ttl, now);

        if verdict.allowed {
            debug!(
                key = %key,
                count = reading.count,
                remaining = verdict.remaining,
                "Request within rate limit"
            );
        } else {
            debug!(
                key = %key,
                count = reading.count,
                limit = verdict.limit,
                "Rate limit exceeded"
            );
        }

        RateLimitState::Evaluated(verdict)
    }

    /// The response to send instead of running the handler, if any.
    pub fn rejection(&self, state: &RateLimitState) -> Option<Rejection> {
        match state {
            RateLimitState::Evaluated(verdict) if !verdict.allowed => Some(Rejection {
                status: StatusCode::TOO_MANY_REQUESTS,
                message: (self.over_limit)(verdict),
            }),
            RateLimitState::StoreUnavailable if self.failure_policy == FailurePolicy::Closed => {
                Some(Rejection {
                    status: StatusCode::SERVICE_UNAVAILABLE,
                    message: "Rate limit service unavailable".to_string(),
                })
            }
            _ => None,
        }
    }

    /// Attach the rate limit headers of an evaluated request to a response.
    ///
    /// Does nothing for requests without a verdict or when headers are disabled.
    pub fn annotate(&self, state: &RateLimitState, headers: &mut HeaderMap) {
        if !self.headers_enabled {
            return;
        }
        let Some(verdict) = state.verdict() else {
            return;
        };

        headers.insert(REMAINING_HEADER, HeaderValue::from(verdict.remaining));
        headers.insert(LIMIT_HEADER, HeaderValue::from(verdict.limit));
        headers.insert(RESET_HEADER, HeaderValue::from(verdict.reset));
    }

    /// Get the configured route table.
    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }
}

/// Default over-limit message.
pub fn default_over_limit_message(verdict: &Verdict) -> String {
    format!(
        "Rate limit exceeded: {} requests per {} seconds, retry after {}",
        verdict.limit, verdict.window, verdict.reset
    )
}

/// Builder for [`RateLimiter`].
pub struct RateLimiterBuilder {
    counter: Arc<dyn WindowCounter>,
    routes: RouteTable,
    namespace: String,
    methods: Vec<Method>,
    headers_enabled: bool,
    enabled_by_default: bool,
    failure_policy: FailurePolicy,
    default_policy: PolicyResolver,
    key_prefix: KeyResolver,
    caller_key: Option<KeyResolver>,
    over_limit: OverLimitFormatter,
}

impl RateLimiterBuilder {
    fn new(counter: Arc<dyn WindowCounter>) -> Self {
        let default = RatePolicy::default();
        Self {
            counter,
            routes: RouteTable::new(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            methods: vec![Method::GET, Method::POST, Method::DELETE],
            headers_enabled: true,
            enabled_by_default: false,
            failure_policy: FailurePolicy::Open,
            default_policy: Arc::new(move |_: &RequestView<'_>| default),
            key_prefix: Arc::new(default_key_prefix),
            caller_key: None,
            over_limit: Arc::new(default_over_limit_message),
        }
    }

    /// Apply every setting available in the configuration file.
    ///
    /// The caller key source is taken from the configuration too; a resolver
    /// set later with [`RateLimiterBuilder::caller_key`] replaces it.
    pub fn with_config(mut self, config: &RateLimitingConfig) -> Result<Self> {
        config.default_policy.validate()?;
        let default = config.default_policy;

        self.namespace = config.namespace.clone();
        self.methods = config.parsed_methods()?;
        self.headers_enabled = config.headers_enabled;
        self.enabled_by_default = config.enabled_for_all_routes;
        self.failure_policy = config.failure_policy;
        self.default_policy = Arc::new(move |_: &RequestView<'_>| default);
        self.caller_key = Some(config.caller_key.resolver());
        Ok(self)
    }

    /// Per-route settings.
    pub fn routes(mut self, routes: RouteTable) -> Self {
        self.routes = routes;
        self
    }

    /// Namespace prepended to every counter key.
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// HTTP methods subject to rate limiting.
    pub fn methods(mut self, methods: Vec<Method>) -> Self {
        self.methods = methods;
        self
    }

    /// Whether to emit the `X-Rate-Limit-*` headers.
    pub fn headers(mut self, enabled: bool) -> Self {
        self.headers_enabled = enabled;
        self
    }

    /// Whether routes without an `enabled` setting are rate limited.
    pub fn enabled_for_all_routes(mut self, enabled: bool) -> Self {
        self.enabled_by_default = enabled;
        self
    }

    /// Behavior when the counter store fails.
    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Resolver of the default policy of a request.
    pub fn default_policy<F>(mut self, resolver: F) -> Self
    where
        F: Fn(&RequestView<'_>) -> RatePolicy + Send + Sync + 'static,
    {
        self.default_policy = Arc::new(resolver);
        self
    }

    /// Route component of the counter key.
    pub fn key_prefix<F>(mut self, resolver: F) -> Self
    where
        F: Fn(&RequestView<'_>) -> String + Send + Sync + 'static,
    {
        self.key_prefix = Arc::new(resolver);
        self
    }

    /// Caller component of the counter key. Required.
    pub fn caller_key<F>(mut self, resolver: F) -> Self
    where
        F: Fn(&RequestView<'_>) -> String + Send + Sync + 'static,
    {
        self.caller_key = Some(Arc::new(resolver));
        self
    }

    /// Error message of rejected requests.
    pub fn over_limit_message<F>(mut self, formatter: F) -> Self
    where
        F: Fn(&Verdict) -> String + Send + Sync + 'static,
    {
        self.over_limit = Arc::new(formatter);
        self
    }

    /// Build the limiter.
    ///
    /// Fails if no caller key resolver was supplied.
    pub fn build(self) -> Result<RateLimiter> {
        let caller_key = self.caller_key.ok_or_else(|| {
            RatekeeperError::Config("a caller key resolver is required".to_string())
        })?;

        Ok(RateLimiter {
            counter: self.counter,
            routes: self.routes,
            namespace: self.namespace,
            methods: self.methods,
            headers_enabled: self.headers_enabled,
            enabled_by_default: self.enabled_by_default,
            failure_policy: self.failure_policy,
            default_policy: self.default_policy,
            key_prefix: self.key_prefix,
            caller_key,
            over_limit: self.over_limit,
        })
    }
}

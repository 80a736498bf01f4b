//! HTTP integration: the rate limit middleware and a server hosting it.

mod layer;
mod server;

pub use layer::{RateLimitLayer, RateLimitService};
pub use server::HttpServer;

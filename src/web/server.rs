//! HTTP server exposing the configured routes behind the rate limiter.

use axum::extract::MatchedPath;
use axum::routing::{get, MethodFilter, MethodRouter};
use axum::{Extension, Json, Router};
use http::Method;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use super::layer::RateLimitLayer;
use crate::error::Result;
use crate::ratelimit::{RateLimitState, RateLimiter};

/// HTTP server for the rate limited routes.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The rate limiter instance
    rate_limiter: Arc<RateLimiter>,
}

impl HttpServer {
    /// Create a new HTTP server.
    pub fn new(addr: SocketAddr, rate_limiter: Arc<RateLimiter>) -> Self {
        Self { addr, rate_limiter }
    }

    /// Build the router: one echo endpoint per configured route plus `/health`,
    /// all behind the rate limit layer.
    pub fn router(&self) -> Router {
        let mut paths: BTreeMap<&str, MethodRouter> = BTreeMap::new();

        for (method, path, _) in self.rate_limiter.routes().iter() {
            let filter = match MethodFilter::try_from(method.clone()) {
                Ok(filter) => filter,
                Err(_) => {
                    warn!(method = %method, path = %path, "Skipping route with unsupported method");
                    continue;
                }
            };
            let method_router = paths.remove(path).unwrap_or_else(MethodRouter::new);
            paths.insert(path, method_router.on(filter, echo));
        }

        let mut router = Router::new().route("/health", get(|| async { "OK" }));
        for (path, method_router) in paths {
            if path == "/health" {
                continue;
            }
            router = router.route(path, method_router);
        }

        router.layer(RateLimitLayer::new(self.rate_limiter.clone()))
    }

    /// Start the HTTP server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;
        let app = self
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();

        info!(
            addr = %self.addr,
            routes = self.rate_limiter.routes().len(),
            "Starting HTTP server with graceful shutdown"
        );

        axum::serve(listener, app)
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| {
                error!(error = %e, "HTTP server failed");
                e.into()
            })
    }
}

/// Describe the matched route and the caller's remaining quota.
async fn echo(
    method: Method,
    path: MatchedPath,
    state: Option<Extension<RateLimitState>>,
) -> Json<Value> {
    let verdict = state.and_then(|Extension(state)| state.verdict().copied());

    Json(json!({
        "method": method.as_str(),
        "route": path.as_str(),
        "rate_limit": verdict,
    }))
}

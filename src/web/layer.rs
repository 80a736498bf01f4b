//! Tower middleware running the rate limit lifecycle around a handler.

use axum::extract::MatchedPath;
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::future::BoxFuture;
use http::Request;
use serde_json::json;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

use crate::ratelimit::{RateLimiter, Rejection, RequestView};

/// A layer that enforces rate limits using a [`RateLimiter`].
///
/// Added with `Router::layer`, it runs after routing, so the matched path
/// template is used as the route identity. Authentication layers that the
/// caller key depends on must wrap this layer.
#[derive(Clone, Debug)]
pub struct RateLimitLayer {
    limiter: Arc<RateLimiter>,
}

impl RateLimitLayer {
    /// Create a new rate limit layer.
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self { limiter }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, service: S) -> Self::Service {
        RateLimitService {
            inner: service,
            limiter: self.limiter.clone(),
        }
    }
}

/// Middleware service that enforces rate limits.
///
/// The request's [`RateLimitState`](crate::ratelimit::RateLimitState) is
/// inserted into its extensions before the handler runs. Rate limit headers
/// are added to every response the handler returns, error statuses included,
/// and to rejections. Errors of the inner service pass through untouched.
#[derive(Clone, Debug)]
pub struct RateLimitService<S> {
    inner: S,
    limiter: Arc<RateLimiter>,
}

impl<S, ReqBody> Service<Request<ReqBody>> for RateLimitService<S>
where
    S: Service<Request<ReqBody>, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let limiter = self.limiter.clone();
        // The clone may not be ready; keep the service that was polled.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let (mut parts, body) = req.into_parts();
            let route = parts
                .extensions
                .get::<MatchedPath>()
                .map(|path| path.as_str().to_string())
                .unwrap_or_else(|| parts.uri.path().to_string());

            let state = limiter.evaluate(&RequestView::new(&parts, &route)).await;
            parts.extensions.insert(state);

            let mut response = match limiter.rejection(&state) {
                Some(rejection) => rejection.into_response(),
                None => inner.call(Request::from_parts(parts, body)).await?,
            };

            limiter.annotate(&state, response.headers_mut());
            Ok(response)
        })
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

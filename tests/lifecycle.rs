use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::routing::get;
use axum::Router;
use http::{Method, Request, StatusCode};
use serde_json::Value;
use tower::ServiceExt;

use ratekeeper::ratelimit::{
    CounterReading, FailurePolicy, MemoryWindowCounter, RateLimiter, RateLimiterBuilder,
    RequestView, RouteSettings, RouteTable, StoreError, Verdict, WindowCounter,
};
use ratekeeper::web::RateLimitLayer;

/// Window counter that records calls and can simulate a store outage.
#[derive(Default)]
struct ObservedCounter {
    inner: MemoryWindowCounter,
    calls: AtomicUsize,
    down: AtomicBool,
}

#[async_trait]
impl WindowCounter for ObservedCounter {
    async fn increment(&self, key: &str, window_secs: u64) -> Result<CounterReading, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.down.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection refused".to_string()));
        }
        self.inner.increment(key, window_secs).await
    }
}

fn routes() -> RouteTable {
    RouteTable::new()
        .with_route(Method::GET, "/limited", RouteSettings::with_policy(5, 60))
        .unwrap()
        .with_route(Method::GET, "/failing", RouteSettings::with_policy(5, 60))
        .unwrap()
}

fn app_with(
    counter: Arc<ObservedCounter>,
    configure: impl FnOnce(RateLimiterBuilder) -> RateLimiterBuilder,
) -> Router {
    let builder = RateLimiter::builder(counter)
        .routes(routes())
        .over_limit_message(|verdict: &Verdict| format!("limit of {} reached", verdict.limit))
        .caller_key(|req: &RequestView<'_>| {
            req.header("x-api-key").unwrap_or("anonymous").to_string()
        });
    let limiter = configure(builder).build().unwrap();

    Router::new()
        .route("/limited", get(|| async { "ok" }))
        .route("/open", get(|| async { "ok" }))
        .route(
            "/failing",
            get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
        )
        .layer(RateLimitLayer::new(Arc::new(limiter)))
}

fn app(counter: Arc<ObservedCounter>) -> Router {
    app_with(counter, |builder| builder)
}

fn request(path: &str, caller: &str) -> Request<Body> {
    Request::builder()
        .uri(path)
        .header("x-api-key", caller)
        .body(Body::empty())
        .unwrap()
}

fn header(response: &http::Response<Body>, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .map(|v| v.to_str().unwrap().to_string())
}

async fn json_body(response: http::Response<Body>) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn sixth_request_within_window_is_rejected() {
    let counter = Arc::new(ObservedCounter::default());
    let app = app(counter.clone());
    let now = chrono::Utc::now().timestamp();

    for expected in ["4", "3", "2", "1", "0"] {
        let response = app.clone().oneshot(request("/limited", "alice")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header(&response, "x-rate-limit-remaining").as_deref(), Some(expected));
        assert_eq!(header(&response, "x-rate-limit-limit").as_deref(), Some("5"));

        let reset: i64 = header(&response, "x-rate-limit-reset").unwrap().parse().unwrap();
        assert!(reset >= now + 59 && reset <= now + 62, "unexpected reset {}", reset);
    }

    let response = app.clone().oneshot(request("/limited", "alice")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(header(&response, "x-rate-limit-remaining").as_deref(), Some("0"));
    assert_eq!(header(&response, "x-rate-limit-limit").as_deref(), Some("5"));

    let body = json_body(response).await;
    assert_eq!(body["error"], "limit of 5 reached");

    // Another caller still has a full quota
    let response = app.oneshot(request("/limited", "bob")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "x-rate-limit-remaining").as_deref(), Some("4"));

    assert_eq!(counter.calls.load(Ordering::SeqCst), 7);
}

#[tokio::test]
async fn unconfigured_route_never_touches_counter() {
    let counter = Arc::new(ObservedCounter::default());
    let app = app(counter.clone());

    for _ in 0..10 {
        let response = app.clone().oneshot(request("/open", "alice")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(header(&response, "x-rate-limit-remaining").is_none());
        assert!(header(&response, "x-rate-limit-limit").is_none());
        assert!(header(&response, "x-rate-limit-reset").is_none());
    }

    assert_eq!(counter.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn error_responses_carry_headers() {
    let counter = Arc::new(ObservedCounter::default());
    let app = app(counter);

    let response = app.oneshot(request("/failing", "alice")).await.unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(header(&response, "x-rate-limit-remaining").as_deref(), Some("4"));
}

#[tokio::test]
async fn store_outage_fails_open_without_headers() {
    let counter = Arc::new(ObservedCounter::default());
    counter.down.store(true, Ordering::SeqCst);
    let app = app(counter.clone());

    let response = app.oneshot(request("/limited", "alice")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(header(&response, "x-rate-limit-remaining").is_none());
    assert_eq!(counter.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn store_outage_fails_closed_when_configured() {
    let counter = Arc::new(ObservedCounter::default());
    counter.down.store(true, Ordering::SeqCst);
    let app = app_with(counter, |builder| builder.failure_policy(FailurePolicy::Closed));

    let response = app.oneshot(request("/limited", "alice")).await.unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(header(&response, "x-rate-limit-remaining").is_none());
    let body = json_body(response).await;
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn headers_can_be_disabled() {
    let counter = Arc::new(ObservedCounter::default());
    let app = app_with(counter.clone(), |builder| builder.headers(false));

    let response = app.oneshot(request("/limited", "alice")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(header(&response, "x-rate-limit-limit").is_none());
    assert_eq!(counter.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn enabled_for_all_routes_limits_unconfigured_route() {
    let counter = Arc::new(ObservedCounter::default());
    let app = app_with(counter.clone(), |builder| builder.enabled_for_all_routes(true));

    let response = app.oneshot(request("/open", "alice")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "x-rate-limit-limit").as_deref(), Some("1000"));
    assert_eq!(counter.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_admit_exactly_the_limit() {
    let counter = Arc::new(ObservedCounter::default());
    let app = app(counter);

    let handles: Vec<_> = (0..20)
        .map(|_| {
            let app = app.clone();
            tokio::spawn(async move {
                app.oneshot(request("/limited", "alice"))
                    .await
                    .unwrap()
                    .status()
            })
        })
        .collect();

    let statuses: Vec<StatusCode> = futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    let admitted = statuses.iter().filter(|s| **s == StatusCode::OK).count();
    let rejected = statuses
        .iter()
        .filter(|s| **s == StatusCode::TOO_MANY_REQUESTS)
        .count();
    assert_eq!(admitted, 5);
    assert_eq!(rejected, 15);
}

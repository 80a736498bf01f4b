//! Turning a raw window count into an allow/deny verdict.

use serde::Serialize;

/// The outcome of evaluating a request's count against its policy.
///
/// A verdict is created once per request and carries everything needed to
/// emit the rate limit headers or the rejection body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Verdict {
    /// Maximum requests allowed in the window
    pub limit: u64,
    /// Window length in seconds
    pub window: u64,
    /// Requests left in the current window, clamped at zero
    pub remaining: u64,
    /// Unix timestamp (seconds) at which the window resets
    pub reset: i64,
    /// Whether the request is admitted
    pub allowed: bool,
}

/// Evaluate a counter reading against a policy.
///
/// `count` is the post-increment value returned by the window counter and
/// `ttl` the seconds left in its window. A negative `ttl` means the store holds
/// the counter without an expiry; the window is then assumed to have just
/// started. `now` is the evaluation instant in Unix seconds.
///
/// The allow/deny decision uses the signed difference `limit - count`, so the
/// request that brings the count to exactly `limit` is the last one admitted.
/// `remaining` is clamped only for display.
pub fn decide(limit: u64, window: u64, count: u64, ttl: i64, now: i64) -> Verdict {
    let ttl = if ttl < 0 { window as i64 } else { ttl };
    let remaining = limit as i64 - count as i64;

    Verdict {
        limit,
        window,
        remaining: remaining.max(0) as u64,
        reset: now + ttl,
        allowed: remaining >= 0,
    }
}

//! Window counter contract and an in-process implementation.

use async_trait::async_trait;
use dashmap::DashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::trace;

/// Errors raised by a counter store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store rejected the command or the connection failed
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// The store no longer knows the script handle
    #[error("Script {0} is not loaded in the store")]
    ScriptNotLoaded(String),

    /// The script returned something other than `{count, ttl}`
    #[error("Unexpected script reply: {0}")]
    MalformedReply(String),

    /// The store could not be reached
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// The result of one counter increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterReading {
    /// Counter value after the increment
    pub count: u64,
    /// Seconds left in the window, or a negative value if the key has no expiry
    pub ttl: i64,
}

/// A shared counter that tracks requests within a fixed window.
///
/// Implementations must perform the increment, the first-in-window expiry and
/// the TTL read as one indivisible step with respect to every other caller
/// incrementing the same key.
#[async_trait]
pub trait WindowCounter: Send + Sync {
    /// Increment the counter at `key`, starting a `window_secs` window if the
    /// counter did not exist.
    async fn increment(&self, key: &str, window_secs: u64) -> Result<CounterReading, StoreError>;
}

#[derive(Debug)]
struct WindowEntry {
    count: u64,
    expires_at: Option<Instant>,
}

/// An in-process window counter.
///
/// Each key lives in its own `DashMap` shard entry, and the entry lock is held
/// for the whole increment, so concurrent increments of one key serialize the
/// same way they would inside a Redis script. Expired entries are replaced
/// lazily on access and can be swept with [`MemoryWindowCounter::purge_expired`].
#[derive(Debug, Default)]
pub struct MemoryWindowCounter {
    entries: DashMap<String, WindowEntry>,
}

impl MemoryWindowCounter {
    /// Create an empty counter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove every counter whose window has elapsed.
    ///
    /// Returns the number of removed counters.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| entry.expires_at.map_or(true, |at| at > now));
        before - self.entries.len()
    }

    /// Get the number of live counters.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no counters are held.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Seconds left until `expires_at`, rounded the way Redis `TTL` rounds.
fn ttl_secs(expires_at: Instant, now: Instant) -> i64 {
    let millis = expires_at.saturating_duration_since(now).as_millis() as i64;
    (millis + 500) / 1000
}

#[async_trait]
impl WindowCounter for MemoryWindowCounter {
    async fn increment(&self, key: &str, window_secs: u64) -> Result<CounterReading, StoreError> {
        let now = Instant::now();
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert(WindowEntry {
                count: 0,
                expires_at: None,
            });

        if entry.expires_at.is_some_and(|at| at <= now) {
            entry.count = 0;
            entry.expires_at = None;
        }

        entry.count += 1;
        if entry.count == 1 {
            entry.expires_at = Some(now + Duration::from_secs(window_secs));
        }

        let ttl = match entry.expires_at {
            Some(at) => ttl_secs(at, now),
            None => -1,
        };

        trace!(key = %key, count = entry.count, ttl = ttl, "Incremented in-memory counter");

        Ok(CounterReading {
            count: entry.count,
            ttl,
        })
    }
}

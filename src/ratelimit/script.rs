//! Window counter backed by a server-side Lua script.
//!
//! The increment, the first-in-window `EXPIRE` and the `TTL` read run inside a
//! single script so that no other client can observe the counter between the
//! create-check and the expiry. Running them as separate round trips would let
//! a racing client leave a counter without any expiry.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::fmt;
use tracing::{debug, info, warn};

use super::counter::{CounterReading, StoreError, WindowCounter};

/// Lua source of the atomic window counter.
///
/// `KEYS[1]` is the counter key, `ARGV[1]` the window in seconds. Returns
/// `{count, ttl}`.
pub const WINDOW_SCRIPT: &str = r#"
local current = tonumber(redis.call("INCR", KEYS[1]))
if current == 1 then
  redis.call("EXPIRE", KEYS[1], ARGV[1])
end
local ttl = redis.call("TTL", KEYS[1])
return {current, ttl}
"#;

/// Handle of a script registered with the store (its SHA1 digest).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScriptHandle(String);

impl ScriptHandle {
    /// Wrap a digest returned by the store.
    pub fn new(sha: impl Into<String>) -> Self {
        Self(sha.into())
    }

    /// The digest used to invoke the script.
    pub fn sha(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScriptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Minimal store client needed by the scripted counter.
#[async_trait]
pub trait ScriptClient: Send + Sync {
    /// Register a script and return its handle.
    async fn load_script(&self, source: &str) -> Result<ScriptHandle, StoreError>;

    /// Run a registered script with the given keys and integer arguments.
    ///
    /// Must return [`StoreError::ScriptNotLoaded`] when the store does not
    /// know the handle.
    async fn invoke_script(
        &self,
        handle: &ScriptHandle,
        keys: &[&str],
        args: &[i64],
    ) -> Result<Vec<i64>, StoreError>;
}

/// Redis implementation of [`ScriptClient`].
#[derive(Clone)]
pub struct RedisScriptClient {
    connection_manager: ConnectionManager,
}

impl RedisScriptClient {
    /// Connect to Redis and verify the connection with a `PING`.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let connection_manager = ConnectionManager::new(client).await?;

        let mut conn = connection_manager.clone();
        redis::cmd("PING").query_async::<String>(&mut conn).await?;

        debug!("Connected to Redis for rate limiting");

        Ok(Self { connection_manager })
    }
}

#[async_trait]
impl ScriptClient for RedisScriptClient {
    async fn load_script(&self, source: &str) -> Result<ScriptHandle, StoreError> {
        let mut conn = self.connection_manager.clone();

        let sha: String = redis::cmd("SCRIPT")
            .arg("LOAD")
            .arg(source)
            .query_async(&mut conn)
            .await?;

        Ok(ScriptHandle::new(sha))
    }

    async fn invoke_script(
        &self,
        handle: &ScriptHandle,
        keys: &[&str],
        args: &[i64],
    ) -> Result<Vec<i64>, StoreError> {
        let mut conn = self.connection_manager.clone();

        redis::cmd("EVALSHA")
            .arg(handle.sha())
            .arg(keys.len())
            .arg(keys)
            .arg(args)
            .query_async::<Vec<i64>>(&mut conn)
            .await
            .map_err(|e| match e.kind() {
                redis::ErrorKind::NoScriptError => {
                    StoreError::ScriptNotLoaded(handle.sha().to_string())
                }
                _ => StoreError::Redis(e),
            })
    }
}

/// A [`WindowCounter`] that runs [`WINDOW_SCRIPT`] through a [`ScriptClient`].
///
/// The script handle is obtained once by [`ScriptedWindowCounter::register`]
/// and never changes afterwards. If the store forgets the script (for example
/// after `SCRIPT FLUSH` or a restart), the same source is loaded again, which
/// yields the same digest, and the call is retried once.
pub struct ScriptedWindowCounter<C> {
    client: C,
    handle: ScriptHandle,
}

impl<C: ScriptClient> ScriptedWindowCounter<C> {
    /// Register the window script with the store.
    pub async fn register(client: C) -> Result<Self, StoreError> {
        let handle = client.load_script(WINDOW_SCRIPT).await?;
        info!(sha = %handle, "Registered window counter script");
        Ok(Self { client, handle })
    }

    /// The registered script handle.
    pub fn handle(&self) -> &ScriptHandle {
        &self.handle
    }

    async fn reload(&self) -> Result<(), StoreError> {
        let reloaded = self.client.load_script(WINDOW_SCRIPT).await?;
        if reloaded != self.handle {
            return Err(StoreError::MalformedReply(format!(
                "script reloaded as {} instead of {}",
                reloaded, self.handle
            )));
        }
        Ok(())
    }
}

fn parse_reading(reply: &[i64]) -> Result<CounterReading, StoreError> {
    match *reply {
        [count, ttl] if count > 0 => Ok(CounterReading {
            count: count as u64,
            ttl,
        }),
        _ => Err(StoreError::MalformedReply(format!("{:?}", reply))),
    }
}

#[async_trait]
impl<C: ScriptClient> WindowCounter for ScriptedWindowCounter<C> {
    async fn increment(&self, key: &str, window_secs: u64) -> Result<CounterReading, StoreError> {
        let args = [window_secs as i64];

        let reply = match self.client.invoke_script(&self.handle, &[key], &args).await {
            Err(StoreError::ScriptNotLoaded(sha)) => {
                warn!(sha = %sha, "Window counter script missing from store, reloading");
                self.reload().await?;
                self.client
                    .invoke_script(&self.handle, &[key], &args)
                    .await?
            }
            other => other?,
        };

        let reading = parse_reading(&reply)?;
        if reading.ttl < 0 {
            warn!(
                key = %key,
                ttl = reading.ttl,
                "Counter has no expiry, assuming the window just started"
            );
        }

        Ok(reading)
    }
}

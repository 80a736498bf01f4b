//! Counter key generation.
//!
//! Keys have the shape `<namespace>:<route prefix>:<caller key>`, so the same
//! caller hitting the same route always lands on the same counter while
//! different routes and callers never share one.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use super::request::RequestView;

/// Namespace used when none is configured.
pub const DEFAULT_NAMESPACE: &str = "ratekeeper";

/// Caller key used when a request carries no usable identity.
pub const ANONYMOUS_CALLER: &str = "anonymous";

/// Strategy deriving a key component from a request.
pub type KeyResolver = Arc<dyn Fn(&RequestView<'_>) -> String + Send + Sync>;

/// A key that uniquely identifies a (route, caller) counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey(String);

impl CounterKey {
    /// Create a counter key from its three components.
    pub fn new(namespace: &str, route_prefix: &str, caller: &str) -> Self {
        Self(format!("{}:{}:{}", namespace, route_prefix, caller))
    }

    /// The key as stored.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CounterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Default route prefix: lowercase method and route template, e.g. `get:/users/:id`.
pub fn default_key_prefix(request: &RequestView<'_>) -> String {
    format!(
        "{}:{}",
        request.method.as_str().to_ascii_lowercase(),
        request.route
    )
}

/// Where the caller identity is read from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum CallerKeySource {
    /// A request header such as `x-api-key`, falling back to the peer address
    Header { name: String },
    /// The peer address of the connection
    #[default]
    RemoteAddr,
}

impl CallerKeySource {
    /// Build the resolver for this source.
    pub fn resolver(&self) -> KeyResolver {
        match self.clone() {
            CallerKeySource::Header { name } => Arc::new(move |request: &RequestView<'_>| {
                match request.header(&name) {
                    Some(value) if !value.is_empty() => value.to_string(),
                    _ => remote_addr_key(request),
                }
            }),
            CallerKeySource::RemoteAddr => Arc::new(remote_addr_key),
        }
    }
}

fn remote_addr_key(request: &RequestView<'_>) -> String {
    request
        .remote_addr()
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| ANONYMOUS_CALLER.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::ConnectInfo;
    use http::Request;
    use std::net::SocketAddr;

    fn parts(
        method: &str,
        uri: &str,
        api_key: Option<&str>,
        peer: Option<&str>,
    ) -> http::request::Parts {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(key) = api_key {
            builder = builder.header("x-api-key", key);
        }
        let (mut parts, _) = builder.body(()).unwrap().into_parts();
        if let Some(peer) = peer {
            let addr: SocketAddr = peer.parse().unwrap();
            parts.extensions.insert(ConnectInfo(addr));
        }
        parts
    }

    #[test]
    fn test_counter_key_format() {
        let key = CounterKey::new("ratekeeper", "get:/users/:id", "abc");
        assert_eq!(key.as_str(), "ratekeeper:get:/users/:id:abc");
        assert_eq!(key.to_string(), "ratekeeper:get:/users/:id:abc");
    }

    #[test]
    fn test_counter_key_equality() {
        let key1 = CounterKey::new("ns", "get:/a", "caller");
        let key2 = CounterKey::new("ns", "get:/a", "caller");
        let key3 = CounterKey::new("ns", "post:/a", "caller");

        assert_eq!(key1, key2);
        assert_ne!(key1, key3);
    }

    #[test]
    fn test_default_key_prefix_uses_route_template() {
        let parts = parts("GET", "/users/42", None, None);
        let view = RequestView::new(&parts, "/users/:id");

        assert_eq!(default_key_prefix(&view), "get:/users/:id");
    }

    #[test]
    fn test_header_caller_key() {
        let resolver = CallerKeySource::Header {
            name: "x-api-key".to_string(),
        }
        .resolver();

        let with_key = parts("GET", "/", Some("key-123"), Some("10.0.0.1:5000"));
        assert_eq!(resolver(&RequestView::new(&with_key, "/")), "key-123");

        let without_key = parts("GET", "/", None, Some("10.0.0.1:5000"));
        assert_eq!(resolver(&RequestView::new(&without_key, "/")), "10.0.0.1");

        let anonymous = parts("GET", "/", None, None);
        assert_eq!(resolver(&RequestView::new(&anonymous, "/")), ANONYMOUS_CALLER);
    }

    #[test]
    fn test_remote_addr_caller_key_ignores_port() {
        let resolver = CallerKeySource::RemoteAddr.resolver();

        let first = parts("GET", "/", None, Some("192.168.1.1:1000"));
        let second = parts("GET", "/", None, Some("192.168.1.1:2000"));

        assert_eq!(
            resolver(&RequestView::new(&first, "/")),
            resolver(&RequestView::new(&second, "/"))
        );
    }

    #[test]
    fn test_parse_caller_key_source() {
        let source: CallerKeySource =
            serde_yaml::from_str("source: header\nname: x-api-key\n").unwrap();
        assert_eq!(
            source,
            CallerKeySource::Header {
                name: "x-api-key".to_string()
            }
        );

        let source: CallerKeySource = serde_yaml::from_str("source: remote_addr\n").unwrap();
        assert_eq!(source, CallerKeySource::RemoteAddr);
        assert_eq!(CallerKeySource::default(), CallerKeySource::RemoteAddr);
    }
}

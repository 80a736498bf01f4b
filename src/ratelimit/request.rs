//! Read-only view of an inbound request.

use axum::extract::ConnectInfo;
use http::{request::Parts, Extensions, HeaderMap, Method, Uri};
use std::net::SocketAddr;

/// The parts of a request that rate limiting strategies may inspect.
///
/// `route` is the path template the router matched (e.g. `/users/:id`), or the
/// raw path when no template is known.
#[derive(Debug, Clone, Copy)]
pub struct RequestView<'a> {
    pub method: &'a Method,
    pub route: &'a str,
    pub uri: &'a Uri,
    pub headers: &'a HeaderMap,
    pub extensions: &'a Extensions,
}

impl<'a> RequestView<'a> {
    /// Build a view over request parts.
    pub fn new(parts: &'a Parts, route: &'a str) -> Self {
        Self {
            method: &parts.method,
            route,
            uri: &parts.uri,
            headers: &parts.headers,
            extensions: &parts.extensions,
        }
    }

    /// The peer address, when the server recorded connection info.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr)
    }

    /// A header value, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&'a str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

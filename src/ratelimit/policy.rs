//! Rate policies and per-route overrides.
//!
//! A route may switch rate limiting on or off and override the limit or the
//! window of the default policy. Routes are identified by HTTP method and path
//! template, the same pair the host router dispatches on.

use http::Method;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{RatekeeperError, Result};

/// Maximum number of requests allowed within a fixed window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatePolicy {
    /// Requests allowed per window
    pub limit: u64,
    /// Window length in seconds
    pub window: u64,
}

impl RatePolicy {
    /// Create a policy, rejecting zero limits and windows.
    pub fn new(limit: u64, window: u64) -> Result<Self> {
        let policy = Self { limit, window };
        policy.validate()?;
        Ok(policy)
    }

    /// Check that both limit and window are positive.
    pub fn validate(&self) -> Result<()> {
        if self.limit == 0 {
            return Err(RatekeeperError::Config(
                "rate limit must be a positive number of requests".to_string(),
            ));
        }
        if self.window == 0 {
            return Err(RatekeeperError::Config(
                "rate limit window must be a positive number of seconds".to_string(),
            ));
        }
        Ok(())
    }

    /// Apply a route's overrides on top of this policy.
    pub fn merge(self, settings: &RouteSettings) -> Self {
        Self {
            limit: settings.limit.unwrap_or(self.limit),
            window: settings.window.unwrap_or(self.window),
        }
    }
}

impl Default for RatePolicy {
    fn default() -> Self {
        Self {
            limit: 1000,
            window: 60,
        }
    }
}

/// Per-route rate limit settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteSettings {
    /// Whether the route is rate limited (falls back to the global default)
    #[serde(default)]
    pub enabled: Option<bool>,
    /// Override of the default limit
    #[serde(default)]
    pub limit: Option<u64>,
    /// Override of the default window in seconds
    #[serde(default)]
    pub window: Option<u64>,
}

impl RouteSettings {
    /// Settings that only toggle rate limiting.
    pub fn enabled(enabled: bool) -> Self {
        Self {
            enabled: Some(enabled),
            ..Self::default()
        }
    }

    /// Settings that enable rate limiting with the given limit and window.
    pub fn with_policy(limit: u64, window: u64) -> Self {
        Self {
            enabled: Some(true),
            limit: Some(limit),
            window: Some(window),
        }
    }

    /// Whether these settings enable rate limiting.
    pub fn is_enabled(&self, enabled_by_default: bool) -> bool {
        self.enabled.unwrap_or(enabled_by_default)
    }

    fn validate(&self) -> Result<()> {
        if self.limit == Some(0) || self.window == Some(0) {
            return Err(RatekeeperError::Config(
                "route overrides must use positive limit and window".to_string(),
            ));
        }
        Ok(())
    }
}

/// Route configuration entry as it appears in the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    /// HTTP method, case-insensitive
    pub method: String,
    /// Route path template, e.g. `/users/:id`
    pub path: String,
    /// Rate limit settings for this route
    #[serde(flatten)]
    pub settings: RouteSettings,
}

/// Lookup table from (method, path template) to route settings.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: HashMap<(Method, String), RouteSettings>,
}

impl RouteTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table from configuration entries.
    pub fn from_configs(configs: &[RouteConfig]) -> Result<Self> {
        let mut table = Self::new();
        for config in configs {
            let method = parse_method(&config.method)?;
            table.insert(method, &config.path, config.settings)?;
        }
        Ok(table)
    }

    /// Register settings for a route.
    pub fn insert(&mut self, method: Method, path: &str, settings: RouteSettings) -> Result<()> {
        settings.validate()?;
        self.routes.insert((method, path.to_string()), settings);
        Ok(())
    }

    /// Builder-style variant of [`RouteTable::insert`].
    pub fn with_route(
        mut self,
        method: Method,
        path: &str,
        settings: RouteSettings,
    ) -> Result<Self> {
        self.insert(method, path, settings)?;
        Ok(self)
    }

    /// Get the settings of a route, if any were configured.
    pub fn get(&self, method: &Method, path: &str) -> Option<&RouteSettings> {
        self.routes.get(&(method.clone(), path.to_string()))
    }

    /// Iterate over all configured routes.
    pub fn iter(&self) -> impl Iterator<Item = (&Method, &str, &RouteSettings)> {
        self.routes
            .iter()
            .map(|((method, path), settings)| (method, path.as_str(), settings))
    }

    /// Number of configured routes.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether no routes are configured.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Parse an HTTP method name, accepting any case.
pub fn parse_method(name: &str) -> Result<Method> {
    Method::from_bytes(name.to_ascii_uppercase().as_bytes())
        .map_err(|e| RatekeeperError::Config(format!("invalid HTTP method '{}': {}", name, e)))
}

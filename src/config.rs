//! Configuration management for Ratekeeper.

use http::Method;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tracing::info;

use crate::error::{RatekeeperError, Result};
use crate::ratelimit::{
    parse_method, CallerKeySource, FailurePolicy, RatePolicy, RouteConfig, RouteTable,
    DEFAULT_NAMESPACE,
};

/// Prefix of environment variables overriding file settings,
/// e.g. `RATEKEEPER__STORE__URL`.
pub const ENV_PREFIX: &str = "RATEKEEPER";

/// Main configuration for the Ratekeeper service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RatekeeperConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Routes served and their rate limit settings
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP server address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Which counter store backs the limiter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Shared Redis counters, for fleets of instances
    #[default]
    Redis,
    /// Process-local counters, for a single instance
    Memory,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store backend
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Sweep interval of expired in-memory counters in seconds
    #[serde(default = "default_purge_interval")]
    pub purge_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            url: default_redis_url(),
            purge_interval_secs: default_purge_interval(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_purge_interval() -> u64 {
    60
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Namespace prepended to every counter key
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// HTTP methods subject to rate limiting
    #[serde(default = "default_methods")]
    pub methods: Vec<String>,

    /// Emit `X-Rate-Limit-*` headers
    #[serde(default = "default_true")]
    pub headers_enabled: bool,

    /// Rate limit routes that carry no `enabled` setting
    #[serde(default)]
    pub enabled_for_all_routes: bool,

    /// Policy applied unless a route overrides it
    #[serde(default)]
    pub default_policy: RatePolicy,

    /// Behavior when the counter store fails
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Where the caller identity comes from
    #[serde(default)]
    pub caller_key: CallerKeySource,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            methods: default_methods(),
            headers_enabled: default_true(),
            enabled_for_all_routes: false,
            default_policy: RatePolicy::default(),
            failure_policy: FailurePolicy::default(),
            caller_key: CallerKeySource::default(),
        }
    }
}

impl RateLimitingConfig {
    /// The monitored methods as [`Method`] values.
    pub fn parsed_methods(&self) -> Result<Vec<Method>> {
        self.methods.iter().map(|m| parse_method(m)).collect()
    }
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_methods() -> Vec<String> {
    vec!["GET".to_string(), "POST".to_string(), "DELETE".to_string()]
}

fn default_true() -> bool {
    true
}

impl RatekeeperConfig {
    /// Load configuration from a file, overlaid with `RATEKEEPER__*`
    /// environment variables.
    ///
    /// The file format follows the extension (YAML, TOML or JSON).
    pub fn from_file(path: &str) -> Result<Self> {
        info!(path = %path, "Loading configuration");

        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .map_err(|e| RatekeeperError::Config(e.to_string()))?;

        let config: RatekeeperConfig = settings
            .try_deserialize()
            .map_err(|e| RatekeeperError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: RatekeeperConfig = serde_yaml::from_str(yaml)
            .map_err(|e| RatekeeperError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check policy values, methods and routes.
    pub fn validate(&self) -> Result<()> {
        self.rate_limiting.default_policy.validate()?;
        self.rate_limiting.parsed_methods()?;
        self.route_table()?;
        Ok(())
    }

    /// Build the route table from the configured routes.
    pub fn route_table(&self) -> Result<RouteTable> {
        RouteTable::from_configs(&self.routes)
    }
}

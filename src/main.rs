use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio::signal;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use ratekeeper::config::{RatekeeperConfig, StoreBackend};
use ratekeeper::error::RatekeeperError;
use ratekeeper::ratelimit::{
    MemoryWindowCounter, RateLimiter, RedisScriptClient, ScriptedWindowCounter, WindowCounter,
};
use ratekeeper::web::HttpServer;

/// Distributed fixed-window rate limiting for HTTP routes.
#[derive(Debug, Parser)]
#[command(name = "ratekeeper", version, about)]
struct Args {
    /// Path to the configuration file (YAML, TOML or JSON)
    #[arg(short, long)]
    config: Option<String>,

    /// Override the HTTP listen address
    #[arg(long)]
    http_addr: Option<SocketAddr>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    info!("Starting Ratekeeper Rate Limiting Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = match &args.config {
        Some(path) => RatekeeperConfig::from_file(path)?,
        None => RatekeeperConfig::default(),
    };
    if let Some(addr) = args.http_addr {
        config.server.http_addr = addr;
    }
    info!(
        http_addr = %config.server.http_addr,
        backend = ?config.store.backend,
        "Configuration loaded"
    );

    let counter = build_counter(&config).await?;

    let rate_limiter = RateLimiter::builder(counter)
        .with_config(&config.rate_limiting)?
        .routes(config.route_table()?)
        .build()?;
    info!(routes = rate_limiter.routes().len(), "Rate limiter initialized");

    let server = HttpServer::new(config.server.http_addr, Arc::new(rate_limiter));
    server.serve_with_shutdown(shutdown_signal()).await?;

    info!("Ratekeeper Rate Limiting Service stopped");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Create the window counter for the configured backend.
///
/// With Redis, failing to register the counter script aborts startup: no
/// request could be evaluated without it.
async fn build_counter(config: &RatekeeperConfig) -> anyhow::Result<Arc<dyn WindowCounter>> {
    match config.store.backend {
        StoreBackend::Redis => {
            let client = RedisScriptClient::connect(&config.store.url).await?;
            let counter = ScriptedWindowCounter::register(client)
                .await
                .map_err(RatekeeperError::ScriptRegistration)?;
            info!(url = %config.store.url, sha = %counter.handle(), "Using Redis window counter");
            Ok(Arc::new(counter))
        }
        StoreBackend::Memory => {
            let counter = Arc::new(MemoryWindowCounter::new());
            spawn_purge_task(counter.clone(), config.store.purge_interval_secs);
            info!("Using in-memory window counter");
            Ok(counter)
        }
    }
}

fn spawn_purge_task(counter: Arc<MemoryWindowCounter>, interval_secs: u64) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
        loop {
            interval.tick().await;
            let purged = counter.purge_expired();
            debug!(purged = purged, live = counter.len(), "Purged expired counters");
        }
    });
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}

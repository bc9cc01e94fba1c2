//! Guardpost Daemon - Guard Orchestration Gateway Server
//!
//! This is the main entry point for the guardpost daemon: it loads the
//! gateway configuration, wires the core components together, and serves
//! the inbound HTTP API until asked to stop.
//!
//! # Usage
//!
//! ```bash
//! # Start with the default config (~/.config/guardpost/gateway.toml)
//! guardpost-daemon
//!
//! # With an explicit config file
//! GUARDPOST_CONFIG=/etc/guardpost/gateway.toml guardpost-daemon
//!
//! # Verbose logging
//! RUST_LOG=debug guardpost-daemon
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: Graceful shutdown. In-flight dispatches finish,
//!   the probe loop stops, and the connection pool closes.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

use guardpost_core::cache::CacheStore;
use guardpost_core::config::{self, CacheBackend, GatewayConfig};
use guardpost_core::events::{EventBus, GatewayEvent};
use guardpost_core::health::HealthMonitor;
use guardpost_core::orchestrator::Orchestrator;
use guardpost_core::pool::PoolManager;
use guardpost_core::registry::ServiceRegistry;
use guardpost_core::router::RequestRouter;
use guardpost_core::server::{self, AppState};
use guardpost_core::transport::{GuardTransport, HttpGuardTransport};
use guardpost_core::{HttpKvCache, MemoryCache};

/// Initialize logging from `RUST_LOG`, defaulting to info for our crates
fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new("guardpost_daemon=info,guardpost_core=info")
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

/// Resolve the config file path: `GUARDPOST_CONFIG` wins, then the XDG
/// default location.
fn config_path() -> Option<PathBuf> {
    std::env::var("GUARDPOST_CONFIG")
        .ok()
        .map(PathBuf::from)
        .or_else(config::default_config_path)
}

/// Wait for SIGTERM or SIGINT
async fn shutdown_signal() {
    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("Failed to install SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown"),
        _ = sigint.recv() => info!("Received SIGINT, initiating shutdown"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    info!("Guardpost daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("PID: {}", std::process::id());

    let config = config::load_config_from_path(config_path()).context("Failed to load config")?;
    info!(source = %config.source(), guards = config.guards.len(), "Configuration resolved");
    if config.guards.is_empty() {
        warn!("No guards configured; every dispatch will return an empty response");
    }

    run(config).await
}

async fn run(config: GatewayConfig) -> Result<()> {
    // Shared infrastructure
    let pool = Arc::new(PoolManager::new(&config.pool).context("Failed to build pool")?);
    let bus = Arc::new(EventBus::new());

    let registry = Arc::new(ServiceRegistry::new());
    for guard in &config.guards {
        registry.register(guard.clone());
    }

    let transport: Arc<dyn GuardTransport> = Arc::new(
        HttpGuardTransport::from_pool(&pool).context("Failed to build guard transport")?,
    );

    let cache: Arc<dyn CacheStore> = match &config.cache_backend {
        CacheBackend::Memory => {
            // Keep stale-but-servable entries around for the fallback window.
            let evict_after = config.orchestrator.cache_ttl + config.orchestrator.stale_tolerance;
            Arc::new(MemoryCache::new(evict_after))
        }
        CacheBackend::Http(url) => {
            info!(url = %url, "Using HTTP key-value cache backend");
            Arc::new(HttpKvCache::new(
                pool.cache_client().context("Failed to get cache client")?,
                url.clone(),
            ))
        }
    };

    // Health monitoring and routing
    let monitor = Arc::new(HealthMonitor::new(
        Arc::clone(&registry),
        Arc::clone(&transport),
        Arc::clone(&bus),
        config.health.clone(),
    ));
    let probe_loop = monitor.start();

    let router = Arc::new(
        RequestRouter::new(Arc::clone(&registry), config.router.clone())
            .with_monitor(Arc::clone(&monitor)),
    );
    let router_feed = router.start(&bus);

    let orchestrator = Arc::new(Orchestrator::new(
        router,
        transport,
        cache,
        Arc::clone(&monitor),
        Arc::clone(&bus),
        config.orchestrator.clone(),
    ));

    // Inbound surface
    let state = Arc::new(AppState {
        orchestrator,
        registry,
        monitor: Arc::clone(&monitor),
    });
    let app = server::router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind))?;
    info!(bind = %config.bind, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // Orderly teardown: stop probing, tell subscribers, close the pool.
    info!("Shutting down...");
    monitor.stop();
    bus.publish(&GatewayEvent::Shutdown);
    pool.close();

    if let Err(e) = probe_loop.await {
        warn!(error = %e, "Probe loop did not stop cleanly");
    }
    if let Err(e) = router_feed.await {
        warn!(error = %e, "Router feed did not stop cleanly");
    }

    info!("Guardpost daemon stopped cleanly");
    Ok(())
}

//! Connection Pool Management
//!
//! Owns the long-lived outbound HTTP client handles used by everything
//! else: one pooled client per downstream protocol family (guard dispatch,
//! health probes) plus the cache client handle.
//!
//! `reqwest::Client` maintains its own keep-alive connection pool, so the
//! manager's job is sizing those pools from configuration, handing out
//! cheap shared handles, and providing a shutdown signal that in-flight
//! work can observe as a cancellation rather than a crash.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;

// ============================================================================
// Configuration
// ============================================================================

/// Sizing and keep-alive settings for the pooled clients
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Maximum idle keep-alive connections per downstream host
    pub max_idle_per_host: usize,
    /// How long an idle connection is kept alive
    pub keepalive: Duration,
    /// Connect timeout applied to all outbound calls
    pub connect_timeout: Duration,
    /// Connect timeout for probes (shorter: probes must be cheap)
    pub probe_connect_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 8,
            keepalive: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(5),
            probe_connect_timeout: Duration::from_secs(1),
        }
    }
}

// ============================================================================
// Pool Manager
// ============================================================================

/// Pool errors
#[derive(Clone, Debug, Error)]
pub enum PoolError {
    /// The pool has been closed by shutdown
    #[error("connection pool is closed")]
    Closed,
    /// A client could not be constructed
    #[error("failed to build HTTP client: {0}")]
    Build(String),
}

/// Owner of the shared outbound client handles
pub struct PoolManager {
    guard_client: reqwest::Client,
    probe_client: reqwest::Client,
    cache_client: reqwest::Client,
    closed: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

impl PoolManager {
    /// Build the pooled clients from configuration
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Build`] if a client cannot be constructed.
    pub fn new(config: &PoolConfig) -> Result<Self, PoolError> {
        let guard_client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.keepalive)
            .build()
            .map_err(|e| PoolError::Build(e.to_string()))?;

        let probe_client = reqwest::Client::builder()
            .connect_timeout(config.probe_connect_timeout)
            .pool_max_idle_per_host(2)
            .pool_idle_timeout(config.keepalive)
            .build()
            .map_err(|e| PoolError::Build(e.to_string()))?;

        let cache_client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.keepalive)
            .build()
            .map_err(|e| PoolError::Build(e.to_string()))?;

        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            guard_client,
            probe_client,
            cache_client,
            closed: AtomicBool::new(false),
            shutdown_tx,
        })
    }

    /// Shared handle for guard dispatch calls
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Closed`] after shutdown.
    pub fn guard_client(&self) -> Result<reqwest::Client, PoolError> {
        self.ensure_open()?;
        Ok(self.guard_client.clone())
    }

    /// Shared handle for health probes
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Closed`] after shutdown.
    pub fn probe_client(&self) -> Result<reqwest::Client, PoolError> {
        self.ensure_open()?;
        Ok(self.probe_client.clone())
    }

    /// Shared handle for the network cache backend
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Closed`] after shutdown.
    pub fn cache_client(&self) -> Result<reqwest::Client, PoolError> {
        self.ensure_open()?;
        Ok(self.cache_client.clone())
    }

    /// A receiver that flips to `true` when the pool closes.
    ///
    /// Background tasks select on this to observe shutdown as a
    /// cancellation.
    #[must_use]
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Whether `close()` has been called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close the pool.
    ///
    /// Idempotent and safe to call with requests in flight: handles
    /// already handed out keep working until dropped, new acquisitions
    /// fail with [`PoolError::Closed`], and the shutdown signal fires so
    /// long-running tasks can cancel.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.shutdown_tx.send(true);
        tracing::info!("Connection pool closed");
    }

    fn ensure_open(&self) -> Result<(), PoolError> {
        if self.is_closed() {
            Err(PoolError::Closed)
        } else {
            Ok(())
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

//! Guard Transport
//!
//! The network seam between the gateway and its guards. The orchestrator
//! and health monitor talk to guards only through [`GuardTransport`], which
//! keeps every network detail (and every test double) behind one trait.
//!
//! [`HttpGuardTransport`] is the production implementation: POST the
//! normalized payload to the guard's analysis endpoint, GET its liveness
//! endpoint for probes, both through the pooled clients owned by the
//! [`PoolManager`](crate::pool::PoolManager).

use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;

use crate::pool::{PoolError, PoolManager};
use crate::registry::GuardDescriptor;

// ============================================================================
// Transport Errors
// ============================================================================

/// Failures at the transport level
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The call did not complete within its deadline
    #[error("request timed out")]
    Timeout,

    /// A transient network fault (connect refused, reset, DNS, 5xx)
    #[error("transient network error: {0}")]
    Transient(String),

    /// The guard answered but the response violated its declared schema
    #[error("malformed response: {0}")]
    Malformed(String),
}

// ============================================================================
// Transport Trait
// ============================================================================

/// Network access to guard services
#[async_trait]
pub trait GuardTransport: Send + Sync {
    /// Send the payload to the guard's analysis endpoint.
    ///
    /// The deadline covers the whole call including body read. The
    /// returned value is the guard's decoded JSON response body.
    ///
    /// # Errors
    ///
    /// [`TransportError::Timeout`] past the deadline,
    /// [`TransportError::Transient`] for network faults and 5xx,
    /// [`TransportError::Malformed`] for undecodable or 4xx responses.
    async fn dispatch(
        &self,
        guard: &GuardDescriptor,
        payload: &serde_json::Value,
        deadline: Duration,
    ) -> Result<serde_json::Value, TransportError>;

    /// Hit the guard's liveness endpoint, returning the round-trip latency.
    ///
    /// # Errors
    ///
    /// Same taxonomy as [`Self::dispatch`]; probe failures are recorded by
    /// the health monitor and never surfaced to callers.
    async fn probe(
        &self,
        guard: &GuardDescriptor,
        deadline: Duration,
    ) -> Result<Duration, TransportError>;
}

// ============================================================================
// HTTP Transport
// ============================================================================

/// Production transport over the pooled HTTP clients
pub struct HttpGuardTransport {
    dispatch_client: reqwest::Client,
    probe_client: reqwest::Client,
}

impl HttpGuardTransport {
    /// Borrow the dispatch and probe client handles from the pool
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Closed`] if the pool has shut down.
    pub fn from_pool(pool: &PoolManager) -> Result<Self, PoolError> {
        Ok(Self {
            dispatch_client: pool.guard_client()?,
            probe_client: pool.probe_client()?,
        })
    }

    fn map_send_error(error: &reqwest::Error) -> TransportError {
        if error.is_timeout() {
            TransportError::Timeout
        } else {
            TransportError::Transient(error.to_string())
        }
    }
}

#[async_trait]
impl GuardTransport for HttpGuardTransport {
    async fn dispatch(
        &self,
        guard: &GuardDescriptor,
        payload: &serde_json::Value,
        deadline: Duration,
    ) -> Result<serde_json::Value, TransportError> {
        let request = self
            .dispatch_client
            .post(guard.dispatch_url())
            .header("x-guard-schema", &guard.schema_tag)
            .json(payload)
            .send();

        let response = match tokio::time::timeout(deadline, request).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(Self::map_send_error(&e)),
            Err(_) => return Err(TransportError::Timeout),
        };

        let status = response.status();
        if status.is_server_error() {
            return Err(TransportError::Transient(format!("status {status}")));
        }
        if !status.is_success() {
            // A guard rejecting our normalized payload is the guard
            // misbehaving, not a transient fault. Never retried.
            return Err(TransportError::Malformed(format!("status {status}")));
        }

        match tokio::time::timeout(deadline, response.json::<serde_json::Value>()).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(TransportError::Malformed(e.to_string())),
            Err(_) => Err(TransportError::Timeout),
        }
    }

    async fn probe(
        &self,
        guard: &GuardDescriptor,
        deadline: Duration,
    ) -> Result<Duration, TransportError> {
        let started = Instant::now();
        let request = self.probe_client.get(guard.probe_url()).send();

        let response = match tokio::time::timeout(deadline, request).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(Self::map_send_error(&e)),
            Err(_) => return Err(TransportError::Timeout),
        };

        if response.status().is_success() {
            Ok(started.elapsed())
        } else {
            Err(TransportError::Transient(format!(
                "status {}",
                response.status()
            )))
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

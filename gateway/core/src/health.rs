//! Guard Health Monitoring
//!
//! Tracks the liveness of every registered guard with a per-guard state
//! machine, driven by a background probe loop that runs on a fixed
//! (jittered) interval, fully independent of request traffic.
//!
//! # State Machine
//!
//! ```text
//! +---------+  fast probe   +---------+  slow probe   +----------+
//! | Unknown | ------------> | Healthy | <-----------> | Degraded |
//! +---------+               +---------+               +----------+
//!                                ^                         |
//!                   1 success    |    3 consecutive        | 3 consecutive
//!                                |    failures             | failures
//!                           +-------------+                |
//!                           | Unreachable | <--------------+
//!                           +-------------+
//! ```
//!
//! Entering `Unreachable` requires three consecutive failed probes so a
//! single transient error never flaps the state. Recovery always re-enters
//! through `Healthy` after one successful probe. A successful probe slower
//! than the configured latency threshold lands in `Degraded`. `Removed` is
//! terminal.
//!
//! # Thread Safety
//!
//! State is atomics in a `DashMap`: the monitor is the single writer,
//! readers (Router, Orchestrator) take snapshots and never wait on a probe.
//! Probe failures are recorded and published on the event bus but never
//! raised to callers.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::events::{EventBus, GatewayEvent};
use crate::registry::{GuardDescriptor, ServiceRegistry};
use crate::transport::GuardTransport;

// ============================================================================
// Health State
// ============================================================================

/// Health state of a guard
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    /// No probe has completed yet
    #[default]
    Unknown,
    /// Last probe succeeded within the latency threshold
    Healthy,
    /// Last probe succeeded but was slow; still eligible, low priority
    Degraded,
    /// Three consecutive probes failed; no live calls allowed
    Unreachable,
    /// Permanently removed; never probed or routed to again
    Removed,
}

impl HealthState {
    /// Whether the Router may plan a live call to this guard
    #[must_use]
    pub fn is_eligible(&self) -> bool {
        matches!(self, Self::Healthy | Self::Degraded)
    }

    fn as_u32(self) -> u32 {
        match self {
            Self::Unknown => 0,
            Self::Healthy => 1,
            Self::Degraded => 2,
            Self::Unreachable => 3,
            Self::Removed => 4,
        }
    }

    fn from_u32(value: u32) -> Self {
        match value {
            1 => Self::Healthy,
            2 => Self::Degraded,
            3 => Self::Unreachable,
            4 => Self::Removed,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unreachable => write!(f, "unreachable"),
            Self::Removed => write!(f, "removed"),
        }
    }
}

// ============================================================================
// Health Configuration
// ============================================================================

/// Configuration for the probe loop and state machine
#[derive(Clone, Debug)]
pub struct HealthConfig {
    /// Base interval between probe cycles
    pub probe_interval: Duration,
    /// Deadline for a single probe call
    pub probe_timeout: Duration,
    /// Successful probes slower than this mark the guard `Degraded`
    pub degraded_latency: Duration,
    /// Consecutive failures required to mark a guard `Unreachable`
    pub unreachable_after: u32,
    /// Fractional jitter applied to the probe interval (0.0 - 1.0)
    pub jitter: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(2),
            degraded_latency: Duration::from_millis(500),
            unreachable_after: 3,
            jitter: 0.1,
        }
    }
}

// ============================================================================
// Per-Guard Health
// ============================================================================

/// Single-writer health state for one guard
pub struct GuardHealth {
    /// Guard name
    pub name: String,
    /// Current state, stored as u32 for atomic access
    state: AtomicU32,
    /// Consecutive failed probes (reset on any success)
    consecutive_failures: AtomicU32,
    /// Unix millis of the last completed probe (0 = never)
    last_probe_ms: AtomicU64,
    /// Total probes run
    probes_run: AtomicU64,
    /// Total probes failed
    probes_failed: AtomicU64,
}

impl GuardHealth {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: AtomicU32::new(HealthState::Unknown.as_u32()),
            consecutive_failures: AtomicU32::new(0),
            last_probe_ms: AtomicU64::new(0),
            probes_run: AtomicU64::new(0),
            probes_failed: AtomicU64::new(0),
        }
    }

    /// Current state
    pub fn state(&self) -> HealthState {
        HealthState::from_u32(self.state.load(Ordering::Acquire))
    }

    /// Consecutive failed probes
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    fn stamp_probe(&self) {
        self.probes_run.fetch_add(1, Ordering::Relaxed);
        self.last_probe_ms
            .store(chrono::Utc::now().timestamp_millis() as u64, Ordering::Release);
    }

    /// Apply a successful probe. Returns the transition, if any.
    fn apply_success(&self, slow: bool) -> Option<(HealthState, HealthState)> {
        self.stamp_probe();
        self.consecutive_failures.store(0, Ordering::Release);

        let from = self.state();
        let to = match from {
            HealthState::Removed => return None,
            // Recovery and first contact always re-enter through Healthy.
            HealthState::Unknown | HealthState::Unreachable => HealthState::Healthy,
            HealthState::Healthy | HealthState::Degraded => {
                if slow {
                    HealthState::Degraded
                } else {
                    HealthState::Healthy
                }
            }
        };

        self.transition(from, to)
    }

    /// Apply a failed probe (or a reported dispatch transport failure).
    /// Returns the transition, if any.
    fn apply_failure(&self, unreachable_after: u32) -> Option<(HealthState, HealthState)> {
        self.stamp_probe();
        self.probes_failed.fetch_add(1, Ordering::Relaxed);

        let from = self.state();
        if from == HealthState::Removed {
            return None;
        }

        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures >= unreachable_after && from != HealthState::Unreachable {
            return self.transition(from, HealthState::Unreachable);
        }
        None
    }

    /// Mark the guard permanently removed. Returns the transition, if any.
    fn apply_removed(&self) -> Option<(HealthState, HealthState)> {
        let from = self.state();
        if from == HealthState::Removed {
            return None;
        }
        self.transition(from, HealthState::Removed)
    }

    fn transition(
        &self,
        from: HealthState,
        to: HealthState,
    ) -> Option<(HealthState, HealthState)> {
        if from == to {
            return None;
        }
        self.state.store(to.as_u32(), Ordering::Release);
        Some((from, to))
    }

    /// Immutable snapshot of this guard's health
    pub fn snapshot(&self) -> HealthSnapshot {
        let last_probe_ms = self.last_probe_ms.load(Ordering::Acquire);
        HealthSnapshot {
            guard: self.name.clone(),
            state: self.state(),
            consecutive_failures: self.consecutive_failures(),
            last_probe_ms: (last_probe_ms > 0).then_some(last_probe_ms),
            probes_run: self.probes_run.load(Ordering::Relaxed),
            probes_failed: self.probes_failed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of one guard's health
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    /// Guard name
    pub guard: String,
    /// Current state
    pub state: HealthState,
    /// Consecutive failed probes
    pub consecutive_failures: u32,
    /// Unix millis of the last completed probe
    pub last_probe_ms: Option<u64>,
    /// Total probes run
    pub probes_run: u64,
    /// Total probes failed
    pub probes_failed: u64,
}

// ============================================================================
// Health Monitor
// ============================================================================

/// Owns all per-guard health state and the background probe loop
pub struct HealthMonitor {
    guards: DashMap<String, Arc<GuardHealth>>,
    registry: Arc<ServiceRegistry>,
    transport: Arc<dyn GuardTransport>,
    bus: Arc<EventBus>,
    config: HealthConfig,
    shutdown_tx: watch::Sender<bool>,
}

impl HealthMonitor {
    /// Create a monitor over the given registry and transport
    #[must_use]
    pub fn new(
        registry: Arc<ServiceRegistry>,
        transport: Arc<dyn GuardTransport>,
        bus: Arc<EventBus>,
        config: HealthConfig,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            guards: DashMap::new(),
            registry,
            transport,
            bus,
            config,
            shutdown_tx,
        }
    }

    /// Start the background probe loop.
    ///
    /// Probes run immediately, then on the configured interval with jitter
    /// so guards are not probed in lockstep. The loop stops when
    /// [`Self::stop`] is called.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let monitor = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            tracing::info!(
                interval_ms = monitor.config.probe_interval.as_millis() as u64,
                "Health probe loop started"
            );
            monitor.run_probe_cycle().await;

            loop {
                let sleep = monitor.jittered_interval();
                tokio::select! {
                    () = tokio::time::sleep(sleep) => {
                        monitor.run_probe_cycle().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::info!("Health probe loop stopped");
        })
    }

    /// Stop the probe loop
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Run one probe cycle over every registered, non-removed guard.
    ///
    /// Guards are probed concurrently; the cycle completes when the
    /// slowest probe resolves or times out. Exposed so tests and the
    /// daemon can drive cycles deterministically.
    pub async fn run_probe_cycle(&self) {
        let descriptors: Vec<Arc<GuardDescriptor>> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|g| self.state_of(&g.name) != HealthState::Removed)
            .collect();

        let probes = descriptors.iter().map(|guard| {
            let transport = Arc::clone(&self.transport);
            let timeout = self.config.probe_timeout;
            async move {
                let result = transport.probe(guard, timeout).await;
                (Arc::clone(guard), result)
            }
        });

        for (guard, result) in futures::future::join_all(probes).await {
            self.record_probe(&guard.name, result);
        }
    }

    fn record_probe(
        &self,
        name: &str,
        result: Result<Duration, crate::transport::TransportError>,
    ) {
        let health = self.entry(name);

        let transition = match result {
            Ok(latency) => {
                let slow = latency > self.config.degraded_latency;
                self.bus.publish(&GatewayEvent::ProbeCompleted {
                    guard: name.to_string(),
                    succeeded: true,
                    latency_ms: latency.as_millis() as u64,
                });
                health.apply_success(slow)
            }
            Err(error) => {
                tracing::debug!(guard = %name, error = %error, "Probe failed");
                self.bus.publish(&GatewayEvent::ProbeCompleted {
                    guard: name.to_string(),
                    succeeded: false,
                    latency_ms: 0,
                });
                health.apply_failure(self.config.unreachable_after)
            }
        };

        self.publish_transition(name, transition);
    }

    /// Report a dispatch-level transport failure.
    ///
    /// Application traffic failing at the transport level counts toward
    /// the same consecutive-failure threshold as probe failures, so a
    /// guard that is down gets demoted between probe cycles. Malformed
    /// responses are not reported here: the guard is reachable, its
    /// payload is a logic error.
    pub fn record_dispatch_failure(&self, name: &str) {
        let health = self.entry(name);
        let transition = health.apply_failure(self.config.unreachable_after);
        self.publish_transition(name, transition);
    }

    /// Permanently remove a guard from probing and routing
    pub fn mark_removed(&self, name: &str) {
        let health = self.entry(name);
        let transition = health.apply_removed();
        self.publish_transition(name, transition);
    }

    /// Current state of a guard (`Unknown` if never probed)
    #[must_use]
    pub fn state_of(&self, name: &str) -> HealthState {
        self.guards.get(name).map_or(HealthState::Unknown, |h| h.state())
    }

    /// Snapshot of one guard's health, if tracked
    #[must_use]
    pub fn snapshot_of(&self, name: &str) -> Option<HealthSnapshot> {
        self.guards.get(name).map(|h| h.snapshot())
    }

    /// Snapshots for all tracked guards
    #[must_use]
    pub fn snapshots(&self) -> Vec<HealthSnapshot> {
        self.guards.iter().map(|e| e.value().snapshot()).collect()
    }

    fn entry(&self, name: &str) -> Arc<GuardHealth> {
        self.guards
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(GuardHealth::new(name)))
            .clone()
    }

    fn publish_transition(&self, name: &str, transition: Option<(HealthState, HealthState)>) {
        if let Some((from, to)) = transition {
            if to == HealthState::Unreachable {
                tracing::warn!(guard = %name, %from, %to, "Guard health transition");
            } else {
                tracing::info!(guard = %name, %from, %to, "Guard health transition");
            }
            self.bus.publish(&GatewayEvent::HealthChanged {
                guard: name.to_string(),
                from,
                to,
            });
        }
    }

    fn jittered_interval(&self) -> Duration {
        let base = self.config.probe_interval.as_millis() as f64;
        let jitter = self.config.jitter.clamp(0.0, 1.0);
        let factor = if jitter > 0.0 {
            rand::thread_rng().gen_range(1.0 - jitter..=1.0 + jitter)
        } else {
            1.0
        };
        Duration::from_millis((base * factor) as u64)
    }
}

// ============================================================================
// Tests
// ============================================================================

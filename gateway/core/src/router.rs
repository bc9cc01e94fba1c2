//! Request Routing
//!
//! Turns an inbound request's capability selector into a dispatch plan:
//! which guards to call live, with what per-guard timeout, and which
//! requested guards cannot be called at all right now.
//!
//! The router never blocks on a probe. It keeps a shadow map of health
//! states fed from [`HealthChanged`](crate::events::GatewayEvent) events on
//! the bus, so planning is a pure read over in-memory state.
//!
//! Degraded guards stay in the plan but get a reduced timeout: a slow
//! guard should not be able to drag a whole fan-out to the full deadline.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;

use crate::dispatch::CapabilitySelector;
use crate::events::{EventBus, GatewayEvent};
use crate::health::HealthState;
use crate::registry::{GuardDescriptor, ServiceRegistry};

// ============================================================================
// Configuration
// ============================================================================

/// Routing policy knobs
#[derive(Clone, Debug)]
pub struct RouterConfig {
    /// Per-guard timeout for healthy guards
    pub default_timeout: Duration,
    /// Fraction of the default timeout granted to degraded guards
    pub degraded_timeout_scale: f64,
    /// Lower bound on the degraded timeout
    pub degraded_timeout_floor: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(5),
            degraded_timeout_scale: 0.5,
            degraded_timeout_floor: Duration::from_millis(50),
        }
    }
}

// ============================================================================
// Dispatch Plan
// ============================================================================

/// One guard scheduled for a live call
#[derive(Clone, Debug)]
pub struct PlanEntry {
    /// The guard to call
    pub guard: Arc<GuardDescriptor>,
    /// Health state observed at planning time
    pub state: HealthState,
    /// Timeout for this guard's call
    pub timeout: Duration,
}

/// The routing decision for one request
#[derive(Clone, Debug, Default)]
pub struct DispatchPlan {
    /// Guards to call live, in registration order
    pub entries: Vec<PlanEntry>,
    /// Requested guards that are not currently callable (unreachable,
    /// removed, or not yet probed). The orchestrator resolves these from
    /// cache or marks them unavailable; they are never called live.
    pub unavailable: Vec<Arc<GuardDescriptor>>,
}

impl DispatchPlan {
    /// Whether the plan schedules no live calls and names no guards at all
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.unavailable.is_empty()
    }

    /// The largest per-guard timeout in the plan.
    ///
    /// The orchestrator uses this as the wall-clock ceiling for the whole
    /// fan-out: no single guard may extend the request past it.
    #[must_use]
    pub fn max_timeout(&self) -> Duration {
        self.entries
            .iter()
            .map(|e| e.timeout)
            .max()
            .unwrap_or(Duration::ZERO)
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Routing errors
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    /// A required guard was requested but no live call can be planned
    /// for it and no optional path remains
    #[error("no eligible guard (required: {})", required.join(", "))]
    NoEligibleGuard {
        /// The required guards that could not be planned
        required: Vec<String>,
    },
}

// ============================================================================
// Router
// ============================================================================

/// Builds dispatch plans from the registry and observed health
pub struct RequestRouter {
    registry: Arc<ServiceRegistry>,
    states: DashMap<String, HealthState>,
    monitor: Option<Arc<crate::health::HealthMonitor>>,
    config: RouterConfig,
}

impl RequestRouter {
    /// Create a router over the given registry
    #[must_use]
    pub fn new(registry: Arc<ServiceRegistry>, config: RouterConfig) -> Self {
        Self {
            registry,
            states: DashMap::new(),
            monitor: None,
            config,
        }
    }

    /// Fall back to the monitor's snapshot for guards the bus feed has
    /// not delivered a transition for yet (e.g. right after startup).
    #[must_use]
    pub fn with_monitor(mut self, monitor: Arc<crate::health::HealthMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Start consuming health transitions from the bus.
    ///
    /// Runs until the bus publishes [`GatewayEvent::Shutdown`] or drops
    /// the subscription.
    pub fn start(self: &Arc<Self>, bus: &EventBus) -> tokio::task::JoinHandle<()> {
        let router = Arc::clone(self);
        let mut subscription = bus.subscribe();
        tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                match event {
                    GatewayEvent::HealthChanged { guard, to, .. } => {
                        router.observe(&guard, to);
                    }
                    GatewayEvent::Shutdown => break,
                    _ => {}
                }
            }
            tracing::debug!("Router health feed stopped");
        })
    }

    /// Record a guard's health state in the shadow map
    pub fn observe(&self, guard: &str, state: HealthState) {
        self.states.insert(guard.to_string(), state);
    }

    /// Last observed state for a guard: the bus-fed shadow map first,
    /// then the monitor snapshot, `Unknown` otherwise
    #[must_use]
    pub fn observed_state(&self, guard: &str) -> HealthState {
        if let Some(state) = self.states.get(guard) {
            return *state.value();
        }
        self.monitor
            .as_ref()
            .map_or(HealthState::Unknown, |m| m.state_of(guard))
    }

    /// Build the dispatch plan for a capability selector.
    ///
    /// Candidates are taken from the registry in registration order:
    /// every guard for [`CapabilitySelector::All`], otherwise each guard
    /// declaring at least one requested capability. Eligible candidates
    /// (healthy or degraded) become plan entries, healthy ones first and
    /// degraded ones after them; the rest land in `unavailable` for the
    /// orchestrator's cache fallback.
    ///
    /// A selector matching no registered guard yields an empty plan, not
    /// an error.
    ///
    /// # Errors
    ///
    /// [`RouteError::NoEligibleGuard`] when the plan would schedule no
    /// live call and at least one uncallable candidate is required.
    pub fn route(&self, selector: &CapabilitySelector) -> Result<DispatchPlan, RouteError> {
        let candidates: Vec<Arc<GuardDescriptor>> = match selector {
            CapabilitySelector::All => self.registry.snapshot(),
            CapabilitySelector::Capabilities(caps) => self
                .registry
                .snapshot()
                .into_iter()
                .filter(|g| caps.iter().any(|c| g.has_capability(c)))
                .collect(),
        };

        let mut plan = DispatchPlan::default();
        for guard in candidates {
            let state = self.observed_state(&guard.name);
            if state.is_eligible() {
                let timeout = self.timeout_for(state);
                plan.entries.push(PlanEntry {
                    guard,
                    state,
                    timeout,
                });
            } else {
                plan.unavailable.push(guard);
            }
        }

        // Degraded guards go last; stable sort keeps registration order
        // within each group.
        plan.entries
            .sort_by_key(|e| e.state == HealthState::Degraded);

        if plan.entries.is_empty() {
            let required: Vec<String> = plan
                .unavailable
                .iter()
                .filter(|g| g.required)
                .map(|g| g.name.clone())
                .collect();
            if !required.is_empty() {
                return Err(RouteError::NoEligibleGuard { required });
            }
        }

        tracing::debug!(
            live = plan.entries.len(),
            unavailable = plan.unavailable.len(),
            "Built dispatch plan"
        );
        Ok(plan)
    }

    fn timeout_for(&self, state: HealthState) -> Duration {
        match state {
            HealthState::Degraded => {
                let scaled = self
                    .config
                    .default_timeout
                    .mul_f64(self.config.degraded_timeout_scale.clamp(0.0, 1.0));
                scaled.max(self.config.degraded_timeout_floor)
            }
            _ => self.config.default_timeout,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

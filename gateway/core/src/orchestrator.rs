//! Dispatch Orchestration
//!
//! Drives one inbound request end to end: route, fan out to the planned
//! guards under the global concurrency bound, apply the retry and cache
//! policies per guard, and merge everything into a unified response.
//!
//! # Fan-Out Model
//!
//! Every planned guard runs as its own spawned task holding a permit from
//! a shared semaphore, so total in-flight guard calls are bounded across
//! all concurrent requests, not per request. Task handles are
//! abort-on-drop: if the caller abandons `process()`, in-flight guard
//! calls are cancelled promptly, while guards that already finished keep
//! their cache writes (the write happens inside the guard task, before it
//! returns).
//!
//! # Per-Guard Policy
//!
//! ```text
//! fresh cache hit ── serve CacheFresh, no live call
//!       │miss/stale
//! live call ── ok ── write cache, serve Live
//!       │fail
//! retry once (Timeout/Transient only)
//!       │fail
//! stale cache within tolerance ── serve CacheStale
//!       │none
//! typed failure in the unified response
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::cache::{cache_key, CacheEntry, CacheStore};
use crate::dispatch::{
    DispatchOutcome, DispatchRequest, DispatchResult, GuardFailure, GuardStatus, ServedFrom,
    UnifiedResponse,
};
use crate::events::{EventBus, GatewayEvent};
use crate::health::HealthMonitor;
use crate::registry::GuardDescriptor;
use crate::router::{RequestRouter, RouteError};
use crate::transport::{GuardTransport, TransportError};

// ============================================================================
// Configuration
// ============================================================================

/// Orchestration policy knobs
#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    /// Global bound on in-flight guard calls across all requests
    pub max_concurrent: usize,
    /// How long a cached result counts as fresh
    pub cache_ttl: Duration,
    /// Extra window past the TTL in which a stale entry may still be
    /// served as a fallback for a failed live call
    pub stale_tolerance: Duration,
    /// Whether transient failures get one immediate retry
    pub retry_transient: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 16,
            cache_ttl: Duration::from_secs(60),
            stale_tolerance: Duration::from_secs(300),
            retry_transient: true,
        }
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

/// The fan-out engine
pub struct Orchestrator {
    router: Arc<RequestRouter>,
    transport: Arc<dyn GuardTransport>,
    cache: Arc<dyn CacheStore>,
    monitor: Arc<HealthMonitor>,
    bus: Arc<EventBus>,
    semaphore: Arc<Semaphore>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    /// Wire the orchestrator to its collaborators
    #[must_use]
    pub fn new(
        router: Arc<RequestRouter>,
        transport: Arc<dyn GuardTransport>,
        cache: Arc<dyn CacheStore>,
        monitor: Arc<HealthMonitor>,
        bus: Arc<EventBus>,
        config: OrchestratorConfig,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            router,
            transport,
            cache,
            monitor,
            bus,
            semaphore,
            config,
        }
    }

    /// Process one inbound request to completion.
    ///
    /// Per-guard failures are captured inside the response; the only
    /// error out of here is a routing refusal.
    ///
    /// # Errors
    ///
    /// [`RouteError::NoEligibleGuard`] when a required guard cannot be
    /// dispatched at all.
    pub async fn process(&self, request: DispatchRequest) -> Result<UnifiedResponse, RouteError> {
        let started = Instant::now();
        let plan = self.router.route(&request.selector)?;

        tracing::debug!(
            request_id = %request.request_id,
            live = plan.entries.len(),
            unavailable = plan.unavailable.len(),
            "Processing dispatch request"
        );

        let mut results: Vec<DispatchResult> =
            Vec::with_capacity(plan.entries.len() + plan.unavailable.len());

        // Guards with no live path are resolved from cache or reported
        // unavailable; they never consume a semaphore permit.
        for guard in &plan.unavailable {
            results.push(self.resolve_without_live_call(guard, &request.payload).await);
        }

        // Wall-clock ceiling for the whole fan-out: the caller's deadline
        // if given, otherwise the largest per-guard timeout times the
        // attempt count (a retried call legitimately takes two attempts).
        let attempts = u32::from(self.config.retry_transient) + 1;
        let ceiling = request.deadline.unwrap_or_else(|| plan.max_timeout() * attempts);

        let mut tasks: Vec<GuardTask> = plan
            .entries
            .into_iter()
            .map(|entry| {
                let deadline = request
                    .deadline
                    .map_or(entry.timeout, |d| entry.timeout.min(d));
                let call = GuardCall {
                    guard: Arc::clone(&entry.guard),
                    payload: request.payload.clone(),
                    deadline,
                    transport: Arc::clone(&self.transport),
                    cache: Arc::clone(&self.cache),
                    monitor: Arc::clone(&self.monitor),
                    bus: Arc::clone(&self.bus),
                    semaphore: Arc::clone(&self.semaphore),
                    retry_transient: self.config.retry_transient,
                    cache_ttl: self.config.cache_ttl,
                    stale_tolerance: self.config.stale_tolerance,
                };
                GuardTask {
                    name: entry.guard.name.clone(),
                    required: entry.guard.required,
                    handle: tokio::spawn(call.run()),
                }
            })
            .collect();

        for task in &mut tasks {
            results.push(task.collect(ceiling, started).await);
        }
        drop(tasks);

        for result in &results {
            let status = match &result.outcome {
                DispatchOutcome::Success { .. } => GuardStatus::Success,
                DispatchOutcome::Failure(failure) => GuardStatus::from(failure),
            };
            self.bus.publish(&GatewayEvent::GuardDispatched {
                guard: result.guard.clone(),
                request_id: request.request_id.0.clone(),
                status,
            });
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let response = UnifiedResponse::merge(request.request_id, &results, elapsed_ms);
        tracing::info!(
            request_id = %response.request_id,
            success = response.success,
            guards = response.guards.len(),
            elapsed_ms,
            "Dispatch complete"
        );
        Ok(response)
    }

    /// Resolve a guard that cannot be called live: fresh or stale cache
    /// within tolerance, otherwise a typed `Unavailable` failure.
    async fn resolve_without_live_call(
        &self,
        guard: &GuardDescriptor,
        payload: &serde_json::Value,
    ) -> DispatchResult {
        if guard.cache_eligible {
            let key = cache_key(&guard.name, payload);
            if let Some(entry) = read_entry(self.cache.as_ref(), &key, &guard.name).await {
                let window = self.config.cache_ttl + self.config.stale_tolerance;
                if entry.age() <= window {
                    let served_from = if entry.is_fresh(self.config.cache_ttl) {
                        ServedFrom::CacheFresh
                    } else {
                        self.bus.publish(&GatewayEvent::CacheStaleServed {
                            guard: guard.name.clone(),
                            age_ms: entry.age().as_millis() as u64,
                        });
                        ServedFrom::CacheStale
                    };
                    return DispatchResult {
                        guard: guard.name.clone(),
                        required: guard.required,
                        outcome: DispatchOutcome::Success {
                            value: entry.value,
                            served_from,
                            latency_ms: 0,
                        },
                    };
                }
            }
        }
        DispatchResult::failure(&guard.name, guard.required, GuardFailure::Unavailable)
    }
}

// ============================================================================
// Guard Tasks
// ============================================================================

/// Spawned per-guard call; aborts the task when dropped so abandoning
/// `process()` cancels in-flight guard calls.
struct GuardTask {
    name: String,
    required: bool,
    handle: JoinHandle<DispatchResult>,
}

impl GuardTask {
    /// Await the task's result, bounded by the fan-out ceiling. A late
    /// guard yields a `Timeout` result without blocking its siblings.
    async fn collect(&mut self, ceiling: Duration, started: Instant) -> DispatchResult {
        let remaining = ceiling.saturating_sub(started.elapsed());
        let joined = match tokio::time::timeout(remaining, &mut self.handle).await {
            Ok(joined) => joined,
            Err(_) => {
                self.handle.abort();
                return DispatchResult::failure(&self.name, self.required, GuardFailure::Timeout);
            }
        };

        joined.unwrap_or_else(|_| {
            DispatchResult::failure(
                &self.name,
                self.required,
                GuardFailure::Transient("guard task cancelled".to_string()),
            )
        })
    }
}

impl Drop for GuardTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Everything one spawned guard call needs, owned
struct GuardCall {
    guard: Arc<GuardDescriptor>,
    payload: serde_json::Value,
    deadline: Duration,
    transport: Arc<dyn GuardTransport>,
    cache: Arc<dyn CacheStore>,
    monitor: Arc<HealthMonitor>,
    bus: Arc<EventBus>,
    semaphore: Arc<Semaphore>,
    retry_transient: bool,
    cache_ttl: Duration,
    stale_tolerance: Duration,
}

impl GuardCall {
    async fn run(self) -> DispatchResult {
        let name = self.guard.name.clone();
        let required = self.guard.required;

        let Ok(permit) = Arc::clone(&self.semaphore).acquire_owned().await else {
            // Semaphore closed: the gateway is shutting down.
            return DispatchResult::failure(&name, required, GuardFailure::Unavailable);
        };

        let key = cache_key(&name, &self.payload);

        // Fresh cache hit short-circuits the live call entirely.
        if self.guard.cache_eligible {
            if let Some(entry) = read_entry(self.cache.as_ref(), &key, &name).await {
                if entry.is_fresh(self.cache_ttl) {
                    return DispatchResult {
                        guard: name,
                        required,
                        outcome: DispatchOutcome::Success {
                            value: entry.value,
                            served_from: ServedFrom::CacheFresh,
                            latency_ms: 0,
                        },
                    };
                }
            }
        }

        let started = Instant::now();
        let mut attempt = self
            .transport
            .dispatch(&self.guard, &self.payload, self.deadline)
            .await;

        if self.retry_transient {
            if let Err(error) = &attempt {
                if retryable(error) {
                    tracing::debug!(guard = %name, error = %error, "Retrying guard call");
                    attempt = self
                        .transport
                        .dispatch(&self.guard, &self.payload, self.deadline)
                        .await;
                }
            }
        }
        let latency_ms = started.elapsed().as_millis() as u64;
        drop(permit);

        match attempt {
            Ok(value) => {
                // The write happens here, inside the task, so a result
                // that arrived before the caller went away still lands in
                // the cache.
                if self.guard.cache_eligible {
                    let entry = CacheEntry::new(&name, value.clone());
                    if let Err(error) = self.cache.put(&key, entry).await {
                        tracing::warn!(guard = %name, error = %error, "Cache write failed");
                    }
                }
                DispatchResult {
                    guard: name,
                    required,
                    outcome: DispatchOutcome::Success {
                        value,
                        served_from: ServedFrom::Live,
                        latency_ms,
                    },
                }
            }
            Err(error) => {
                if retryable(&error) {
                    // Transport-level failures demote health between probe
                    // cycles; malformed bodies do not, the guard is up.
                    self.monitor.record_dispatch_failure(&name);
                }
                let failure = to_failure(error);

                if self.guard.cache_eligible {
                    if let Some(entry) = read_entry(self.cache.as_ref(), &key, &name).await {
                        if entry.age() <= self.cache_ttl + self.stale_tolerance {
                            let age_ms = entry.age().as_millis() as u64;
                            tracing::info!(guard = %name, age_ms, "Serving stale cached result");
                            self.bus.publish(&GatewayEvent::CacheStaleServed {
                                guard: name.clone(),
                                age_ms,
                            });
                            return DispatchResult {
                                guard: name,
                                required,
                                outcome: DispatchOutcome::Success {
                                    value: entry.value,
                                    served_from: ServedFrom::CacheStale,
                                    latency_ms: 0,
                                },
                            };
                        }
                    }
                }

                DispatchResult::failure(&name, required, failure)
            }
        }
    }
}

/// Read and verify a cache entry; a guard-name mismatch (crc collision)
/// and backend errors both count as a miss.
async fn read_entry(cache: &dyn CacheStore, key: &str, guard: &str) -> Option<CacheEntry> {
    match cache.get(key).await {
        Ok(Some(entry)) if entry.guard == guard => Some(entry),
        Ok(_) => None,
        Err(error) => {
            tracing::warn!(guard = %guard, error = %error, "Cache read failed");
            None
        }
    }
}

fn retryable(error: &TransportError) -> bool {
    matches!(error, TransportError::Timeout | TransportError::Transient(_))
}

fn to_failure(error: TransportError) -> GuardFailure {
    match error {
        TransportError::Timeout => GuardFailure::Timeout,
        TransportError::Transient(detail) => GuardFailure::Transient(detail),
        TransportError::Malformed(detail) => GuardFailure::Malformed(detail),
    }
}

// ============================================================================
// Tests
// ============================================================================

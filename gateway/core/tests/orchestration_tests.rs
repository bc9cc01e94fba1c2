//! End-to-End Orchestration Tests
//!
//! These tests exercise the whole pipeline through the public API:
//! registry + router + health monitor + orchestrator + cache, with a
//! scripted in-process transport standing in for real guard services.
//!
//! Covered behaviors:
//! - Fan-out, merge semantics, and optional-vs-required guards
//! - The probe-driven health state machine feeding routing
//! - Cache freshness, stale fallback, and write-once-per-result
//! - The global concurrency bound under heavy parallel load
//! - Caller cancellation not undoing committed cache writes

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::task::JoinSet;

use guardpost_core::cache::{cache_key, CacheEntry, CacheError, CacheStore, MemoryCache};
use guardpost_core::dispatch::{DispatchRequest, GuardStatus, ServedFrom};
use guardpost_core::events::EventBus;
use guardpost_core::health::{HealthConfig, HealthMonitor, HealthState};
use guardpost_core::orchestrator::{Orchestrator, OrchestratorConfig};
use guardpost_core::registry::{GuardDescriptor, ServiceRegistry};
use guardpost_core::router::{RequestRouter, RouterConfig};
use guardpost_core::transport::{GuardTransport, TransportError};

// =============================================================================
// Test Infrastructure
// =============================================================================

type Scripted = Result<serde_json::Value, TransportError>;

/// Transport with per-guard scripted dispatch and probe results.
///
/// Tracks in-flight dispatch concurrency so tests can assert the global
/// bound, and supports per-guard artificial latency.
struct ScriptedTransport {
    dispatches: Mutex<HashMap<String, VecDeque<Scripted>>>,
    probes: Mutex<HashMap<String, VecDeque<Result<Duration, TransportError>>>>,
    delays: Mutex<HashMap<String, Duration>>,
    default_dispatch: Mutex<Option<Scripted>>,
    dispatch_calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl ScriptedTransport {
    fn new() -> Self {
        Self {
            dispatches: Mutex::new(HashMap::new()),
            probes: Mutex::new(HashMap::new()),
            delays: Mutex::new(HashMap::new()),
            default_dispatch: Mutex::new(None),
            dispatch_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    fn script_dispatch(&self, guard: &str, results: Vec<Scripted>) {
        self.dispatches
            .lock()
            .insert(guard.to_string(), results.into());
    }

    fn script_probe(&self, guard: &str, results: Vec<Result<Duration, TransportError>>) {
        self.probes.lock().insert(guard.to_string(), results.into());
    }

    /// Answer every unscripted dispatch with this result
    fn set_default_dispatch(&self, result: Scripted) {
        *self.default_dispatch.lock() = Some(result);
    }

    fn set_delay(&self, guard: &str, delay: Duration) {
        self.delays.lock().insert(guard.to_string(), delay);
    }

    fn dispatch_calls(&self) -> usize {
        self.dispatch_calls.load(Ordering::SeqCst)
    }

    fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GuardTransport for ScriptedTransport {
    async fn dispatch(
        &self,
        guard: &GuardDescriptor,
        _payload: &serde_json::Value,
        deadline: Duration,
    ) -> Result<serde_json::Value, TransportError> {
        self.dispatch_calls.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);

        let delay = self.delays.lock().get(&guard.name).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay.min(deadline)).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Some(delay) = delay {
            if delay > deadline {
                return Err(TransportError::Timeout);
            }
        }

        let scripted = self
            .dispatches
            .lock()
            .get_mut(&guard.name)
            .and_then(VecDeque::pop_front);
        match scripted {
            Some(result) => result,
            None => self
                .default_dispatch
                .lock()
                .clone()
                .unwrap_or(Err(TransportError::Transient("unscripted".into()))),
        }
    }

    async fn probe(
        &self,
        guard: &GuardDescriptor,
        _deadline: Duration,
    ) -> Result<Duration, TransportError> {
        self.probes
            .lock()
            .get_mut(&guard.name)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Ok(Duration::from_millis(1)))
    }
}

/// Cache wrapper counting writes
struct CountingCache {
    inner: MemoryCache,
    puts: AtomicUsize,
}

impl CountingCache {
    fn new() -> Self {
        Self {
            inner: MemoryCache::new(Duration::from_secs(3600)),
            puts: AtomicUsize::new(0),
        }
    }

    fn puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CacheStore for CountingCache {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, entry: CacheEntry) -> Result<(), CacheError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.inner.put(key, entry).await
    }

    async fn invalidate(&self, key: &str) -> Result<(), CacheError> {
        self.inner.invalidate(key).await
    }
}

/// A fully wired gateway core over the scripted transport
struct Gateway {
    orchestrator: Arc<Orchestrator>,
    router: Arc<RequestRouter>,
    monitor: Arc<HealthMonitor>,
    transport: Arc<ScriptedTransport>,
    cache: Arc<CountingCache>,
    bus: Arc<EventBus>,
}

fn gateway(guards: Vec<GuardDescriptor>, config: OrchestratorConfig) -> Gateway {
    let registry = Arc::new(ServiceRegistry::new());
    for g in guards {
        registry.register(g);
    }
    let transport = Arc::new(ScriptedTransport::new());
    let cache = Arc::new(CountingCache::new());
    let bus = Arc::new(EventBus::new());
    let router = Arc::new(RequestRouter::new(
        Arc::clone(&registry),
        RouterConfig::default(),
    ));
    let monitor = Arc::new(HealthMonitor::new(
        registry,
        Arc::clone(&transport) as Arc<dyn GuardTransport>,
        Arc::clone(&bus),
        HealthConfig::default(),
    ));
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&router),
        Arc::clone(&transport) as Arc<dyn GuardTransport>,
        Arc::clone(&cache) as Arc<dyn CacheStore>,
        Arc::clone(&monitor),
        Arc::clone(&bus),
        config,
    ));
    Gateway {
        orchestrator,
        router,
        monitor,
        transport,
        cache,
        bus,
    }
}

fn guard(name: &str, caps: &[&str]) -> GuardDescriptor {
    GuardDescriptor::new(name, format!("http://{name}:9000"))
        .with_capabilities(caps.iter().map(ToString::to_string).collect())
}

// =============================================================================
// Merge Semantics
// =============================================================================

#[tokio::test]
async fn test_selector_matching_nothing_yields_empty_success() {
    let gw = gateway(vec![guard("a", &["x"])], OrchestratorConfig::default());
    gw.router.observe("a", HealthState::Healthy);

    let resp = gw
        .orchestrator
        .process(DispatchRequest::new(json!({})).with_capabilities(vec!["unknown".into()]))
        .await
        .unwrap();

    assert!(resp.success);
    assert!(resp.guards.is_empty());
}

#[tokio::test]
async fn test_optional_unreachable_guard_does_not_block_success() {
    let gw = gateway(
        vec![guard("a", &["x"]), guard("b", &["x"])],
        OrchestratorConfig::default(),
    );
    gw.router.observe("a", HealthState::Healthy);
    gw.router.observe("b", HealthState::Unreachable);
    gw.transport.script_dispatch("a", vec![Ok(json!({"ok": 1}))]);

    let resp = gw
        .orchestrator
        .process(DispatchRequest::new(json!({"text": "t"})))
        .await
        .unwrap();

    assert!(resp.success, "optional unavailable guard must not block");
    assert_eq!(resp.guards["a"].status, GuardStatus::Success);
    assert_eq!(resp.guards["b"].status, GuardStatus::Unavailable);
}

#[tokio::test]
async fn test_required_guard_failure_blocks_success() {
    let gw = gateway(
        vec![guard("a", &["x"]).required(), guard("b", &["x"])],
        OrchestratorConfig::default(),
    );
    gw.router.observe("a", HealthState::Healthy);
    gw.router.observe("b", HealthState::Healthy);
    gw.transport.script_dispatch(
        "a",
        vec![
            Err(TransportError::Malformed("garbage".into())),
        ],
    );
    gw.transport.script_dispatch("b", vec![Ok(json!(2))]);

    let resp = gw
        .orchestrator
        .process(DispatchRequest::new(json!({})))
        .await
        .unwrap();

    assert!(!resp.success);
    assert_eq!(resp.guards["a"].status, GuardStatus::MalformedResponse);
    assert_eq!(resp.guards["b"].status, GuardStatus::Success);
}

// =============================================================================
// Health State Machine Feeding Routing
// =============================================================================

#[tokio::test]
async fn test_three_failed_probes_exclude_guard_until_recovery() {
    let gw = gateway(vec![guard("a", &["x"])], OrchestratorConfig::default());
    let feed = gw.router.start(&gw.bus);

    gw.transport.script_probe(
        "a",
        vec![
            Ok(Duration::from_millis(1)),
            Err(TransportError::Timeout),
            Err(TransportError::Timeout),
            Err(TransportError::Timeout),
            Ok(Duration::from_millis(1)),
        ],
    );

    // Healthy after the first probe.
    gw.monitor.run_probe_cycle().await;
    wait_for_state(&gw.router, "a", HealthState::Healthy).await;

    // Three consecutive failures demote to Unreachable.
    for _ in 0..3 {
        gw.monitor.run_probe_cycle().await;
    }
    wait_for_state(&gw.router, "a", HealthState::Unreachable).await;

    let resp = gw
        .orchestrator
        .process(DispatchRequest::new(json!({})))
        .await
        .unwrap();
    assert_eq!(resp.guards["a"].status, GuardStatus::Unavailable);
    assert_eq!(gw.transport.dispatch_calls(), 0, "no live call while down");

    // One successful probe restores routing.
    gw.monitor.run_probe_cycle().await;
    wait_for_state(&gw.router, "a", HealthState::Healthy).await;

    gw.transport.script_dispatch("a", vec![Ok(json!(1))]);
    let resp = gw
        .orchestrator
        .process(DispatchRequest::new(json!({})))
        .await
        .unwrap();
    assert_eq!(resp.guards["a"].status, GuardStatus::Success);

    gw.bus.publish(&guardpost_core::events::GatewayEvent::Shutdown);
    let _ = tokio::time::timeout(Duration::from_secs(1), feed).await;
}

async fn wait_for_state(router: &RequestRouter, guard: &str, state: HealthState) {
    for _ in 0..100 {
        if router.observed_state(guard) == state {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("router never observed {guard} as {state}");
}

#[tokio::test]
async fn test_repeated_dispatch_failures_demote_health() {
    let gw = gateway(vec![guard("a", &["x"])], OrchestratorConfig::default());
    gw.router.observe("a", HealthState::Healthy);
    gw.transport
        .set_default_dispatch(Err(TransportError::Transient("refused".into())));

    for _ in 0..3 {
        let resp = gw
            .orchestrator
            .process(DispatchRequest::new(json!({})))
            .await
            .unwrap();
        assert_eq!(resp.guards["a"].status, GuardStatus::TransientError);
    }

    assert_eq!(gw.monitor.state_of("a"), HealthState::Unreachable);
}

// =============================================================================
// Cache Behavior
// =============================================================================

#[tokio::test]
async fn test_cached_value_within_ttl_is_bit_identical() {
    let gw = gateway(vec![guard("a", &["x"])], OrchestratorConfig::default());
    gw.router.observe("a", HealthState::Healthy);

    let value = json!({"score": 0.123456789, "labels": ["a", "b"], "nested": {"k": null}});
    gw.transport.script_dispatch("a", vec![Ok(value.clone())]);

    let payload = json!({"text": "identical"});
    let first = gw
        .orchestrator
        .process(DispatchRequest::new(payload.clone()))
        .await
        .unwrap();
    assert_eq!(first.guards["a"].served_from, Some(ServedFrom::Live));

    // Second call: no script left, so a live call would fail. It must be
    // served from cache with the exact bytes of the first result.
    let second = gw
        .orchestrator
        .process(DispatchRequest::new(payload))
        .await
        .unwrap();
    assert_eq!(second.guards["a"].served_from, Some(ServedFrom::CacheFresh));
    assert_eq!(second.guards["a"].result, Some(value));
    assert_eq!(gw.transport.dispatch_calls(), 1);
}

#[tokio::test]
async fn test_timeout_then_retry_success_writes_cache_once() {
    let gw = gateway(vec![guard("a", &["x"])], OrchestratorConfig::default());
    gw.router.observe("a", HealthState::Healthy);
    gw.transport.script_dispatch(
        "a",
        vec![Err(TransportError::Timeout), Ok(json!({"late": true}))],
    );

    let resp = gw
        .orchestrator
        .process(DispatchRequest::new(json!({"text": "retry"})))
        .await
        .unwrap();

    assert!(resp.success);
    assert_eq!(resp.guards["a"].status, GuardStatus::Success);
    assert_eq!(resp.guards["a"].served_from, Some(ServedFrom::Live));
    assert_eq!(gw.transport.dispatch_calls(), 2, "exactly one retry");
    assert_eq!(gw.cache.puts(), 1, "exactly one cache write");
}

#[tokio::test]
async fn test_stale_entry_served_only_within_tolerance() {
    let config = OrchestratorConfig {
        cache_ttl: Duration::from_secs(1),
        stale_tolerance: Duration::from_secs(10),
        ..OrchestratorConfig::default()
    };
    let gw = gateway(vec![guard("a", &["x"])], config);
    gw.router.observe("a", HealthState::Healthy);
    gw.transport
        .set_default_dispatch(Err(TransportError::Timeout));

    let payload = json!({"text": "s"});
    let key = cache_key("a", &payload);

    // Inside the tolerance window: served stale.
    let mut entry = CacheEntry::new("a", json!({"old": 1}));
    entry.stored_at_ms -= 5_000;
    gw.cache.put(&key, entry).await.unwrap();

    let resp = gw
        .orchestrator
        .process(DispatchRequest::new(payload.clone()))
        .await
        .unwrap();
    assert_eq!(resp.guards["a"].served_from, Some(ServedFrom::CacheStale));

    // Past the tolerance window: the failure stands.
    let mut entry = CacheEntry::new("a", json!({"old": 2}));
    entry.stored_at_ms -= 60_000;
    gw.cache.put(&key, entry).await.unwrap();

    let resp = gw
        .orchestrator
        .process(DispatchRequest::new(payload))
        .await
        .unwrap();
    assert_eq!(resp.guards["a"].status, GuardStatus::Timeout);
}

// =============================================================================
// Concurrency and Cancellation
// =============================================================================

#[tokio::test]
async fn test_in_flight_calls_never_exceed_bound_under_load() {
    let guards: Vec<GuardDescriptor> = (0..5).map(|i| guard(&format!("g{i}"), &["x"])).collect();
    let config = OrchestratorConfig {
        max_concurrent: 8,
        ..OrchestratorConfig::default()
    };
    let gw = gateway(guards, config);
    gw.transport.set_default_dispatch(Ok(json!({"ok": true})));
    for i in 0..5 {
        let name = format!("g{i}");
        gw.router.observe(&name, HealthState::Healthy);
        gw.transport.set_delay(&name, Duration::from_millis(3));
    }

    let mut inbound = JoinSet::new();
    for n in 0..50 {
        let orchestrator = Arc::clone(&gw.orchestrator);
        inbound.spawn(async move {
            // Distinct payloads so the cache never short-circuits.
            orchestrator
                .process(DispatchRequest::new(json!({"n": n})))
                .await
                .unwrap()
        });
    }

    let mut completed = 0;
    while let Some(result) = inbound.join_next().await {
        let resp = result.unwrap();
        assert!(resp.success);
        assert_eq!(resp.guards.len(), 5);
        completed += 1;
    }
    assert_eq!(completed, 50);
    assert!(
        gw.transport.peak_in_flight() <= 8,
        "peak in-flight {} exceeded the configured bound",
        gw.transport.peak_in_flight()
    );
}

#[tokio::test]
async fn test_cancellation_preserves_committed_sibling_cache_write() {
    let gw = gateway(
        vec![guard("fast", &["x"]), guard("slow", &["x"])],
        OrchestratorConfig::default(),
    );
    gw.router.observe("fast", HealthState::Healthy);
    gw.router.observe("slow", HealthState::Healthy);
    gw.transport
        .script_dispatch("fast", vec![Ok(json!({"done": true}))]);
    gw.transport.script_dispatch("slow", vec![Ok(json!(0))]);
    gw.transport.set_delay("slow", Duration::from_secs(30));

    let payload = json!({"text": "c"});
    let orchestrator = Arc::clone(&gw.orchestrator);
    let inbound = tokio::spawn({
        let payload = payload.clone();
        async move { orchestrator.process(DispatchRequest::new(payload)).await }
    });

    // Give the fast guard time to finish and commit its write, then
    // abandon the caller while the slow guard is still in flight.
    tokio::time::sleep(Duration::from_millis(100)).await;
    inbound.abort();
    let _ = inbound.await;

    let fast_key = cache_key("fast", &payload);
    let entry = gw.cache.get(&fast_key).await.unwrap();
    assert_eq!(
        entry.map(|e| e.value),
        Some(json!({"done": true})),
        "the committed write must survive caller cancellation"
    );
}

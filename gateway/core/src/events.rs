//! Gateway Events
//!
//! In-process publish/subscribe used to decouple health-state changes from
//! routing decisions and to emit observability events. Single process, no
//! external transport.
//!
//! # Delivery Semantics
//!
//! Best-effort. Each subscriber gets its own bounded channel and
//! publication uses `try_send`: a slow subscriber drops events (counted)
//! instead of stalling the publisher. The Health Monitor's probe loop can
//! therefore never block on a misbehaving subscriber.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::dispatch::GuardStatus;
use crate::health::HealthState;

/// Default per-subscriber channel capacity
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

// ============================================================================
// Events
// ============================================================================

/// Events published on the gateway bus
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum GatewayEvent {
    /// A guard's health state transitioned
    HealthChanged {
        /// Guard name
        guard: String,
        /// State before the transition
        from: HealthState,
        /// State after the transition
        to: HealthState,
    },

    /// A probe cycle touched a guard (published whether or not the state
    /// changed)
    ProbeCompleted {
        /// Guard name
        guard: String,
        /// Whether the probe succeeded
        succeeded: bool,
        /// Probe round-trip latency in milliseconds
        latency_ms: u64,
    },

    /// A guard produced a final per-call result
    GuardDispatched {
        /// Guard name
        guard: String,
        /// Inbound request this dispatch belonged to
        request_id: String,
        /// Final per-guard status
        status: GuardStatus,
    },

    /// A stale cached value was served because the live call failed
    CacheStaleServed {
        /// Guard name
        guard: String,
        /// Age of the served entry in milliseconds
        age_ms: u64,
    },

    /// The gateway is shutting down
    Shutdown,
}

// ============================================================================
// Event Bus
// ============================================================================

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<GatewayEvent>,
}

/// A handle to a bus subscription.
///
/// Dropping the subscription detaches it; the bus prunes closed
/// subscribers on the next publish.
pub struct Subscription {
    rx: mpsc::Receiver<GatewayEvent>,
}

impl Subscription {
    /// Receive the next event, or `None` once the bus is gone
    pub async fn recv(&mut self) -> Option<GatewayEvent> {
        self.rx.recv().await
    }

    /// Non-blocking receive
    ///
    /// # Errors
    ///
    /// Returns the underlying channel error when empty or disconnected.
    pub fn try_recv(&mut self) -> Result<GatewayEvent, mpsc::error::TryRecvError> {
        self.rx.try_recv()
    }
}

/// The in-process event bus
pub struct EventBus {
    subscribers: RwLock<Vec<Subscriber>>,
    next_id: AtomicU64,
    capacity: usize,
    dropped: AtomicU64,
}

impl EventBus {
    /// Create a bus with the default per-subscriber capacity
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SUBSCRIBER_CAPACITY)
    }

    /// Create a bus with a custom per-subscriber channel capacity
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(0),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Subscribe to all events
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.write().push(Subscriber { id, tx });
        Subscription { rx }
    }

    /// Publish an event to every subscriber.
    ///
    /// Never blocks. Full subscriber channels drop the event; closed
    /// subscribers are pruned.
    pub fn publish(&self, event: &GatewayEvent) {
        let mut closed: Vec<u64> = Vec::new();
        {
            let subscribers = self.subscribers.read();
            for sub in subscribers.iter() {
                match sub.tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(subscriber = sub.id, "Slow subscriber, event dropped");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        closed.push(sub.id);
                    }
                }
            }
        }

        if !closed.is_empty() {
            self.subscribers
                .write()
                .retain(|s| !closed.contains(&s.id));
        }
    }

    /// Number of live subscribers
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Total events dropped on full subscriber channels
    #[must_use]
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn health_event(guard: &str) -> GatewayEvent {
        GatewayEvent::HealthChanged {
            guard: guard.to_string(),
            from: HealthState::Unknown,
            to: HealthState::Healthy,
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(&health_event("g"));

        assert_eq!(a.recv().await, Some(health_event("g")));
        assert_eq!(b.recv().await, Some(health_event("g")));
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_without_blocking() {
        let bus = EventBus::with_capacity(2);
        let mut slow = bus.subscribe();

        // Fill the channel past capacity; publish must never block.
        for _ in 0..5 {
            bus.publish(&health_event("g"));
        }

        assert_eq!(bus.dropped_events(), 3);

        // The two buffered events are still deliverable.
        assert!(slow.try_recv().is_ok());
        assert!(slow.try_recv().is_ok());
        assert!(slow.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_closed_subscribers_are_pruned() {
        let bus = EventBus::new();
        let a = bus.subscribe();
        let _b = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        drop(a);
        bus.publish(&GatewayEvent::Shutdown);
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_no_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.publish(&GatewayEvent::Shutdown);
        assert_eq!(bus.dropped_events(), 0);
    }
}

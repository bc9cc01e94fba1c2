//! Guardpost Core - Guard Orchestration Gateway
//!
//! This crate provides the core orchestration logic for guardpost: a
//! gateway that fronts a fleet of guard services (content analyzers with
//! a shared HTTP contract), fans each inbound request out to the relevant
//! guards concurrently, and merges every per-guard outcome into one
//! unified response. It is completely independent of how the gateway is
//! hosted; the daemon crate wires it to a listener and a lifecycle.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       Inbound HTTP                           │
//! │            POST /v1/dispatch    GET /v1/guards               │
//! └───────────────────────────┬──────────────────────────────────┘
//!                             │
//! ┌───────────────────────────┼──────────────────────────────────┐
//! │                      GUARDPOST CORE                          │
//! │  ┌────────────────────────┴───────────────────────────────┐  │
//! │  │                    Orchestrator                        │  │
//! │  │   fan-out · retry · cache fallback · response merge    │  │
//! │  └──┬──────────────┬──────────────┬──────────────┬────────┘  │
//! │     │              │              │              │           │
//! │  ┌──┴─────┐  ┌─────┴────┐  ┌──────┴─────┐  ┌─────┴───────┐  │
//! │  │ Router │  │  Health  │  │   Cache    │  │  Transport  │  │
//! │  │        │  │ Monitor  │  │            │  │   (pooled)  │  │
//! │  └──┬─────┘  └─────┬────┘  └────────────┘  └─────┬───────┘  │
//! │     │              │                             │           │
//! │     └─── event bus ┘                             │           │
//! └──────────────────────────────────────────────────┼───────────┘
//!                                                    │
//!                              ┌─────────────────────┴──────────┐
//!                              │      Guard services            │
//!                              │  POST /analyze  GET /healthz   │
//!                              └────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`Orchestrator`]: drives one request end to end
//! - [`RequestRouter`]: health-aware dispatch planning
//! - [`HealthMonitor`]: background probe loop and per-guard state machine
//! - [`ServiceRegistry`]: the set of known guards
//! - [`EventBus`]: in-process pub/sub decoupling health from routing
//! - [`UnifiedResponse`]: the merged per-guard result map
//!
//! # Module Overview
//!
//! - [`cache`]: result caching with fresh/stale windows
//! - [`config`]: TOML configuration with environment overrides
//! - [`dispatch`]: request/response vocabulary
//! - [`events`]: the in-process event bus
//! - [`health`]: guard health monitoring
//! - [`orchestrator`]: the fan-out engine
//! - [`pool`]: outbound connection pool management
//! - [`registry`]: guard registration and lookup
//! - [`router`]: dispatch planning
//! - [`server`]: the gateway's own HTTP surface
//! - [`transport`]: the network seam to guard services

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cache;
pub mod config;
pub mod dispatch;
pub mod events;
pub mod health;
pub mod orchestrator;
pub mod pool;
pub mod registry;
pub mod router;
pub mod server;
pub mod transport;

// Re-exports for convenience
pub use cache::{cache_key, CacheEntry, CacheError, CacheStore, HttpKvCache, MemoryCache};
pub use config::{
    default_config_path, load_config, load_config_from_path, CacheBackend, ConfigError,
    ConfigSource, GatewayConfig, GatewayToml,
};
pub use dispatch::{
    CapabilitySelector, DispatchOutcome, DispatchRequest, DispatchResult, GuardFailure,
    GuardReport, GuardStatus, RequestId, ServedFrom, UnifiedResponse,
};
pub use events::{EventBus, GatewayEvent, Subscription};
pub use health::{GuardHealth, HealthConfig, HealthMonitor, HealthSnapshot, HealthState};
pub use orchestrator::{Orchestrator, OrchestratorConfig};
pub use pool::{PoolConfig, PoolError, PoolManager};
pub use registry::{GuardDescriptor, RegistryError, ServiceRegistry};
pub use router::{DispatchPlan, PlanEntry, RequestRouter, RouteError, RouterConfig};
pub use server::{AppState, DispatchBody, ErrorBody, GuardInfo};
pub use transport::{GuardTransport, HttpGuardTransport, TransportError};

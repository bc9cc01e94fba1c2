//! TOML Configuration File Support
//!
//! Centralized configuration loading for the gateway, supporting a TOML
//! configuration file at `~/.config/guardpost/gateway.toml`.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. Environment variables
//! 2. TOML configuration file
//! 3. Default values
//!
//! # XDG Base Directory Compliance
//!
//! The configuration file follows XDG Base Directory specification:
//! - `$XDG_CONFIG_HOME/guardpost/gateway.toml` (typically `~/.config/guardpost/gateway.toml`)
//!
//! # Example Configuration
//!
//! ```toml
//! [server]
//! bind = "127.0.0.1:8600"
//!
//! [[guards]]
//! name = "toxicity"
//! url = "http://toxicity:9000"
//! capabilities = ["toxicity"]
//! required = true
//!
//! [[guards]]
//! name = "spam"
//! url = "http://spam:9000"
//! capabilities = ["spam", "ads"]
//!
//! [probe]
//! interval_secs = 10
//! timeout_ms = 2000
//! degraded_latency_ms = 500
//! unreachable_after = 3
//!
//! [routing]
//! guard_timeout_ms = 5000
//! degraded_timeout_scale = 0.5
//!
//! [dispatch]
//! max_concurrent = 16
//! cache_ttl_secs = 60
//! stale_tolerance_secs = 300
//! retry_transient = true
//!
//! [pool]
//! max_idle_per_host = 8
//! keepalive_secs = 60
//!
//! [cache]
//! backend = "memory"
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::health::HealthConfig;
use crate::orchestrator::OrchestratorConfig;
use crate::pool::PoolConfig;
use crate::registry::GuardDescriptor;
use crate::router::RouterConfig;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// One guard entry in the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardToml {
    /// Unique guard name
    pub name: String,

    /// Base URL of the guard service
    pub url: String,

    /// Capabilities this guard serves
    pub capabilities: Vec<String>,

    /// Declared request/response schema tag
    pub schema_tag: Option<String>,

    /// Whether this guard must answer for overall success
    pub required: Option<bool>,

    /// Whether results from this guard may be cached
    pub cache_eligible: Option<bool>,
}

/// Probe section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeToml {
    /// Base interval between probe cycles in seconds
    pub interval_secs: Option<u64>,

    /// Per-probe deadline in milliseconds
    pub timeout_ms: Option<u64>,

    /// Successful probes slower than this mark the guard degraded
    pub degraded_latency_ms: Option<u64>,

    /// Consecutive failures before a guard is unreachable
    pub unreachable_after: Option<u32>,

    /// Fractional jitter on the probe interval (0.0 - 1.0)
    pub jitter: Option<f64>,
}

/// Routing section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingToml {
    /// Per-guard timeout for healthy guards in milliseconds
    pub guard_timeout_ms: Option<u64>,

    /// Fraction of the timeout granted to degraded guards
    pub degraded_timeout_scale: Option<f64>,

    /// Lower bound on the degraded timeout in milliseconds
    pub degraded_timeout_floor_ms: Option<u64>,
}

/// Dispatch section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchToml {
    /// Global bound on in-flight guard calls
    pub max_concurrent: Option<usize>,

    /// Cache freshness window in seconds
    pub cache_ttl_secs: Option<u64>,

    /// Stale-serve window past the TTL in seconds
    pub stale_tolerance_secs: Option<u64>,

    /// Whether transient failures get one retry
    pub retry_transient: Option<bool>,
}

/// Pool section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolToml {
    /// Maximum idle keep-alive connections per host
    pub max_idle_per_host: Option<usize>,

    /// Idle connection keep-alive in seconds
    pub keepalive_secs: Option<u64>,

    /// Connect timeout in milliseconds
    pub connect_timeout_ms: Option<u64>,

    /// Connect timeout for probes in milliseconds
    pub probe_connect_timeout_ms: Option<u64>,
}

/// Cache section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheToml {
    /// Backend kind: `"memory"` or `"http"`
    pub backend: Option<String>,

    /// Base URL of the HTTP key-value backend
    pub url: Option<String>,
}

/// Server section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerToml {
    /// Listen address, e.g. `127.0.0.1:8600`
    pub bind: Option<String>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayToml {
    /// Registered guards
    pub guards: Vec<GuardToml>,

    /// Probe configuration section
    pub probe: ProbeToml,

    /// Routing configuration section
    pub routing: RoutingToml,

    /// Dispatch configuration section
    pub dispatch: DispatchToml,

    /// Pool configuration section
    pub pool: PoolToml,

    /// Cache configuration section
    pub cache: CacheToml,

    /// Server configuration section
    pub server: ServerToml,
}

// =============================================================================
// Resolved Configuration
// =============================================================================

/// Which cache backend to run
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CacheBackend {
    /// In-process cache
    Memory,
    /// Network key-value store at the given base URL
    Http(String),
}

/// Centralized configuration for the gateway
///
/// Consolidates all configuration from all sources and tracks where the
/// values came from. Use [`load_config`] to load with proper priority
/// handling.
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    /// Guards to register at startup
    pub guards: Vec<GuardDescriptor>,

    /// Health monitor configuration
    pub health: HealthConfig,

    /// Router configuration
    pub router: RouterConfig,

    /// Orchestrator configuration
    pub orchestrator: OrchestratorConfig,

    /// Connection pool configuration
    pub pool: PoolConfig,

    /// Cache backend selection
    pub cache_backend: CacheBackend,

    /// Inbound listen address
    pub bind: String,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    /// Source of configuration values
    source: ConfigSource,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            guards: Vec::new(),
            health: HealthConfig::default(),
            router: RouterConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            pool: PoolConfig::default(),
            cache_backend: CacheBackend::Memory,
            bind: "127.0.0.1:8600".to_string(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl GatewayConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Validate the resolved configuration
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] describing the first
    /// offending value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for guard in &self.guards {
            if guard.name.is_empty() {
                return Err(ConfigError::ValidationError(
                    "guard name must not be empty".to_string(),
                ));
            }
            if !seen.insert(guard.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate guard name: {}",
                    guard.name
                )));
            }
            if !guard.base_url.starts_with("http://") && !guard.base_url.starts_with("https://") {
                return Err(ConfigError::ValidationError(format!(
                    "guard {} has a non-HTTP url: {}",
                    guard.name, guard.base_url
                )));
            }
        }

        if self.orchestrator.max_concurrent == 0 {
            return Err(ConfigError::ValidationError(
                "dispatch.max_concurrent must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.health.jitter) {
            return Err(ConfigError::ValidationError(
                "probe.jitter must be between 0.0 and 1.0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.router.degraded_timeout_scale) {
            return Err(ConfigError::ValidationError(
                "routing.degraded_timeout_scale must be between 0.0 and 1.0".to_string(),
            ));
        }
        if self.health.unreachable_after == 0 {
            return Err(ConfigError::ValidationError(
                "probe.unreachable_after must be at least 1".to_string(),
            ));
        }
        if self.bind.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::ValidationError(format!(
                "server.bind is not a valid socket address: {}",
                self.bind
            )));
        }
        if let CacheBackend::Http(url) = &self.cache_backend {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ConfigError::ValidationError(format!(
                    "cache.url is not an HTTP url: {url}"
                )));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/guardpost/gateway.toml` or
/// `~/.config/guardpost/gateway.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("guardpost").join("gateway.toml"))
}

/// Load configuration from all sources with proper priority
///
/// Priority order (highest first):
/// 1. Environment variables
/// 2. TOML configuration file
/// 3. Default values
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or if
/// the resolved configuration fails validation. A missing config file is
/// not an error (defaults are used).
pub fn load_config() -> Result<GatewayConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// # Arguments
///
/// * `path` - Optional path to the configuration file. If `None`, only
///   defaults and environment variables are used.
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or
/// parsed, or if the resolved configuration fails validation.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<GatewayConfig, ConfigError> {
    // Start with defaults
    let mut config = GatewayConfig::default();

    // Try to load from file
    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: GatewayToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                guards = config.guards.len(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    // Apply environment variables (overrides file values)
    apply_env_config(&mut config);

    config.validate()?;
    Ok(config)
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut GatewayConfig, toml: &GatewayToml) {
    // Guard entries
    config.guards = toml
        .guards
        .iter()
        .map(|g| GuardDescriptor {
            name: g.name.clone(),
            base_url: g.url.clone(),
            schema_tag: g.schema_tag.clone().unwrap_or_else(|| "v1".to_string()),
            capabilities: g.capabilities.clone(),
            required: g.required.unwrap_or(false),
            cache_eligible: g.cache_eligible.unwrap_or(true),
        })
        .collect();

    // Probe settings
    if let Some(secs) = toml.probe.interval_secs {
        config.health.probe_interval = Duration::from_secs(secs);
    }
    if let Some(ms) = toml.probe.timeout_ms {
        config.health.probe_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = toml.probe.degraded_latency_ms {
        config.health.degraded_latency = Duration::from_millis(ms);
    }
    if let Some(n) = toml.probe.unreachable_after {
        config.health.unreachable_after = n;
    }
    if let Some(jitter) = toml.probe.jitter {
        config.health.jitter = jitter;
    }

    // Routing settings
    if let Some(ms) = toml.routing.guard_timeout_ms {
        config.router.default_timeout = Duration::from_millis(ms);
    }
    if let Some(scale) = toml.routing.degraded_timeout_scale {
        config.router.degraded_timeout_scale = scale;
    }
    if let Some(ms) = toml.routing.degraded_timeout_floor_ms {
        config.router.degraded_timeout_floor = Duration::from_millis(ms);
    }

    // Dispatch settings
    if let Some(n) = toml.dispatch.max_concurrent {
        config.orchestrator.max_concurrent = n;
    }
    if let Some(secs) = toml.dispatch.cache_ttl_secs {
        config.orchestrator.cache_ttl = Duration::from_secs(secs);
    }
    if let Some(secs) = toml.dispatch.stale_tolerance_secs {
        config.orchestrator.stale_tolerance = Duration::from_secs(secs);
    }
    if let Some(retry) = toml.dispatch.retry_transient {
        config.orchestrator.retry_transient = retry;
    }

    // Pool settings
    if let Some(n) = toml.pool.max_idle_per_host {
        config.pool.max_idle_per_host = n;
    }
    if let Some(secs) = toml.pool.keepalive_secs {
        config.pool.keepalive = Duration::from_secs(secs);
    }
    if let Some(ms) = toml.pool.connect_timeout_ms {
        config.pool.connect_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = toml.pool.probe_connect_timeout_ms {
        config.pool.probe_connect_timeout = Duration::from_millis(ms);
    }

    // Cache settings
    match toml.cache.backend.as_deref() {
        Some("http") => {
            if let Some(url) = &toml.cache.url {
                config.cache_backend = CacheBackend::Http(url.clone());
            }
        }
        _ => config.cache_backend = CacheBackend::Memory,
    }

    // Server settings
    if let Some(bind) = &toml.server.bind {
        config.bind = bind.clone();
    }
}

/// Apply environment variable overrides to the config
fn apply_env_config(config: &mut GatewayConfig) {
    if let Ok(bind) = std::env::var("GUARDPOST_BIND") {
        config.bind = bind;
        config.source = ConfigSource::Env;
    }
    if let Ok(n) = std::env::var("GUARDPOST_MAX_CONCURRENT") {
        if let Ok(n) = n.parse::<usize>() {
            config.orchestrator.max_concurrent = n;
            config.source = ConfigSource::Env;
        }
    }
    if let Ok(secs) = std::env::var("GUARDPOST_PROBE_INTERVAL") {
        if let Ok(secs) = secs.parse::<u64>() {
            config.health.probe_interval = Duration::from_secs(secs);
            config.source = ConfigSource::Env;
        }
    }
    if let Ok(ms) = std::env::var("GUARDPOST_GUARD_TIMEOUT") {
        if let Ok(ms) = ms.parse::<u64>() {
            config.router.default_timeout = Duration::from_millis(ms);
            config.source = ConfigSource::Env;
        }
    }
    if let Ok(secs) = std::env::var("GUARDPOST_CACHE_TTL") {
        if let Ok(secs) = secs.parse::<u64>() {
            config.orchestrator.cache_ttl = Duration::from_secs(secs);
            config.source = ConfigSource::Env;
        }
    }
    if let Ok(url) = std::env::var("GUARDPOST_CACHE_URL") {
        config.cache_backend = CacheBackend::Http(url);
        config.source = ConfigSource::Env;
    }
    if let Ok(retry) = std::env::var("GUARDPOST_RETRY_TRANSIENT") {
        config.orchestrator.retry_transient = retry != "0" && retry.to_lowercase() != "false";
        config.source = ConfigSource::Env;
    }
}

// =============================================================================
// Tests
// =============================================================================

//! Dispatch Types
//!
//! The request/response vocabulary shared by the Router, Orchestrator, and
//! the inbound HTTP surface. An inbound call is normalized into a
//! [`DispatchRequest`], fanned out to guards, and every per-guard outcome is
//! captured as a [`DispatchResult`] before being merged into a
//! [`UnifiedResponse`].
//!
//! # Design Philosophy
//!
//! Per-guard failures are data, not control flow. A guard timing out or
//! returning garbage produces a typed [`GuardFailure`] inside the unified
//! response; it never aborts the sibling guards or the call itself. Callers
//! get "3 of 4 guards answered" and decide for themselves what that means.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Identifiers
// ============================================================================

/// Unique identifier for one inbound dispatch call
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub String);

impl RequestId {
    /// Generate a fresh random request ID
    #[must_use]
    pub fn new() -> Self {
        Self(format!("req_{}", uuid::Uuid::new_v4().simple()))
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Dispatch Request
// ============================================================================

/// Which guards an inbound request wants to reach
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CapabilitySelector {
    /// Every registered guard
    All,
    /// Guards declaring at least one of the named capabilities
    Capabilities(Vec<String>),
}

impl CapabilitySelector {
    /// Build a selector from an optional explicit capability list
    #[must_use]
    pub fn from_list(capabilities: Option<Vec<String>>) -> Self {
        match capabilities {
            Some(caps) if !caps.is_empty() => Self::Capabilities(caps),
            _ => Self::All,
        }
    }
}

/// A normalized inbound request, owned by exactly one `process()` call
#[derive(Clone, Debug)]
pub struct DispatchRequest {
    /// Unique ID for tracing and response correlation
    pub request_id: RequestId,
    /// The payload forwarded to every selected guard
    pub payload: serde_json::Value,
    /// Which guards to dispatch to
    pub selector: CapabilitySelector,
    /// Optional caller-supplied deadline, capping every per-guard timeout
    pub deadline: Option<Duration>,
}

impl DispatchRequest {
    /// Create a request targeting all guards
    #[must_use]
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            request_id: RequestId::new(),
            payload,
            selector: CapabilitySelector::All,
            deadline: None,
        }
    }

    /// Restrict the request to the named capabilities
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.selector = CapabilitySelector::Capabilities(capabilities);
        self
    }

    /// Cap every per-guard timeout at the given deadline
    #[must_use]
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

// ============================================================================
// Per-Guard Outcomes
// ============================================================================

/// Where a successful guard result came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServedFrom {
    /// A live network call to the guard
    Live,
    /// The cache, within the entry's TTL
    CacheFresh,
    /// The cache, past TTL but inside the stale-tolerance window,
    /// served because the live call failed
    CacheStale,
}

/// Typed per-guard failure
///
/// Captured inside the unified response; never propagated out of
/// `process()`.
#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum GuardFailure {
    /// The guard did not answer within its adjusted deadline
    #[error("guard did not respond within its deadline")]
    Timeout,

    /// A transient network fault (connect refused, reset, DNS)
    #[error("transient network error: {0}")]
    Transient(String),

    /// The guard answered, but the body was not what it declared
    #[error("malformed response: {0}")]
    Malformed(String),

    /// The guard is marked unreachable; no live call was attempted
    #[error("guard unavailable")]
    Unavailable,
}

impl GuardFailure {
    /// Whether the retry policy applies to this failure.
    ///
    /// Only transient transport faults are retried. A malformed response is
    /// the guard misbehaving, not a fault that a second identical call can
    /// fix, and an unavailable guard was never called at all.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Transient(_))
    }
}

/// The outcome of dispatching to one guard
#[derive(Clone, Debug, PartialEq)]
pub enum DispatchOutcome {
    /// The guard produced a result
    Success {
        /// The guard's response body
        value: serde_json::Value,
        /// Where the result came from
        served_from: ServedFrom,
        /// Wall-clock latency of the live call (0 for cache serves)
        latency_ms: u64,
    },
    /// The guard produced no usable result
    Failure(GuardFailure),
}

impl DispatchOutcome {
    /// Whether this outcome counts toward overall success
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Immutable per-guard result, aggregated into the unified response
#[derive(Clone, Debug, PartialEq)]
pub struct DispatchResult {
    /// Name of the guard this result belongs to
    pub guard: String,
    /// Whether the guard is required for overall success
    pub required: bool,
    /// What happened
    pub outcome: DispatchOutcome,
}

impl DispatchResult {
    /// Build a live success result
    #[must_use]
    pub fn success(guard: impl Into<String>, required: bool, value: serde_json::Value) -> Self {
        Self {
            guard: guard.into(),
            required,
            outcome: DispatchOutcome::Success {
                value,
                served_from: ServedFrom::Live,
                latency_ms: 0,
            },
        }
    }

    /// Build a failure result
    #[must_use]
    pub fn failure(guard: impl Into<String>, required: bool, failure: GuardFailure) -> Self {
        Self {
            guard: guard.into(),
            required,
            outcome: DispatchOutcome::Failure(failure),
        }
    }
}

// ============================================================================
// Unified Response
// ============================================================================

/// Per-guard status reported to the caller
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardStatus {
    /// Guard produced a result
    Success,
    /// Guard did not answer within its deadline (after one retry)
    Timeout,
    /// Transient network fault persisted through the retry
    TransientError,
    /// Guard answered with an invalid body
    MalformedResponse,
    /// Guard was marked unreachable; no live call was attempted
    Unavailable,
}

impl From<&GuardFailure> for GuardStatus {
    fn from(failure: &GuardFailure) -> Self {
        match failure {
            GuardFailure::Timeout => Self::Timeout,
            GuardFailure::Transient(_) => Self::TransientError,
            GuardFailure::Malformed(_) => Self::MalformedResponse,
            GuardFailure::Unavailable => Self::Unavailable,
        }
    }
}

/// One guard's entry in the unified response
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GuardReport {
    /// Final status for this guard
    pub status: GuardStatus,
    /// Result body, present on success
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Human-readable error, present on failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Where a successful result came from
    #[serde(skip_serializing_if = "Option::is_none")]
    pub served_from: Option<ServedFrom>,
    /// Live-call latency in milliseconds, if a live call happened
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
}

impl From<&DispatchResult> for GuardReport {
    fn from(result: &DispatchResult) -> Self {
        match &result.outcome {
            DispatchOutcome::Success {
                value,
                served_from,
                latency_ms,
            } => Self {
                status: GuardStatus::Success,
                result: Some(value.clone()),
                error: None,
                served_from: Some(*served_from),
                latency_ms: (*served_from == ServedFrom::Live).then_some(*latency_ms),
            },
            DispatchOutcome::Failure(failure) => Self {
                status: GuardStatus::from(failure),
                result: None,
                error: Some(failure.to_string()),
                served_from: None,
                latency_ms: None,
            },
        }
    }
}

/// The merged response for one inbound call
///
/// Keyed by guard name; `success` is true only when every *required* guard
/// produced a non-failure result. Optional guards failing never blocks
/// success.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UnifiedResponse {
    /// ID of the inbound request this answers
    pub request_id: RequestId,
    /// Overall success across required guards
    pub success: bool,
    /// Per-guard status and result/error
    pub guards: BTreeMap<String, GuardReport>,
    /// Total wall-clock time spent in `process()`
    pub elapsed_ms: u64,
    /// When the response was assembled
    pub completed_at: chrono::DateTime<chrono::Utc>,
}

impl UnifiedResponse {
    /// Merge per-guard results into a unified response.
    ///
    /// Results are keyed by guard name; ordering between guards is
    /// irrelevant and duplicate names keep the last result.
    #[must_use]
    pub fn merge(request_id: RequestId, results: &[DispatchResult], elapsed_ms: u64) -> Self {
        let success = results
            .iter()
            .filter(|r| r.required)
            .all(|r| r.outcome.is_success());

        let guards = results
            .iter()
            .map(|r| (r.guard.clone(), GuardReport::from(r)))
            .collect();

        Self {
            request_id,
            success,
            guards,
            elapsed_ms,
            completed_at: chrono::Utc::now(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

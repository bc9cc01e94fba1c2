//! Inbound HTTP Surface
//!
//! The gateway's own API: a dispatch endpoint that fronts the
//! orchestrator, a guard listing with live health, and a liveness probe
//! for whatever is fronting the gateway itself.
//!
//! Per-guard failures are inside the unified response body with status
//! 200; only a routing refusal (a required guard with no path at all)
//! maps to an HTTP error.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::dispatch::{CapabilitySelector, DispatchRequest, RequestId};
use crate::health::{HealthMonitor, HealthState};
use crate::orchestrator::Orchestrator;
use crate::registry::ServiceRegistry;
use crate::router::RouteError;

// ============================================================================
// State and Wire Types
// ============================================================================

/// Shared state behind every handler
pub struct AppState {
    /// The fan-out engine
    pub orchestrator: Arc<Orchestrator>,
    /// Registered guards
    pub registry: Arc<ServiceRegistry>,
    /// Live health state
    pub monitor: Arc<HealthMonitor>,
}

/// Body of `POST /v1/dispatch`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DispatchBody {
    /// The payload forwarded to every selected guard
    pub payload: serde_json::Value,
    /// Restrict the dispatch to these capabilities (omit for all guards)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Vec<String>>,
    /// Caller deadline in milliseconds, capping every per-guard timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_ms: Option<u64>,
}

/// One guard in the `GET /v1/guards` listing
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GuardInfo {
    /// Guard name
    pub name: String,
    /// Base URL
    pub url: String,
    /// Declared capabilities
    pub capabilities: Vec<String>,
    /// Whether the guard is required for overall success
    pub required: bool,
    /// Current health state
    pub state: HealthState,
}

/// Error body returned on routing refusal
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Machine-readable error kind
    pub error: String,
    /// Human-readable detail
    pub detail: String,
}

// ============================================================================
// Router
// ============================================================================

/// Build the gateway's HTTP router
pub fn router(state: Arc<AppState>) -> axum::Router {
    axum::Router::new()
        .route("/v1/dispatch", post(dispatch))
        .route("/v1/guards", get(list_guards))
        .route("/healthz", get(healthz))
        .with_state(state)
}

// ============================================================================
// Handlers
// ============================================================================

async fn dispatch(
    State(state): State<Arc<AppState>>,
    Json(body): Json<DispatchBody>,
) -> Response {
    let mut request = DispatchRequest {
        request_id: RequestId::new(),
        payload: body.payload,
        selector: CapabilitySelector::from_list(body.capabilities),
        deadline: None,
    };
    if let Some(ms) = body.deadline_ms {
        request.deadline = Some(std::time::Duration::from_millis(ms));
    }

    match state.orchestrator.process(request).await {
        Ok(response) => Json(response).into_response(),
        Err(error @ RouteError::NoEligibleGuard { .. }) => {
            tracing::warn!(error = %error, "Dispatch refused");
            (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(ErrorBody {
                    error: "no_eligible_guard".to_string(),
                    detail: error.to_string(),
                }),
            )
                .into_response()
        }
    }
}

async fn list_guards(State(state): State<Arc<AppState>>) -> Json<Vec<GuardInfo>> {
    let guards = state
        .registry
        .snapshot()
        .into_iter()
        .map(|g| GuardInfo {
            name: g.name.clone(),
            url: g.base_url.clone(),
            capabilities: g.capabilities.clone(),
            required: g.required,
            state: state.monitor.state_of(&g.name),
        })
        .collect();
    Json(guards)
}

async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

// ============================================================================
// Tests
// ============================================================================

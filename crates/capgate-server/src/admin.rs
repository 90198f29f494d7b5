// capgate-server/src/admin.rs
// ============================================================================
// Module: Admin API
// Description: Capability management and usage stats endpoints.
// Purpose: Let operators inspect and toggle capabilities at runtime.
// Dependencies: axum, capgate-core
// ============================================================================

//! ## Overview
//! Routes under `/api/admin` require a resolved caller holding the
//! configured admin role. Rejected calls emit an `admin_denied` audit event.
//! Updates go through [`CapabilityRegistry::update`], so a capability change
//! is durable before it becomes visible to the gate.
//!
//! [`CapabilityRegistry::update`]: capgate_core::CapabilityRegistry::update

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::Path;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::HeaderMap;
use axum::http::StatusCode;
use axum::http::header::AUTHORIZATION;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use axum::routing::put;
use capgate_core::AuditEvent;
use capgate_core::AuditEventKind;
use capgate_core::AuditEventParams;
use capgate_core::Capability;
use capgate_core::CapabilityConfig;
use capgate_core::CapabilityName;
use capgate_core::RegistryError;
use capgate_core::UsageLedger;
use serde::Serialize;
use serde_json::json;

use crate::auth::ResolvedCaller;
use crate::server::AppState;

// ============================================================================
// SECTION: Routes
// ============================================================================

/// Returns the admin routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/admin/capabilities", get(list_capabilities))
        .route("/api/admin/capabilities/{name}", put(update_capability))
        .route("/api/admin/stats", get(stats))
}

// ============================================================================
// SECTION: Payloads
// ============================================================================

/// Update response body.
#[derive(Debug, Serialize)]
struct UpdateResponse {
    /// Human-readable confirmation.
    message: String,
    /// Updated capability name.
    capability: CapabilityName,
    /// Stored configuration.
    config: CapabilityConfig,
}

/// Stats response body.
#[derive(Debug, Serialize)]
struct StatsResponse {
    /// Enablement per capability.
    capabilities_status: BTreeMap<String, bool>,
    /// Gated calls recorded since UTC midnight.
    api_calls_today: u64,
}

// ============================================================================
// SECTION: Handlers
// ============================================================================

/// Lists capabilities in registration order.
async fn list_capabilities(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<Capability>>, AdminError> {
    authorize_admin(&state, &headers, "/api/admin/capabilities")?;
    Ok(Json(state.registry.snapshot().capabilities().to_vec()))
}

/// Replaces or adds one capability.
async fn update_capability(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Result<Json<CapabilityConfig>, JsonRejection>,
) -> Result<Json<UpdateResponse>, AdminError> {
    let endpoint = format!("/api/admin/capabilities/{name}");
    let caller = authorize_admin(&state, &headers, &endpoint)?;
    let Json(config) = body.map_err(|err| AdminError::Invalid(err.body_text()))?;
    let name = CapabilityName::new(name);
    let snapshot =
        state.registry.update(&name, config, &caller.caller_id).map_err(|err| match err {
            RegistryError::Invalid(message) => AdminError::Invalid(message),
            RegistryError::Persist(message) | RegistryError::Lock(message) => {
                AdminError::Persist(message)
            }
        })?;
    let stored = snapshot
        .get(name.as_str())
        .map(|capability| capability.config.clone())
        .ok_or_else(|| AdminError::Persist("updated capability missing".to_string()))?;
    Ok(Json(UpdateResponse {
        message: format!("Capability '{name}' updated"),
        capability: name,
        config: stored,
    }))
}

/// Reports enablement and today's call volume.
async fn stats(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<StatsResponse>, AdminError> {
    authorize_admin(&state, &headers, "/api/admin/stats")?;
    let snapshot = state.registry.snapshot();
    let capabilities_status = snapshot
        .capabilities()
        .iter()
        .map(|capability| (capability.name.to_string(), capability.config.enabled))
        .collect();
    let midnight = state.clock.now().start_of_utc_day();
    let api_calls_today = state
        .ledger
        .count_all_since(midnight)
        .map_err(|err| AdminError::Unavailable(err.to_string()))?;
    Ok(Json(StatsResponse {
        capabilities_status,
        api_calls_today,
    }))
}

// ============================================================================
// SECTION: Authorization
// ============================================================================

/// Resolves the caller and checks the admin role.
fn authorize_admin(
    state: &AppState,
    headers: &HeaderMap,
    endpoint: &str,
) -> Result<ResolvedCaller, AdminError> {
    let header = headers.get(AUTHORIZATION).and_then(|value| value.to_str().ok());
    let caller = state.resolver.resolve(header).ok().flatten();
    let (error, caller_id) = match caller {
        Some(caller) if caller.has_role(&state.admin_role) => return Ok(caller),
        Some(caller) => (AdminError::Forbidden, Some(caller.caller_id)),
        None => (AdminError::Unauthenticated, None),
    };
    state.audit.record(&AuditEvent::at(
        AuditEventKind::AdminDenied,
        state.clock.now(),
        AuditEventParams {
            caller_id,
            endpoint: Some(endpoint.to_string()),
            reason: Some(error.reason()),
            ..AuditEventParams::default()
        },
    ));
    Err(error)
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Admin API errors.
#[derive(Debug, thiserror::Error)]
enum AdminError {
    /// No valid credentials.
    #[error("Authentication required")]
    Unauthenticated,
    /// Caller lacks the admin role.
    #[error("Admin role required")]
    Forbidden,
    /// Invalid request body or capability.
    #[error("Invalid capability: {0}")]
    Invalid(String),
    /// Durable write failed.
    #[error("Failed to update capability: {0}")]
    Persist(String),
    /// Ledger could not be queried.
    #[error("Usage ledger unavailable: {0}")]
    Unavailable(String),
}

impl AdminError {
    /// Returns the audit reason label for access denials.
    const fn reason(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::Forbidden => "missing_admin_role",
            Self::Invalid(_) => "invalid_request",
            Self::Persist(_) => "persist_failed",
            Self::Unavailable(_) => "ledger_unavailable",
        }
    }

    /// Returns the HTTP status for the error.
    const fn status(&self) -> StatusCode {
        match self {
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::Invalid(_) => StatusCode::BAD_REQUEST,
            Self::Persist(_) | Self::Unavailable(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        (self.status(), Json(json!({"detail": self.to_string()}))).into_response()
    }
}

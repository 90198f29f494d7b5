// capgate-server/src/middleware.rs
// ============================================================================
// Module: Gate Middleware
// Description: axum middleware applying the request gate to every route.
// Purpose: Map gate denials to HTTP and classify downstream responses.
// Dependencies: axum, capgate-core
// ============================================================================

//! ## Overview
//! The middleware resolves the caller from the `Authorization` header,
//! then runs the downstream handler through [`RequestGate::guard`]. A
//! response counts as a successful call when its status is below 400.
//!
//! Credentials that cannot be resolved never fail the request here. The
//! middleware records a `caller_rejected` audit event and continues with no
//! caller, so ungoverned routes serve normally and governed routes run
//! ungated. Admin routes authenticate on their own.
//!
//! Denials map to:
//! - 403 `{"detail": "Capability '<name>' is not enabled"}`
//! - 429 `{"detail": "Rate limit exceeded", "capability": ..., "rate_limit": ...}`
//!
//! [`RequestGate::guard`]: crate::gate::RequestGate::guard

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;

use axum::Json;
use axum::extract::Request;
use axum::extract::State;
use axum::http::StatusCode;
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::IntoResponse;
use axum::response::Response;
use capgate_core::AuditEvent;
use capgate_core::AuditEventKind;
use capgate_core::AuditEventParams;
use serde_json::json;

use crate::gate::GateDenial;
use crate::gate::GateOutcome;
use crate::server::AppState;

// ============================================================================
// SECTION: Middleware
// ============================================================================

/// Gates one request.
pub async fn capability_gate(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    let auth_header = match request.headers().get(AUTHORIZATION).map(|value| value.to_str()) {
        None => Ok(None),
        Some(Ok(value)) => Ok(Some(value.to_string())),
        Some(Err(_)) => Err("authorization header is not valid UTF-8".to_string()),
    };
    let resolved = auth_header.and_then(|header| {
        state.resolver.resolve(header.as_deref()).map_err(|err| err.to_string())
    });
    let caller = match resolved {
        Ok(caller) => caller,
        Err(detail) => {
            record_rejected_caller(&state, &path, detail);
            None
        }
    };
    match state.gate.guard(&path, caller.as_ref(), next.run(request)).await {
        Ok(response) => response,
        Err(denial) => denial.into_response(),
    }
}

// ============================================================================
// SECTION: Response Mapping
// ============================================================================

/// Audits credentials that did not resolve to a caller.
fn record_rejected_caller(state: &AppState, path: &str, detail: String) {
    state.audit.record(&AuditEvent::at(
        AuditEventKind::CallerRejected,
        state.clock.now(),
        AuditEventParams {
            endpoint: Some(path.to_string()),
            reason: Some("invalid_credentials"),
            detail: Some(detail),
            ..AuditEventParams::default()
        },
    ));
}

impl GateOutcome for Response {
    fn succeeded(&self) -> bool {
        let status = self.status().as_u16();
        (200 .. 400).contains(&status)
    }

    fn failure_detail(&self) -> Option<String> {
        if self.succeeded() {
            return None;
        }
        Some(format!("HTTP {}", self.status().as_u16()))
    }
}

impl IntoResponse for GateDenial {
    fn into_response(self) -> Response {
        match &self {
            Self::CapabilityDisabled {
                ..
            }
            | Self::RoleRequired {
                ..
            } => (StatusCode::FORBIDDEN, Json(json!({"detail": self.to_string()}))).into_response(),
            Self::RateLimited {
                capability,
                rate_limit,
                ..
            } => (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({
                    "detail": self.to_string(),
                    "capability": capability.as_str(),
                    "rate_limit": rate_limit,
                })),
            )
                .into_response(),
        }
    }
}

// capgate-core/src/audit.rs
// ============================================================================
// Module: Gate Audit Logging
// Description: Structured audit events for registry and gate decisions.
// Purpose: Emit JSON-lines audit records without hard logging dependencies.
// Dependencies: serde, serde_json
// ============================================================================

//! ## Overview
//! Every fail-open path, denial, and registry transition produces one
//! [`AuditEvent`]. Sinks serialize events as single JSON lines so
//! deployments can route them to their own log pipeline. Sink failures are
//! ignored; auditing never affects a gate decision.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fs::OpenOptions;
use std::io;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use serde::Serialize;

use crate::identifiers::CallerId;
use crate::identifiers::CapabilityName;
use crate::time::Timestamp;

// ============================================================================
// SECTION: Types
// ============================================================================

/// Audit event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventKind {
    /// Registry loaded from the durable store.
    CapabilityRegistryLoaded,
    /// Registry started from the fallback set.
    CapabilityRegistryFallback,
    /// Capability update persisted and published.
    CapabilityUpdated,
    /// Capability update rejected or failed to persist.
    CapabilityUpdateFailed,
    /// A capability carries a rate limit that evaluates as unlimited.
    RateLimitMisconfigured,
    /// A gated request was denied.
    GateDenied,
    /// A governed request ran without a resolved caller.
    GateUngated,
    /// Request credentials could not be resolved; the request continued anonymously.
    CallerRejected,
    /// The usage ledger could not be counted; the request was admitted.
    RateCheckFailedOpen,
    /// A usage event could not be written.
    UsageRecordFailed,
    /// An admin API call was rejected.
    AdminDenied,
}

impl AuditEventKind {
    /// Returns the stable event label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CapabilityRegistryLoaded => "capability_registry_loaded",
            Self::CapabilityRegistryFallback => "capability_registry_fallback",
            Self::CapabilityUpdated => "capability_updated",
            Self::CapabilityUpdateFailed => "capability_update_failed",
            Self::RateLimitMisconfigured => "rate_limit_misconfigured",
            Self::GateDenied => "gate_denied",
            Self::GateUngated => "gate_ungated",
            Self::CallerRejected => "caller_rejected",
            Self::RateCheckFailedOpen => "rate_check_failed_open",
            Self::UsageRecordFailed => "usage_record_failed",
            Self::AdminDenied => "admin_denied",
        }
    }
}

/// Audit event payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditEvent {
    /// Event kind.
    pub event: AuditEventKind,
    /// Event timestamp (milliseconds since epoch).
    pub timestamp_ms: i64,
    /// Capability involved, when any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capability: Option<CapabilityName>,
    /// Caller involved, when resolved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caller_id: Option<CallerId>,
    /// Request path, when the event concerns a request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Stable reason label.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
    /// Free-form detail (error text, policy string).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Inputs required to construct an audit event.
#[derive(Debug, Clone, Default)]
pub struct AuditEventParams {
    /// Capability involved.
    pub capability: Option<CapabilityName>,
    /// Caller involved.
    pub caller_id: Option<CallerId>,
    /// Request path.
    pub endpoint: Option<String>,
    /// Stable reason label.
    pub reason: Option<&'static str>,
    /// Free-form detail.
    pub detail: Option<String>,
}

impl AuditEvent {
    /// Creates a new audit event stamped with the current wall-clock time.
    #[must_use]
    pub fn new(event: AuditEventKind, params: AuditEventParams) -> Self {
        Self::at(event, Timestamp::now(), params)
    }

    /// Creates a new audit event stamped with `timestamp`.
    #[must_use]
    pub fn at(event: AuditEventKind, timestamp: Timestamp, params: AuditEventParams) -> Self {
        Self {
            event,
            timestamp_ms: timestamp.as_unix_millis(),
            capability: params.capability,
            caller_id: params.caller_id,
            endpoint: params.endpoint,
            reason: params.reason,
            detail: params.detail,
        }
    }
}

// ============================================================================
// SECTION: Trait
// ============================================================================

/// Audit sink for gate events.
pub trait AuditSink: Send + Sync {
    /// Record an audit event.
    fn record(&self, event: &AuditEvent);
}

/// Audit sink that logs JSON lines to stderr.
pub struct StderrAuditSink;

impl AuditSink for StderrAuditSink {
    fn record(&self, event: &AuditEvent) {
        if let Ok(payload) = serde_json::to_string(event) {
            let _ = writeln!(io::stderr(), "{payload}");
        }
    }
}

/// Audit sink that logs JSON lines to a file.
pub struct FileAuditSink {
    /// File handle used for append-only logging.
    file: Mutex<std::fs::File>,
}

impl FileAuditSink {
    /// Opens the audit log file in append mode.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub fn new(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl AuditSink for FileAuditSink {
    fn record(&self, event: &AuditEvent) {
        if let Ok(payload) = serde_json::to_string(event)
            && let Ok(mut file) = self.file.lock()
        {
            let _ = writeln!(file, "{payload}");
            let _ = file.flush();
        }
    }
}

/// No-op audit sink.
pub struct NoopAuditSink;

impl AuditSink for NoopAuditSink {
    fn record(&self, _event: &AuditEvent) {}
}

// ============================================================================
// SECTION: Tests
// ============================================================================

// capgate-server/src/gate.rs
// ============================================================================
// Module: Request Gate
// Description: Per-request capability enforcement and usage recording.
// Purpose: Decide admission before downstream work and record the outcome.
// Dependencies: capgate-core
// ============================================================================

//! ## Overview
//! The gate runs each request through a fixed sequence: resolve the
//! governing capability from the path, resolve the caller, check
//! enablement (and optionally the required role), evaluate the rate policy,
//! run the downstream work, then record exactly one usage event.
//!
//! - Paths no capability governs run untouched and are never recorded.
//! - Governed paths without a resolved caller run ungated and emit a
//!   `gate_ungated` audit event.
//! - Denials happen before downstream work and are never recorded.
//! - An [`AdmissionTicket`] records on completion; dropping it unfinished
//!   records a failed event so cancelled requests still count.
//!
//! The gate is transport-agnostic: [`RequestGate::guard`] wraps any future
//! whose output implements [`GateOutcome`].

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use capgate_core::AuditEvent;
use capgate_core::AuditEventKind;
use capgate_core::AuditEventParams;
use capgate_core::AuditSink;
use capgate_core::CallerId;
use capgate_core::CapabilityName;
use capgate_core::CapabilityRegistry;
use capgate_core::Clock;
use capgate_core::FailOpenReason;
use capgate_core::PeriodUnit;
use capgate_core::RateDecision;
use capgate_core::RateEvaluator;
use capgate_core::SharedUsageLedger;
use capgate_core::UsageEvent;
use thiserror::Error;

use crate::auth::ResolvedCaller;
use crate::telemetry::GateDecision;
use crate::telemetry::GateMetricEvent;
use crate::telemetry::GateMetrics;

// ============================================================================
// SECTION: Outcomes
// ============================================================================

/// Classifies the result of downstream work for usage recording.
pub trait GateOutcome {
    /// Returns true when the downstream call succeeded.
    fn succeeded(&self) -> bool;
    /// Returns error text for a failed call.
    fn failure_detail(&self) -> Option<String>;
}

impl<T, E: fmt::Display> GateOutcome for Result<T, E> {
    fn succeeded(&self) -> bool {
        self.is_ok()
    }

    fn failure_detail(&self) -> Option<String> {
        self.as_ref().err().map(ToString::to_string)
    }
}

/// Reasons a governed request is refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GateDenial {
    /// The capability exists but is disabled.
    #[error("Capability '{capability}' is not enabled")]
    CapabilityDisabled {
        /// Governing capability.
        capability: CapabilityName,
    },
    /// The caller lacks the capability's required role.
    #[error("Capability '{capability}' requires role '{role}'")]
    RoleRequired {
        /// Governing capability.
        capability: CapabilityName,
        /// Role the caller is missing.
        role: String,
    },
    /// The caller exhausted the capability's quota.
    #[error("Rate limit exceeded")]
    RateLimited {
        /// Governing capability.
        capability: CapabilityName,
        /// Configured policy string (e.g. `100/hour`).
        rate_limit: String,
        /// Configured quota.
        quota: u64,
        /// Admissions counted in the window.
        used: u64,
        /// Window length.
        period: PeriodUnit,
    },
}

impl GateDenial {
    /// Returns the governing capability.
    #[must_use]
    pub const fn capability(&self) -> &CapabilityName {
        match self {
            Self::CapabilityDisabled {
                capability,
            }
            | Self::RoleRequired {
                capability, ..
            }
            | Self::RateLimited {
                capability, ..
            } => capability,
        }
    }

    /// Returns the stable denial reason label.
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::CapabilityDisabled {
                ..
            } => "capability_disabled",
            Self::RoleRequired {
                ..
            } => "role_required",
            Self::RateLimited {
                ..
            } => "rate_limited",
        }
    }

    /// Returns the telemetry decision for the denial.
    const fn decision(&self) -> GateDecision {
        match self {
            Self::CapabilityDisabled {
                ..
            } => GateDecision::Disabled,
            Self::RoleRequired {
                ..
            } => GateDecision::RoleRequired,
            Self::RateLimited {
                ..
            } => GateDecision::RateLimited,
        }
    }
}

/// Result of a successful admission check.
#[derive(Debug)]
pub enum Admission {
    /// No capability governs the path.
    Ungoverned,
    /// Governed path, but no caller was resolved.
    Ungated {
        /// Governing capability.
        capability: CapabilityName,
    },
    /// Admitted; the ticket records the outcome.
    Admitted(AdmissionTicket),
}

// ============================================================================
// SECTION: Admission Ticket
// ============================================================================

/// Pending usage record for an admitted request.
struct PendingUsage {
    /// Caller that was admitted.
    caller_id: CallerId,
    /// Governing capability.
    capability: CapabilityName,
    /// Request path.
    endpoint: String,
    /// Admission decision.
    decision: GateDecision,
    /// Downstream start time.
    started: Instant,
    /// Ledger receiving the event.
    ledger: SharedUsageLedger,
    /// Audit sink for swallowed ledger failures.
    audit: Arc<dyn AuditSink>,
    /// Clock stamping the event.
    clock: Arc<dyn Clock>,
    /// Latency metrics.
    metrics: Arc<dyn GateMetrics>,
}

impl PendingUsage {
    /// Writes the usage event.
    fn record(self, success: bool, error: Option<String>) {
        let latency = self.started.elapsed();
        let metric = GateMetricEvent {
            capability: Some(self.capability.clone()),
            decision: self.decision,
            success: Some(success),
        };
        self.metrics.record_latency(&metric, latency);
        let event = UsageEvent {
            caller_id: self.caller_id,
            capability: self.capability,
            endpoint: self.endpoint,
            timestamp: self.clock.now(),
            success,
            latency_ms: Some(u64::try_from(latency.as_millis()).unwrap_or(u64::MAX)),
            error,
        };
        self.ledger.record(event, &*self.audit);
    }
}

/// Obligation to record exactly one usage event for an admitted request.
pub struct AdmissionTicket {
    /// Pending record; taken on completion.
    pending: Option<PendingUsage>,
}

impl AdmissionTicket {
    /// Returns the governing capability.
    #[must_use]
    pub fn capability(&self) -> Option<&CapabilityName> {
        self.pending.as_ref().map(|pending| &pending.capability)
    }

    /// Records the downstream outcome.
    pub fn complete(mut self, success: bool, error: Option<String>) {
        if let Some(pending) = self.pending.take() {
            pending.record(success, error);
        }
    }
}

impl fmt::Debug for AdmissionTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionTicket").field("capability", &self.capability()).finish()
    }
}

impl Drop for AdmissionTicket {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.record(false, Some("request cancelled before completion".to_string()));
        }
    }
}

// ============================================================================
// SECTION: Gate
// ============================================================================

/// Capability gate shared by all requests.
pub struct RequestGate {
    /// Capability registry.
    registry: Arc<CapabilityRegistry>,
    /// Usage ledger.
    ledger: SharedUsageLedger,
    /// Audit sink for gate decisions.
    audit: Arc<dyn AuditSink>,
    /// Time source for windows and event stamps.
    clock: Arc<dyn Clock>,
    /// Decision metrics.
    metrics: Arc<dyn GateMetrics>,
    /// Deny callers lacking a capability's required role.
    enforce_roles: bool,
}

impl RequestGate {
    /// Creates a gate. Role requirements are not enforced by default.
    #[must_use]
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        ledger: SharedUsageLedger,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn GateMetrics>,
    ) -> Self {
        Self {
            registry,
            ledger,
            audit,
            clock,
            metrics,
            enforce_roles: false,
        }
    }

    /// Enables or disables required-role enforcement.
    #[must_use]
    pub const fn with_role_enforcement(mut self, enforce_roles: bool) -> Self {
        self.enforce_roles = enforce_roles;
        self
    }

    /// Returns the capability registry.
    #[must_use]
    pub const fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    /// Decides whether a request for `path` may proceed.
    ///
    /// # Errors
    ///
    /// Returns [`GateDenial`] when the capability is disabled, the caller
    /// lacks a required role, or the quota is exhausted.
    pub fn admit(
        &self,
        path: &str,
        caller: Option<&ResolvedCaller>,
    ) -> Result<Admission, GateDenial> {
        let snapshot = self.registry.snapshot();
        let Some(capability) = snapshot.resolve_capability_for_path(path) else {
            self.observe(None, GateDecision::Ungoverned);
            return Ok(Admission::Ungoverned);
        };
        let name = capability.name.clone();
        let Some(caller) = caller else {
            self.audit.record(&AuditEvent::at(
                AuditEventKind::GateUngated,
                self.clock.now(),
                AuditEventParams {
                    capability: Some(name.clone()),
                    endpoint: Some(path.to_string()),
                    reason: Some("caller_unresolved"),
                    ..AuditEventParams::default()
                },
            ));
            self.observe(Some(name.clone()), GateDecision::Ungated);
            return Ok(Admission::Ungated {
                capability: name,
            });
        };

        if !capability.config.enabled {
            return Err(self.deny(
                GateDenial::CapabilityDisabled {
                    capability: name,
                },
                caller,
                path,
            ));
        }
        if self.enforce_roles
            && let Some(role) = &capability.config.requires_role
            && !caller.has_role(role)
        {
            return Err(self.deny(
                GateDenial::RoleRequired {
                    capability: name,
                    role: role.clone(),
                },
                caller,
                path,
            ));
        }

        let now = self.clock.now();
        let decision = RateEvaluator::evaluate_capability(
            &capability.config,
            &caller.caller_id,
            &name,
            &self.ledger,
            now,
        );
        let admitted = match decision {
            RateDecision::Denied {
                quota,
                used,
                period,
            } => {
                return Err(self.deny(
                    GateDenial::RateLimited {
                        capability: name,
                        rate_limit: capability.config.rate_limit.clone().unwrap_or_default(),
                        quota,
                        used,
                        period,
                    },
                    caller,
                    path,
                ));
            }
            RateDecision::FailOpen {
                reason,
            } => {
                self.audit.record(&AuditEvent::at(
                    AuditEventKind::RateCheckFailedOpen,
                    now,
                    AuditEventParams {
                        capability: Some(name.clone()),
                        caller_id: Some(caller.caller_id.clone()),
                        endpoint: Some(path.to_string()),
                        reason: Some(reason.label()),
                        detail: Some(fail_open_detail(&reason)),
                    },
                ));
                GateDecision::FailedOpen
            }
            RateDecision::Unlimited
            | RateDecision::Allowed {
                ..
            } => GateDecision::Allowed,
        };
        drop(snapshot);

        self.observe(Some(name.clone()), admitted);
        Ok(Admission::Admitted(AdmissionTicket {
            pending: Some(PendingUsage {
                caller_id: caller.caller_id.clone(),
                capability: name,
                endpoint: path.to_string(),
                decision: admitted,
                started: Instant::now(),
                ledger: self.ledger.clone(),
                audit: Arc::clone(&self.audit),
                clock: Arc::clone(&self.clock),
                metrics: Arc::clone(&self.metrics),
            }),
        }))
    }

    /// Admits the request, runs `downstream`, and records its outcome.
    /// The downstream output is returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`GateDenial`] without running `downstream` when the request
    /// is refused.
    pub async fn guard<F, O>(
        &self,
        path: &str,
        caller: Option<&ResolvedCaller>,
        downstream: F,
    ) -> Result<O, GateDenial>
    where
        F: Future<Output = O>,
        O: GateOutcome,
    {
        let admission = self.admit(path, caller)?;
        let outcome = downstream.await;
        if let Admission::Admitted(ticket) = admission {
            ticket.complete(outcome.succeeded(), outcome.failure_detail());
        }
        Ok(outcome)
    }

    /// Emits the audit event and metric for a denial.
    fn deny(&self, denial: GateDenial, caller: &ResolvedCaller, path: &str) -> GateDenial {
        let detail = match &denial {
            GateDenial::RateLimited {
                rate_limit,
                used,
                ..
            } => format!("{rate_limit} (used {used})"),
            other => other.to_string(),
        };
        self.audit.record(&AuditEvent::at(
            AuditEventKind::GateDenied,
            self.clock.now(),
            AuditEventParams {
                capability: Some(denial.capability().clone()),
                caller_id: Some(caller.caller_id.clone()),
                endpoint: Some(path.to_string()),
                reason: Some(denial.reason()),
                detail: Some(detail),
            },
        ));
        self.observe(Some(denial.capability().clone()), denial.decision());
        denial
    }

    /// Records a decision metric.
    fn observe(&self, capability: Option<CapabilityName>, decision: GateDecision) {
        self.metrics.record_decision(&GateMetricEvent {
            capability,
            decision,
            success: None,
        });
    }
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Returns audit detail for a fail-open decision.
fn fail_open_detail(reason: &FailOpenReason) -> String {
    match reason {
        FailOpenReason::Misconfigured(err) => err.to_string(),
        FailOpenReason::LedgerUnavailable(message) => message.clone(),
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests;

// capgate-server/src/gate/tests.rs
// ============================================================================
// Module: Request Gate Tests
// Description: Unit tests for gate admission and usage recording.
// Purpose: Validate the per-request state machine without HTTP.
// Dependencies: capgate-core, tokio
// ============================================================================

//! ## Overview
//! Drives [`RequestGate`] directly with an in-memory registry, ledger, and
//! manual clock to check ordering guarantees: denials never run downstream
//! work and never write the ledger; admissions record exactly once.

#![allow(
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::panic,
    clippy::use_debug,
    reason = "Test-only assertions use unwrap/expect for clarity."
)]

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use capgate_core::AuditEvent;
use capgate_core::AuditEventKind;
use capgate_core::AuditSink;
use capgate_core::Capability;
use capgate_core::CapabilityConfig;
use capgate_core::CapabilityRegistry;
use capgate_core::InMemoryCapabilityStore;
use capgate_core::InMemoryUsageLedger;
use capgate_core::ManualClock;
use capgate_core::PeriodUnit;
use capgate_core::SharedCapabilityStore;
use capgate_core::SharedUsageLedger;
use capgate_core::Timestamp;
use capgate_core::UsageLedger;
use capgate_core::default_capabilities;

use super::*;
use crate::telemetry::InMemoryGateMetrics;

// ============================================================================
// SECTION: Fixtures
// ============================================================================

#[derive(Default)]
struct CapturingAudit {
    events: Mutex<Vec<AuditEvent>>,
}

impl CapturingAudit {
    fn count(&self, kind: AuditEventKind) -> usize {
        self.events.lock().unwrap().iter().filter(|event| event.event == kind).count()
    }
}

impl AuditSink for CapturingAudit {
    fn record(&self, event: &AuditEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

struct Fixture {
    gate: RequestGate,
    ledger: Arc<InMemoryUsageLedger>,
    audit: Arc<CapturingAudit>,
    clock: Arc<ManualClock>,
    metrics: Arc<InMemoryGateMetrics>,
}

fn capabilities() -> Vec<Capability> {
    vec![
        Capability::new(
            "search",
            CapabilityConfig::new(true, &["/api/search"]).with_rate_limit("2/hour"),
        ),
        Capability::new("billing", CapabilityConfig::new(false, &["/api/billing"])),
        Capability::new(
            "weekly",
            CapabilityConfig::new(true, &["/api/weekly"]).with_rate_limit("5/week"),
        ),
        Capability::new(
            "deploy",
            CapabilityConfig::new(true, &["/api/deploy"]).with_required_role("admin"),
        ),
    ]
}

fn fixture() -> Fixture {
    let audit = Arc::new(CapturingAudit::default());
    let sink: Arc<dyn AuditSink> = audit.clone();
    let store = SharedCapabilityStore::from_store(InMemoryCapabilityStore::with_capabilities(
        capabilities(),
    ));
    let registry =
        Arc::new(CapabilityRegistry::load(store, default_capabilities(), Arc::clone(&sink)));
    let ledger = Arc::new(InMemoryUsageLedger::new());
    let shared: Arc<dyn UsageLedger> = ledger.clone();
    let clock = Arc::new(ManualClock::new(Timestamp::from_unix_millis(1_700_000_000_000)));
    let metrics = Arc::new(InMemoryGateMetrics::new());
    let gate = RequestGate::new(
        registry,
        SharedUsageLedger::new(shared),
        sink,
        clock.clone(),
        metrics.clone(),
    );
    Fixture {
        gate,
        ledger,
        audit,
        clock,
        metrics,
    }
}

fn caller(id: &str) -> ResolvedCaller {
    ResolvedCaller::new(id, &[])
}

fn admit_and_complete(fixture: &Fixture, path: &str, who: &ResolvedCaller) {
    match fixture.gate.admit(path, Some(who)).unwrap() {
        Admission::Admitted(ticket) => ticket.complete(true, None),
        other => panic!("expected admission, got {other:?}"),
    }
}

// ============================================================================
// SECTION: Admission
// ============================================================================

#[test]
fn ungoverned_paths_are_not_recorded() {
    let fixture = fixture();
    let admission = fixture.gate.admit("/api/users/42", Some(&caller("c"))).unwrap();
    assert!(matches!(admission, Admission::Ungoverned));
    assert!(fixture.ledger.events().unwrap().is_empty());
    assert_eq!(fixture.metrics.decisions(GateDecision::Ungoverned), 1);
}

#[test]
fn anonymous_callers_run_ungated_and_are_audited() {
    let fixture = fixture();
    let admission = fixture.gate.admit("/api/billing/invoices", None).unwrap();
    assert!(matches!(admission, Admission::Ungated { .. }));
    assert_eq!(fixture.audit.count(AuditEventKind::GateUngated), 1);
    assert!(fixture.ledger.events().unwrap().is_empty());
}

#[test]
fn disabled_capability_is_denied_without_recording() {
    let fixture = fixture();
    let denial = fixture.gate.admit("/api/billing/invoices", Some(&caller("c"))).unwrap_err();
    assert_eq!(
        denial,
        GateDenial::CapabilityDisabled {
            capability: CapabilityName::new("billing"),
        }
    );
    assert_eq!(denial.to_string(), "Capability 'billing' is not enabled");
    assert_eq!(fixture.audit.count(AuditEventKind::GateDenied), 1);
    assert!(fixture.ledger.events().unwrap().is_empty());
}

#[test]
fn quota_is_enforced_per_caller() {
    let fixture = fixture();
    let alice = caller("alice");
    admit_and_complete(&fixture, "/api/search?q=1", &alice);
    admit_and_complete(&fixture, "/api/search?q=2", &alice);

    let denial = fixture.gate.admit("/api/search?q=3", Some(&alice)).unwrap_err();
    assert_eq!(
        denial,
        GateDenial::RateLimited {
            capability: CapabilityName::new("search"),
            rate_limit: "2/hour".to_string(),
            quota: 2,
            used: 2,
            period: PeriodUnit::Hour,
        }
    );
    assert_eq!(fixture.ledger.events().unwrap().len(), 2);

    admit_and_complete(&fixture, "/api/search", &caller("bob"));
    assert_eq!(fixture.ledger.events().unwrap().len(), 3);
}

#[test]
fn quota_frees_up_after_the_window() {
    let fixture = fixture();
    let alice = caller("alice");
    admit_and_complete(&fixture, "/api/search", &alice);
    admit_and_complete(&fixture, "/api/search", &alice);
    assert!(fixture.gate.admit("/api/search", Some(&alice)).is_err());

    fixture.clock.advance(Duration::from_secs(3_601));
    admit_and_complete(&fixture, "/api/search", &alice);
}

#[test]
fn unknown_period_unit_fails_open_with_audit() {
    let fixture = fixture();
    let who = caller("c");
    for _ in 0 .. 10 {
        admit_and_complete(&fixture, "/api/weekly/report", &who);
    }
    assert_eq!(fixture.ledger.events().unwrap().len(), 10);
    assert_eq!(fixture.audit.count(AuditEventKind::RateCheckFailedOpen), 10);
    assert_eq!(fixture.metrics.decisions(GateDecision::FailedOpen), 10);
}

#[test]
fn roles_are_only_checked_when_enforced() {
    let fixture = fixture();
    let Admission::Admitted(ticket) = fixture.gate.admit("/api/deploy", Some(&caller("c"))).unwrap()
    else {
        panic!("expected admission without role enforcement");
    };
    ticket.complete(true, None);

    let enforcing = Fixture {
        gate: fixture.gate.with_role_enforcement(true),
        ..fixture
    };
    let denial = enforcing.gate.admit("/api/deploy", Some(&caller("c"))).unwrap_err();
    assert_eq!(denial.reason(), "role_required");
    let admin = ResolvedCaller::new("ops", &["admin"]);
    assert!(matches!(
        enforcing.gate.admit("/api/deploy", Some(&admin)).unwrap(),
        Admission::Admitted(_)
    ));
}

#[test]
fn dropped_ticket_records_a_failure() {
    let fixture = fixture();
    let admission = fixture.gate.admit("/api/search", Some(&caller("c"))).unwrap();
    drop(admission);
    let events = fixture.ledger.events().unwrap();
    assert_eq!(events.len(), 1);
    assert!(!events[0].success);
    assert_eq!(events[0].error.as_deref(), Some("request cancelled before completion"));
}

// ============================================================================
// SECTION: Guard
// ============================================================================

#[tokio::test]
async fn guard_records_and_returns_downstream_errors_unchanged() {
    let fixture = fixture();
    let who = caller("c");
    let outcome: Result<Result<(), String>, GateDenial> = fixture
        .gate
        .guard("/api/search", Some(&who), async { Err("upstream exploded".to_string()) })
        .await;
    assert_eq!(outcome.unwrap(), Err("upstream exploded".to_string()));

    let events = fixture.ledger.events().unwrap();
    assert_eq!(events.len(), 1);
    assert!(!events[0].success);
    assert_eq!(events[0].error.as_deref(), Some("upstream exploded"));
    assert_eq!(events[0].caller_id.as_str(), "c");
    assert_eq!(events[0].endpoint, "/api/search");
}

#[tokio::test]
async fn guard_never_runs_downstream_when_denied() {
    let fixture = fixture();
    let ran = AtomicBool::new(false);
    let outcome = fixture
        .gate
        .guard("/api/billing", Some(&caller("c")), async {
            ran.store(true, Ordering::SeqCst);
            Ok::<(), String>(())
        })
        .await;
    assert!(outcome.is_err());
    assert!(!ran.load(Ordering::SeqCst));
    assert!(fixture.ledger.events().unwrap().is_empty());
}

// capgate-core/tests/common/mod.rs
// ============================================================================
// Module: Common Test Fixtures
// Description: Shared fixtures for capgate-core integration tests.
// Purpose: Provide failing backends and a capturing audit sink.
// Dependencies: capgate-core
// ============================================================================

//! ## Overview
//! Fixtures here inject durable-store and ledger failures so fail-open and
//! write-through rollback paths can be exercised without real I/O faults.

#![allow(dead_code, reason = "Shared test helpers may be unused in some cases.")]

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use capgate_core::AuditEvent;
use capgate_core::AuditEventKind;
use capgate_core::AuditSink;
use capgate_core::BucketKey;
use capgate_core::CallerId;
use capgate_core::Capability;
use capgate_core::CapabilityName;
use capgate_core::CapabilityStore;
use capgate_core::InMemoryCapabilityStore;
use capgate_core::LedgerError;
use capgate_core::StoreError;
use capgate_core::Timestamp;
use capgate_core::UsageEvent;
use capgate_core::UsageLedger;

// ============================================================================
// SECTION: Audit
// ============================================================================

/// Audit sink that keeps every event in memory.
#[derive(Default)]
pub struct CapturingAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl CapturingAuditSink {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, kind: AuditEventKind) -> usize {
        self.events().iter().filter(|event| event.event == kind).count()
    }
}

impl AuditSink for CapturingAuditSink {
    fn record(&self, event: &AuditEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

// ============================================================================
// SECTION: Stores
// ============================================================================

/// Capability store whose reads and/or writes can be forced to fail.
///
/// Entry writes are counted; `fail_on_write(n)` makes the n-th entry write
/// (1-based) fail. Multi-entry writes stage every entry before committing,
/// so a failure leaves the inner store untouched.
#[derive(Default)]
pub struct FlakyCapabilityStore {
    inner: InMemoryCapabilityStore,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    entry_writes: AtomicUsize,
    fail_on_write: AtomicUsize,
}

impl FlakyCapabilityStore {
    pub fn with_capabilities(capabilities: Vec<Capability>) -> Self {
        Self {
            inner: InMemoryCapabilityStore::with_capabilities(capabilities),
            ..Self::default()
        }
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_on_write(&self, write: usize) {
        self.fail_on_write.store(write, Ordering::SeqCst);
    }

    /// Counts one entry write and reports whether it must fail.
    fn entry_write_fails(&self) -> bool {
        let write = self.entry_writes.fetch_add(1, Ordering::SeqCst) + 1;
        self.fail_writes.load(Ordering::SeqCst)
            || self.fail_on_write.load(Ordering::SeqCst) == write
    }
}

impl CapabilityStore for FlakyCapabilityStore {
    fn load_all(&self) -> Result<Vec<Capability>, StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Io("disk unavailable".to_string()));
        }
        self.inner.load_all()
    }

    fn upsert(&self, capability: &Capability, actor: &CallerId) -> Result<(), StoreError> {
        self.upsert_all(std::slice::from_ref(capability), actor)
    }

    fn upsert_all(&self, capabilities: &[Capability], actor: &CallerId) -> Result<(), StoreError> {
        for _ in capabilities {
            if self.entry_write_fails() {
                return Err(StoreError::Io("disk full".to_string()));
            }
        }
        self.inner.upsert_all(capabilities, actor)
    }
}

/// Usage ledger that fails every operation.
pub struct BrokenLedger;

impl UsageLedger for BrokenLedger {
    fn append(&self, _event: UsageEvent) -> Result<(), LedgerError> {
        Err(LedgerError::Storage("ledger offline".to_string()))
    }

    fn count_in_window(
        &self,
        _caller_id: &CallerId,
        _capability: &CapabilityName,
        _since: Timestamp,
    ) -> Result<u64, LedgerError> {
        Err(LedgerError::Storage("ledger offline".to_string()))
    }

    fn count_all_since(&self, _since: Timestamp) -> Result<u64, LedgerError> {
        Err(LedgerError::Storage("ledger offline".to_string()))
    }

    fn acquire_bucket_slot(&self, _key: &BucketKey, _quota: u64) -> Result<bool, LedgerError> {
        Err(LedgerError::Storage("ledger offline".to_string()))
    }
}

// ============================================================================
// SECTION: Builders
// ============================================================================

pub fn usage_event(caller: &str, capability: &str, at_ms: i64) -> UsageEvent {
    UsageEvent {
        caller_id: CallerId::new(caller),
        capability: CapabilityName::new(capability),
        endpoint: "/api/scrape".to_string(),
        timestamp: Timestamp::from_unix_millis(at_ms),
        success: true,
        latency_ms: Some(5),
        error: None,
    }
}

// capgate-core/src/ledger.rs
// ============================================================================
// Module: Usage Ledger
// Description: Append-only usage events, window counts, and atomic buckets.
// Purpose: Record gated calls and answer trailing-window rate queries.
// Dependencies: serde, thiserror
// ============================================================================

//! ## Overview
//! The usage ledger is an append-only log of gated calls keyed by
//! `(caller, capability, timestamp)`. Rate evaluation only ever asks for
//! counts over trailing time ranges, so events inserted out of timestamp
//! order are still counted correctly.
//!
//! Ledgers also expose fixed-window atomic buckets used by the
//! `AtomicBucket` rate policy: a bucket slot is acquired by incrementing a
//! counter keyed by `(caller, capability, window start)` only while it is
//! below the quota, in a single critical section.
//!
//! Security posture: ledger contents are caller-attributed; callers of
//! [`SharedUsageLedger::record`] never see ledger write failures.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::audit::AuditEvent;
use crate::audit::AuditEventKind;
use crate::audit::AuditEventParams;
use crate::audit::AuditSink;
use crate::identifiers::CallerId;
use crate::identifiers::CapabilityName;
use crate::time::Timestamp;

// ============================================================================
// SECTION: Types
// ============================================================================

/// One gated call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageEvent {
    /// Caller that issued the request.
    pub caller_id: CallerId,
    /// Capability that governed the request.
    pub capability: CapabilityName,
    /// Request path.
    pub endpoint: String,
    /// Completion time of the downstream call.
    pub timestamp: Timestamp,
    /// Whether the downstream call succeeded.
    pub success: bool,
    /// Downstream latency in milliseconds.
    pub latency_ms: Option<u64>,
    /// Downstream error text for failed calls.
    pub error: Option<String>,
}

/// Fixed-window bucket key for atomic rate limiting.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BucketKey {
    /// Caller the bucket counts for.
    pub caller_id: CallerId,
    /// Capability the bucket counts for.
    pub capability: CapabilityName,
    /// Start of the fixed window.
    pub window_start: Timestamp,
}

/// Usage ledger errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    /// Ledger storage error.
    #[error("usage ledger error: {0}")]
    Storage(String),
}

// ============================================================================
// SECTION: Ledger Interface
// ============================================================================

/// Append-only usage ledger interface.
pub trait UsageLedger: Send + Sync {
    /// Appends an event to the ledger.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] when the ledger cannot persist the event.
    fn append(&self, event: UsageEvent) -> Result<(), LedgerError>;

    /// Counts events for `(caller, capability)` with `timestamp >= since`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] when the ledger query fails.
    fn count_in_window(
        &self,
        caller_id: &CallerId,
        capability: &CapabilityName,
        since: Timestamp,
    ) -> Result<u64, LedgerError>;

    /// Counts all events with `timestamp >= since`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] when the ledger query fails.
    fn count_all_since(&self, since: Timestamp) -> Result<u64, LedgerError>;

    /// Atomically increments the bucket for `key` when it holds fewer than
    /// `quota` admissions. Returns true when a slot was acquired. A key with
    /// a later window start than the stored bucket resets the count.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] when the bucket cannot be updated.
    fn acquire_bucket_slot(&self, key: &BucketKey, quota: u64) -> Result<bool, LedgerError>;
}

// ============================================================================
// SECTION: In-Memory Ledger
// ============================================================================

/// Stored bucket state for one `(caller, capability)` pair.
#[derive(Debug, Clone, Copy)]
struct BucketState {
    /// Window the count applies to.
    window_start: Timestamp,
    /// Admissions counted in the window.
    used: u64,
}

/// In-memory usage ledger (test/dev only).
#[derive(Debug, Default)]
pub struct InMemoryUsageLedger {
    /// Stored usage events with their sequence ids.
    events: Mutex<Vec<(u64, UsageEvent)>>,
    /// Current fixed-window bucket per `(caller, capability)`.
    buckets: Mutex<BTreeMap<(CallerId, CapabilityName), BucketState>>,
}

impl InMemoryUsageLedger {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of every stored event in insertion order.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] when the ledger lock is poisoned.
    pub fn events(&self) -> Result<Vec<UsageEvent>, LedgerError> {
        let events = self
            .events
            .lock()
            .map_err(|_| LedgerError::Storage("ledger lock poisoned".to_string()))?;
        Ok(events.iter().map(|(_, event)| event.clone()).collect())
    }
}

impl UsageLedger for InMemoryUsageLedger {
    fn append(&self, event: UsageEvent) -> Result<(), LedgerError> {
        let mut events = self
            .events
            .lock()
            .map_err(|_| LedgerError::Storage("ledger lock poisoned".to_string()))?;
        let seq = events.last().map_or(1, |(seq, _)| seq.saturating_add(1));
        events.push((seq, event));
        drop(events);
        Ok(())
    }

    fn count_in_window(
        &self,
        caller_id: &CallerId,
        capability: &CapabilityName,
        since: Timestamp,
    ) -> Result<u64, LedgerError> {
        let events = self
            .events
            .lock()
            .map_err(|_| LedgerError::Storage("ledger lock poisoned".to_string()))?;
        let count = events
            .iter()
            .filter(|(_, event)| {
                event.caller_id == *caller_id
                    && event.capability == *capability
                    && event.timestamp >= since
            })
            .count();
        drop(events);
        Ok(u64::try_from(count).unwrap_or(u64::MAX))
    }

    fn count_all_since(&self, since: Timestamp) -> Result<u64, LedgerError> {
        let events = self
            .events
            .lock()
            .map_err(|_| LedgerError::Storage("ledger lock poisoned".to_string()))?;
        let count = events.iter().filter(|(_, event)| event.timestamp >= since).count();
        drop(events);
        Ok(u64::try_from(count).unwrap_or(u64::MAX))
    }

    fn acquire_bucket_slot(&self, key: &BucketKey, quota: u64) -> Result<bool, LedgerError> {
        let mut buckets = self
            .buckets
            .lock()
            .map_err(|_| LedgerError::Storage("ledger lock poisoned".to_string()))?;
        let slot = (key.caller_id.clone(), key.capability.clone());
        let acquired = match buckets.get_mut(&slot) {
            None => {
                buckets.insert(
                    slot,
                    BucketState {
                        window_start: key.window_start,
                        used: 1,
                    },
                );
                true
            }
            Some(state) if key.window_start > state.window_start => {
                *state = BucketState {
                    window_start: key.window_start,
                    used: 1,
                };
                true
            }
            Some(state) if state.used < quota => {
                state.used = state.used.saturating_add(1);
                true
            }
            Some(_) => false,
        };
        drop(buckets);
        Ok(acquired)
    }
}

// ============================================================================
// SECTION: Shared Ledger Wrapper
// ============================================================================

/// Shared usage ledger backed by an `Arc` trait object.
#[derive(Clone)]
pub struct SharedUsageLedger {
    /// Inner ledger implementation.
    inner: Arc<dyn UsageLedger>,
}

impl SharedUsageLedger {
    /// Wraps a usage ledger in a shared, clonable wrapper.
    #[must_use]
    pub fn from_ledger(ledger: impl UsageLedger + 'static) -> Self {
        Self {
            inner: Arc::new(ledger),
        }
    }

    /// Wraps an existing shared ledger.
    #[must_use]
    pub const fn new(ledger: Arc<dyn UsageLedger>) -> Self {
        Self {
            inner: ledger,
        }
    }

    /// Appends `event`, swallowing failures. A failed write emits a
    /// `usage_record_failed` audit event and is never retried.
    pub fn record(&self, event: UsageEvent, audit: &dyn AuditSink) {
        let caller_id = event.caller_id.clone();
        let capability = event.capability.clone();
        let endpoint = event.endpoint.clone();
        if let Err(err) = self.inner.append(event) {
            audit.record(&AuditEvent::new(
                AuditEventKind::UsageRecordFailed,
                AuditEventParams {
                    capability: Some(capability),
                    caller_id: Some(caller_id),
                    endpoint: Some(endpoint),
                    reason: Some("ledger_write_failed"),
                    detail: Some(err.to_string()),
                },
            ));
        }
    }
}

impl UsageLedger for SharedUsageLedger {
    fn append(&self, event: UsageEvent) -> Result<(), LedgerError> {
        self.inner.append(event)
    }

    fn count_in_window(
        &self,
        caller_id: &CallerId,
        capability: &CapabilityName,
        since: Timestamp,
    ) -> Result<u64, LedgerError> {
        self.inner.count_in_window(caller_id, capability, since)
    }

    fn count_all_since(&self, since: Timestamp) -> Result<u64, LedgerError> {
        self.inner.count_all_since(since)
    }

    fn acquire_bucket_slot(&self, key: &BucketKey, quota: u64) -> Result<bool, LedgerError> {
        self.inner.acquire_bucket_slot(key, quota)
    }
}

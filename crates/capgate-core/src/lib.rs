// capgate-core/src/lib.rs
// ============================================================================
// Module: capgate Core Library
// Description: Public API surface for the capability gate core.
// Purpose: Expose capability types, registry, ledger, and rate evaluation.
// Dependencies: serde, serde_json, thiserror
// ============================================================================

//! ## Overview
//! `capgate-core` models named capabilities that govern endpoint prefixes,
//! the append-only usage ledger that records gated calls, and the rate
//! policy evaluator that decides whether a caller may proceed. It is
//! transport-agnostic: HTTP integration lives in `capgate-server` and
//! durable backends live in `capgate-store-sqlite`.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod audit;
pub mod capability;
pub mod evaluator;
pub mod identifiers;
pub mod ledger;
pub mod registry;
pub mod store;
pub mod time;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use audit::AuditEvent;
pub use audit::AuditEventKind;
pub use audit::AuditEventParams;
pub use audit::AuditSink;
pub use audit::FileAuditSink;
pub use audit::NoopAuditSink;
pub use audit::StderrAuditSink;
pub use capability::Capability;
pub use capability::CapabilityConfig;
pub use capability::CapabilityConfigError;
pub use capability::PeriodUnit;
pub use capability::RateLimitMode;
pub use capability::RateLimitParseError;
pub use capability::RateLimitPolicy;
pub use capability::default_capabilities;
pub use evaluator::FailOpenReason;
pub use evaluator::RateDecision;
pub use evaluator::RateEvaluator;
pub use identifiers::CallerId;
pub use identifiers::CapabilityName;
pub use ledger::BucketKey;
pub use ledger::InMemoryUsageLedger;
pub use ledger::LedgerError;
pub use ledger::SharedUsageLedger;
pub use ledger::UsageEvent;
pub use ledger::UsageLedger;
pub use registry::CapabilityRegistry;
pub use registry::RegistryError;
pub use registry::RegistrySnapshot;
pub use registry::RegistrySource;
pub use store::CapabilityStore;
pub use store::InMemoryCapabilityStore;
pub use store::SharedCapabilityStore;
pub use store::StoreError;
pub use time::Clock;
pub use time::ManualClock;
pub use time::SystemClock;
pub use time::Timestamp;

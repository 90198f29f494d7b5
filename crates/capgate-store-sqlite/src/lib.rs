// capgate-store-sqlite/src/lib.rs
// ============================================================================
// Module: SQLite Capability Store
// Description: Durable capability configuration and usage ledger on SQLite.
// Purpose: Provide production persistence for the capability gate.
// Dependencies: capgate-core, rusqlite
// ============================================================================

//! ## Overview
//! This crate provides a SQLite-backed [`capgate_core::CapabilityStore`]
//! and [`capgate_core::UsageLedger`]. Both share one schema, so a single
//! database file may back either or both. Security posture: database
//! contents are untrusted and decoded fail-closed.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod ledger;
pub mod store;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use ledger::SqliteUsageLedger;
pub use store::MAX_CONFIG_JSON_BYTES;
pub use store::SqliteCapabilityStore;
pub use store::SqliteStoreConfig;
pub use store::SqliteStoreError;
pub use store::SqliteStoreMode;
pub use store::SqliteSyncMode;

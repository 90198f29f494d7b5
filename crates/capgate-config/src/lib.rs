// capgate-config/src/lib.rs
// ============================================================================
// Module: capgate Config Library
// Description: Canonical config model and validation.
// Purpose: Single source of truth for capgate.toml semantics.
// Dependencies: capgate-core, capgate-store-sqlite, serde, toml
// ============================================================================

//! ## Overview
//! `capgate-config` defines the canonical configuration model for the
//! capability gate. Structural errors fail closed; rate-limit
//! misconfiguration that the gate would treat as unlimited is surfaced as
//! [`ConfigWarning`]s so it is caught before traffic arrives.
//!
//! Security posture: config inputs are untrusted.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod config;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use config::*;

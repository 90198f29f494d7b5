// capgate-server/src/lib.rs
// ============================================================================
// Module: capgate Server Library
// Description: HTTP integration for the capability gate.
// Purpose: Gate governed routes, resolve callers, and expose the admin API.
// Dependencies: axum, capgate-core, capgate-config, capgate-store-sqlite
// ============================================================================

//! ## Overview
//! `capgate-server` wires the transport-agnostic [`RequestGate`] into an
//! axum router. Every request passes through the gate middleware: governed
//! paths are checked for enablement and rate limits before the downstream
//! handler runs, and exactly one usage event is recorded per admitted call.
//! Admin endpoints under `/api/admin` manage the capability registry.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod admin;
pub mod auth;
pub mod gate;
pub mod middleware;
pub mod server;
pub mod snapshot_store;
pub mod telemetry;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use auth::AuthError;
pub use auth::CallerResolver;
pub use auth::ResolvedCaller;
pub use auth::StaticTokenResolver;
pub use gate::Admission;
pub use gate::AdmissionTicket;
pub use gate::GateDenial;
pub use gate::GateOutcome;
pub use gate::RequestGate;
pub use server::AppState;
pub use server::GateComponents;
pub use server::GateServer;
pub use server::ServerError;
pub use snapshot_store::JsonFileCapabilityStore;
pub use telemetry::GATE_LATENCY_BUCKETS_MS;
pub use telemetry::GateDecision;
pub use telemetry::GateMetricEvent;
pub use telemetry::GateMetrics;
pub use telemetry::InMemoryGateMetrics;
pub use telemetry::NoopMetrics;

// capgate-server/src/telemetry.rs
// ============================================================================
// Module: Gate Telemetry
// Description: Metric hooks for gate decisions and downstream latency.
// Purpose: Provide decision counters and latency buckets without hard deps.
// Dependencies: capgate-core
// ============================================================================

//! ## Overview
//! A thin metrics interface for gate decisions. Deployments plug in their
//! own exporter by implementing [`GateMetrics`]; the default is a no-op.
//! [`InMemoryGateMetrics`] keeps counters and a bucketed latency histogram
//! for tests and local inspection.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use capgate_core::CapabilityName;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Latency buckets in milliseconds for gated downstream calls.
pub const GATE_LATENCY_BUCKETS_MS: &[u64] =
    &[1, 2, 5, 10, 25, 50, 100, 250, 500, 1_000, 2_500, 5_000, 10_000, 30_000];

// ============================================================================
// SECTION: Metric Labels
// ============================================================================

/// Gate decision classification.
///
/// # Invariants
/// - Variants are stable for telemetry labeling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateDecision {
    /// No capability governs the path.
    Ungoverned,
    /// Governed path without a resolved caller.
    Ungated,
    /// Admitted within policy.
    Allowed,
    /// Admitted because the rate check could not be made.
    FailedOpen,
    /// Denied because the capability is disabled.
    Disabled,
    /// Denied because the caller lacks the required role.
    RoleRequired,
    /// Denied because the quota is exhausted.
    RateLimited,
}

impl GateDecision {
    /// Returns a stable label for the decision.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ungoverned => "ungoverned",
            Self::Ungated => "ungated",
            Self::Allowed => "allowed",
            Self::FailedOpen => "failed_open",
            Self::Disabled => "disabled",
            Self::RoleRequired => "role_required",
            Self::RateLimited => "rate_limited",
        }
    }
}

/// Gate metric event payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateMetricEvent {
    /// Capability governing the request, when any.
    pub capability: Option<CapabilityName>,
    /// Gate decision.
    pub decision: GateDecision,
    /// Downstream success flag, set once the downstream call completes.
    pub success: Option<bool>,
}

// ============================================================================
// SECTION: Trait
// ============================================================================

/// Metrics sink for gate decisions and latencies.
pub trait GateMetrics: Send + Sync {
    /// Records a gate decision.
    fn record_decision(&self, event: &GateMetricEvent);
    /// Records the downstream latency of an admitted request.
    fn record_latency(&self, event: &GateMetricEvent, latency: Duration);
}

/// No-op metrics sink.
pub struct NoopMetrics;

impl GateMetrics for NoopMetrics {
    fn record_decision(&self, _event: &GateMetricEvent) {}

    fn record_latency(&self, _event: &GateMetricEvent, _latency: Duration) {}
}

// ============================================================================
// SECTION: In-Memory Metrics
// ============================================================================

/// Counter and histogram state.
#[derive(Debug, Default)]
struct MetricState {
    /// Decision counters.
    decisions: BTreeMap<GateDecision, u64>,
    /// Latency histogram keyed by bucket upper bound (`u64::MAX` for
    /// overflow).
    latency: BTreeMap<u64, u64>,
}

/// Metrics sink that keeps counters in memory.
#[derive(Debug, Default)]
pub struct InMemoryGateMetrics {
    /// Guarded metric state.
    state: Mutex<MetricState>,
}

impl InMemoryGateMetrics {
    /// Creates an empty metrics sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of recorded decisions of `decision`.
    #[must_use]
    pub fn decisions(&self, decision: GateDecision) -> u64 {
        let guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        guard.decisions.get(&decision).copied().unwrap_or(0)
    }

    /// Returns the latency histogram as `(bucket_upper_ms, count)` pairs.
    #[must_use]
    pub fn latency_histogram(&self) -> Vec<(u64, u64)> {
        let guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        guard.latency.iter().map(|(bucket, count)| (*bucket, *count)).collect()
    }
}

impl GateMetrics for InMemoryGateMetrics {
    fn record_decision(&self, event: &GateMetricEvent) {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        *guard.decisions.entry(event.decision).or_insert(0) += 1;
    }

    fn record_latency(&self, _event: &GateMetricEvent, latency: Duration) {
        let bucket = latency_bucket_ms(latency);
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        *guard.latency.entry(bucket).or_insert(0) += 1;
    }
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Returns the smallest bucket bound covering `latency`, or `u64::MAX`.
#[must_use]
pub fn latency_bucket_ms(latency: Duration) -> u64 {
    let millis = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
    GATE_LATENCY_BUCKETS_MS.iter().copied().find(|bound| millis <= *bound).unwrap_or(u64::MAX)
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latency_buckets_round_up() {
        assert_eq!(latency_bucket_ms(Duration::from_millis(0)), 1);
        assert_eq!(latency_bucket_ms(Duration::from_millis(7)), 10);
        assert_eq!(latency_bucket_ms(Duration::from_millis(250)), 250);
        assert_eq!(latency_bucket_ms(Duration::from_secs(60)), u64::MAX);
    }

    #[test]
    fn in_memory_metrics_count_decisions() {
        let metrics = InMemoryGateMetrics::new();
        let event = GateMetricEvent {
            capability: None,
            decision: GateDecision::Ungoverned,
            success: None,
        };
        metrics.record_decision(&event);
        metrics.record_decision(&event);
        metrics.record_latency(&event, Duration::from_millis(3));
        assert_eq!(metrics.decisions(GateDecision::Ungoverned), 2);
        assert_eq!(metrics.decisions(GateDecision::Allowed), 0);
        assert_eq!(metrics.latency_histogram(), vec![(5, 1)]);
    }
}

// capgate-core/src/evaluator.rs
// ============================================================================
// Module: Rate Policy Evaluator
// Description: Per-caller, per-capability rate decisions over the ledger.
// Purpose: Decide whether a caller is within quota for a capability.
// Dependencies: crate::ledger, crate::capability
// ============================================================================

//! ## Overview
//! The evaluator turns a [`RateLimitPolicy`] plus ledger state into a
//! [`RateDecision`]. Trailing-window policies count events with
//! `timestamp >= now - period` and allow iff the count is below the quota.
//! Concurrent check-then-act evaluations may overshoot the quota; the
//! atomic-bucket policy removes that overshoot by acquiring a fixed-window
//! slot in one ledger operation.
//!
//! Evaluation fails open: an unparseable policy or an unavailable ledger
//! yields [`RateDecision::FailOpen`], which admits the request. Callers are
//! expected to audit fail-open decisions.

// ============================================================================
// SECTION: Imports
// ============================================================================

use crate::capability::CapabilityConfig;
use crate::capability::PeriodUnit;
use crate::capability::RateLimitParseError;
use crate::capability::RateLimitPolicy;
use crate::identifiers::CallerId;
use crate::identifiers::CapabilityName;
use crate::ledger::BucketKey;
use crate::ledger::UsageLedger;
use crate::time::Timestamp;

// ============================================================================
// SECTION: Types
// ============================================================================

/// Reason a rate check admitted a request without evaluating a quota.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOpenReason {
    /// The configured rate limit could not be parsed.
    Misconfigured(RateLimitParseError),
    /// The ledger could not answer the query.
    LedgerUnavailable(String),
}

impl FailOpenReason {
    /// Returns the stable reason label.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Misconfigured(err) => err.code(),
            Self::LedgerUnavailable(_) => "ledger_unavailable",
        }
    }
}

/// Rate decision for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateDecision {
    /// No rate limit applies.
    Unlimited,
    /// Within quota.
    Allowed {
        /// Configured quota.
        quota: u64,
        /// Admissions counted before this one (zero when the ledger does
        /// not report it).
        used: u64,
    },
    /// Quota exhausted.
    Denied {
        /// Configured quota.
        quota: u64,
        /// Admissions counted in the window.
        used: u64,
        /// Window length.
        period: PeriodUnit,
    },
    /// Admitted without a quota check.
    FailOpen {
        /// Why the check could not be made.
        reason: FailOpenReason,
    },
}

impl RateDecision {
    /// Returns true when the request may proceed.
    #[must_use]
    pub const fn is_allowed(&self) -> bool {
        !matches!(self, Self::Denied { .. })
    }
}

// ============================================================================
// SECTION: Evaluator
// ============================================================================

/// Stateless rate policy evaluator.
#[derive(Debug, Clone, Copy, Default)]
pub struct RateEvaluator;

impl RateEvaluator {
    /// Decides whether `caller_id` may invoke `capability` at `now` under
    /// `policy`.
    ///
    /// For atomic-bucket policies an allowed decision has already consumed
    /// a slot in the current window.
    #[must_use]
    pub fn check_allowed(
        policy: &RateLimitPolicy,
        caller_id: &CallerId,
        capability: &CapabilityName,
        ledger: &dyn UsageLedger,
        now: Timestamp,
    ) -> RateDecision {
        match *policy {
            RateLimitPolicy::Unlimited => RateDecision::Unlimited,
            RateLimitPolicy::TrailingWindow {
                quota,
                period,
            } => {
                let since = now.saturating_sub(period.duration());
                match ledger.count_in_window(caller_id, capability, since) {
                    Ok(used) if used < quota => RateDecision::Allowed {
                        quota,
                        used,
                    },
                    Ok(used) => RateDecision::Denied {
                        quota,
                        used,
                        period,
                    },
                    Err(err) => RateDecision::FailOpen {
                        reason: FailOpenReason::LedgerUnavailable(err.to_string()),
                    },
                }
            }
            RateLimitPolicy::AtomicBucket {
                quota,
                period,
            } => {
                let key = BucketKey {
                    caller_id: caller_id.clone(),
                    capability: capability.clone(),
                    window_start: now.window_start(period.duration()),
                };
                match ledger.acquire_bucket_slot(&key, quota) {
                    Ok(true) => RateDecision::Allowed {
                        quota,
                        used: 0,
                    },
                    Ok(false) => RateDecision::Denied {
                        quota,
                        used: quota,
                        period,
                    },
                    Err(err) => RateDecision::FailOpen {
                        reason: FailOpenReason::LedgerUnavailable(err.to_string()),
                    },
                }
            }
        }
    }

    /// Parses `config`'s rate limit and evaluates it. Unparseable limits
    /// fail open.
    #[must_use]
    pub fn evaluate_capability(
        config: &CapabilityConfig,
        caller_id: &CallerId,
        capability: &CapabilityName,
        ledger: &dyn UsageLedger,
        now: Timestamp,
    ) -> RateDecision {
        match config.policy() {
            Ok(policy) => Self::check_allowed(&policy, caller_id, capability, ledger, now),
            Err(err) => RateDecision::FailOpen {
                reason: FailOpenReason::Misconfigured(err),
            },
        }
    }
}

// capgate-core/src/time.rs
// ============================================================================
// Module: capgate Time
// Description: Wall-clock timestamps and injectable clocks.
// Purpose: Give window computations a single, testable notion of "now".
// Dependencies: serde
// ============================================================================

//! ## Overview
//! Timestamps are UTC milliseconds since the Unix epoch. Rate windows are
//! always trailing ranges computed from a [`Clock`], so clock skew between
//! inserts never corrupts ordering assumptions.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use serde::Deserialize;
use serde::Serialize;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Milliseconds in one UTC day.
const MILLIS_PER_DAY: i64 = 86_400_000;

// ============================================================================
// SECTION: Timestamp
// ============================================================================

/// UTC timestamp in milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Builds a timestamp from Unix milliseconds.
    #[must_use]
    pub const fn from_unix_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// Returns the Unix milliseconds value.
    #[must_use]
    pub const fn as_unix_millis(self) -> i64 {
        self.0
    }

    /// Returns the current wall-clock time.
    #[must_use]
    pub fn now() -> Self {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        Self(i64::try_from(now.as_millis()).unwrap_or(i64::MAX))
    }

    /// Returns this timestamp moved back by `duration`, saturating at the
    /// minimum representable value.
    #[must_use]
    pub fn saturating_sub(self, duration: Duration) -> Self {
        Self(self.0.saturating_sub(duration_millis(duration)))
    }

    /// Returns this timestamp moved forward by `duration`, saturating at the
    /// maximum representable value.
    #[must_use]
    pub fn saturating_add(self, duration: Duration) -> Self {
        Self(self.0.saturating_add(duration_millis(duration)))
    }

    /// Returns the start of the fixed window of length `window` containing
    /// this timestamp.
    #[must_use]
    pub fn window_start(self, window: Duration) -> Self {
        let width = duration_millis(window).max(1);
        Self(self.0.div_euclid(width).saturating_mul(width))
    }

    /// Returns midnight UTC of the day containing this timestamp.
    #[must_use]
    pub const fn start_of_utc_day(self) -> Self {
        Self(self.0.div_euclid(MILLIS_PER_DAY).saturating_mul(MILLIS_PER_DAY))
    }
}

/// Converts a duration to whole milliseconds, saturating at `i64::MAX`.
fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

// ============================================================================
// SECTION: Clocks
// ============================================================================

/// Source of wall-clock time for window computations.
pub trait Clock: Send + Sync {
    /// Returns the current time.
    fn now(&self) -> Timestamp;
}

/// Clock backed by the system wall clock.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

/// Manually driven clock for deterministic tests and replay tooling.
///
/// # Invariants
/// - Time only moves when [`ManualClock::set`] or [`ManualClock::advance`] is
///   called.
#[derive(Debug)]
pub struct ManualClock {
    /// Current time in Unix milliseconds.
    millis: AtomicI64,
}

impl ManualClock {
    /// Creates a manual clock starting at `start`.
    #[must_use]
    pub const fn new(start: Timestamp) -> Self {
        Self {
            millis: AtomicI64::new(start.as_unix_millis()),
        }
    }

    /// Sets the current time.
    pub fn set(&self, now: Timestamp) {
        self.millis.store(now.as_unix_millis(), Ordering::SeqCst);
    }

    /// Advances the current time by `duration`.
    pub fn advance(&self, duration: Duration) {
        self.millis.fetch_add(duration_millis(duration), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_unix_millis(self.millis.load(Ordering::SeqCst))
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================

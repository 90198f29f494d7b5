// capgate-core/src/capability.rs
// ============================================================================
// Module: Capability Model
// Description: Capability configuration, rate-limit policies, and defaults.
// Purpose: Define the per-capability gating inputs and their validation.
// Dependencies: serde, thiserror
// ============================================================================

//! ## Overview
//! A capability is a named, independently toggleable feature area. Each one
//! carries an enabled flag, an optional required role, an optional rate
//! limit written as `"<quota>/<unit>"`, and the ordered endpoint prefixes it
//! governs.
//!
//! Rate limits are parsed lazily: a malformed or unknown-unit limit is not a
//! structural configuration error. The evaluator treats it as unlimited and
//! the registry reports it, so misconfiguration never blocks traffic. A zero
//! quota is the one rate-limit error rejected up front.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::identifiers::CapabilityName;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Maximum length of a capability name.
pub const MAX_CAPABILITY_NAME_LENGTH: usize = 64;
/// Maximum number of endpoint prefixes per capability.
pub const MAX_ENDPOINTS_PER_CAPABILITY: usize = 64;
/// Maximum length of a single endpoint prefix.
pub const MAX_ENDPOINT_LENGTH: usize = 256;
/// Maximum number of metadata labels (permissions, platforms, providers).
pub const MAX_METADATA_LABELS: usize = 64;

// ============================================================================
// SECTION: Rate Limit Policy
// ============================================================================

/// Period unit for a rate-limit quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodUnit {
    /// Sixty seconds.
    Minute,
    /// 3600 seconds.
    Hour,
    /// 86400 seconds.
    Day,
}

impl PeriodUnit {
    /// Parses a period unit label.
    #[must_use]
    pub fn parse(label: &str) -> Option<Self> {
        match label {
            "minute" => Some(Self::Minute),
            "hour" => Some(Self::Hour),
            "day" => Some(Self::Day),
            _ => None,
        }
    }

    /// Returns the stable label for the unit.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::Day => "day",
        }
    }

    /// Returns the window length for the unit.
    #[must_use]
    pub const fn duration(self) -> Duration {
        match self {
            Self::Minute => Duration::from_secs(60),
            Self::Hour => Duration::from_secs(3_600),
            Self::Day => Duration::from_secs(86_400),
        }
    }
}

/// Counting strategy used when a rate limit is present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitMode {
    /// Count ledger events in the trailing period ending now (check-then-act).
    #[default]
    TrailingWindow,
    /// Atomically increment a fixed-window counter before admitting.
    AtomicBucket,
}

/// Parsed rate-limit policy.
///
/// # Invariants
/// - `quota` is always greater than zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitPolicy {
    /// No limit.
    Unlimited,
    /// Trailing-window counter over the usage ledger.
    TrailingWindow {
        /// Maximum admitted calls per period.
        quota: u64,
        /// Window length.
        period: PeriodUnit,
    },
    /// Fixed-window atomic counter keyed by (caller, capability, window).
    AtomicBucket {
        /// Maximum admitted calls per window.
        quota: u64,
        /// Window length.
        period: PeriodUnit,
    },
}

impl RateLimitPolicy {
    /// Parses an optional `"<quota>/<unit>"` rate limit using `mode`.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitParseError`] when the limit is malformed, names an
    /// unknown unit, or has a zero quota.
    pub fn parse(raw: Option<&str>, mode: RateLimitMode) -> Result<Self, RateLimitParseError> {
        let Some(raw) = raw else {
            return Ok(Self::Unlimited);
        };
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Ok(Self::Unlimited);
        }
        let Some((quota, unit)) = trimmed.split_once('/') else {
            return Err(RateLimitParseError::MissingSeparator {
                raw: raw.to_string(),
            });
        };
        let quota: u64 = quota.trim().parse().map_err(|_| RateLimitParseError::InvalidQuota {
            raw: raw.to_string(),
        })?;
        if quota == 0 {
            return Err(RateLimitParseError::ZeroQuota {
                raw: raw.to_string(),
            });
        }
        let unit = unit.trim();
        let period = PeriodUnit::parse(unit).ok_or_else(|| RateLimitParseError::UnknownUnit {
            raw: raw.to_string(),
            unit: unit.to_string(),
        })?;
        Ok(match mode {
            RateLimitMode::TrailingWindow => Self::TrailingWindow {
                quota,
                period,
            },
            RateLimitMode::AtomicBucket => Self::AtomicBucket {
                quota,
                period,
            },
        })
    }

    /// Returns the quota when the policy is limited.
    #[must_use]
    pub const fn quota(&self) -> Option<u64> {
        match self {
            Self::Unlimited => None,
            Self::TrailingWindow {
                quota, ..
            }
            | Self::AtomicBucket {
                quota, ..
            } => Some(*quota),
        }
    }

    /// Returns the period when the policy is limited.
    #[must_use]
    pub const fn period(&self) -> Option<PeriodUnit> {
        match self {
            Self::Unlimited => None,
            Self::TrailingWindow {
                period, ..
            }
            | Self::AtomicBucket {
                period, ..
            } => Some(*period),
        }
    }
}

/// Rate-limit parse failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RateLimitParseError {
    /// The limit is not of the form `quota/unit`.
    #[error("rate limit {raw:?} must be of the form <quota>/<unit>")]
    MissingSeparator {
        /// Raw limit string.
        raw: String,
    },
    /// The quota is not a non-negative integer.
    #[error("rate limit {raw:?} has a non-numeric quota")]
    InvalidQuota {
        /// Raw limit string.
        raw: String,
    },
    /// The quota is zero.
    #[error("rate limit {raw:?} must have a quota greater than zero")]
    ZeroQuota {
        /// Raw limit string.
        raw: String,
    },
    /// The period unit is not one of minute, hour, day.
    #[error("rate limit {raw:?} uses unknown period unit {unit:?}")]
    UnknownUnit {
        /// Raw limit string.
        raw: String,
        /// Unrecognized unit label.
        unit: String,
    },
}

impl RateLimitParseError {
    /// Returns the stable error code for this parse error.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::MissingSeparator {
                ..
            } => "rate_limit_malformed",
            Self::InvalidQuota {
                ..
            } => "rate_limit_invalid_quota",
            Self::ZeroQuota {
                ..
            } => "rate_limit_zero_quota",
            Self::UnknownUnit {
                ..
            } => "rate_limit_unknown_unit",
        }
    }
}

// ============================================================================
// SECTION: Capability Configuration
// ============================================================================

/// Per-capability configuration as persisted and exchanged over the admin API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityConfig {
    /// Whether gated requests may proceed at all.
    pub enabled: bool,
    /// Role a caller must hold when role enforcement is on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires_role: Option<String>,
    /// Rate limit in `"<quota>/<unit>"` form; absent means unlimited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<String>,
    /// Counting strategy for the rate limit.
    #[serde(default)]
    pub rate_limit_mode: RateLimitMode,
    /// Governed endpoint prefixes, matched in order.
    #[serde(default)]
    pub endpoints: Vec<String>,
    /// Permission labels (informational).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permissions: Vec<String>,
    /// Platform labels (informational).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub platforms: Vec<String>,
    /// Provider labels (informational).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub providers: Vec<String>,
    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl CapabilityConfig {
    /// Builds a minimal configuration governing `endpoints`.
    #[must_use]
    pub fn new(enabled: bool, endpoints: &[&str]) -> Self {
        Self {
            enabled,
            requires_role: None,
            rate_limit: None,
            rate_limit_mode: RateLimitMode::TrailingWindow,
            endpoints: endpoints.iter().map(|endpoint| (*endpoint).to_string()).collect(),
            permissions: Vec::new(),
            platforms: Vec::new(),
            providers: Vec::new(),
            description: None,
        }
    }

    /// Returns a copy with the rate limit set.
    #[must_use]
    pub fn with_rate_limit(mut self, rate_limit: impl Into<String>) -> Self {
        self.rate_limit = Some(rate_limit.into());
        self
    }

    /// Returns a copy with the rate-limit mode set.
    #[must_use]
    pub const fn with_rate_limit_mode(mut self, mode: RateLimitMode) -> Self {
        self.rate_limit_mode = mode;
        self
    }

    /// Returns a copy with the required role set.
    #[must_use]
    pub fn with_required_role(mut self, role: impl Into<String>) -> Self {
        self.requires_role = Some(role.into());
        self
    }

    /// Parses the configured rate limit.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitParseError`] when the rate limit cannot be parsed.
    pub fn policy(&self) -> Result<RateLimitPolicy, RateLimitParseError> {
        RateLimitPolicy::parse(self.rate_limit.as_deref(), self.rate_limit_mode)
    }

    /// Returns true when any governed prefix is a prefix of `path`.
    #[must_use]
    pub fn governs(&self, path: &str) -> bool {
        self.endpoints.iter().any(|prefix| path.starts_with(prefix.as_str()))
    }

    /// Validates structural constraints for the configuration.
    ///
    /// Rate limits that fail to parse for reasons other than a zero quota
    /// are accepted here and reported as warnings elsewhere.
    ///
    /// # Errors
    ///
    /// Returns [`CapabilityConfigError`] when the configuration is invalid.
    pub fn validate(&self) -> Result<(), CapabilityConfigError> {
        if self.endpoints.len() > MAX_ENDPOINTS_PER_CAPABILITY {
            return Err(CapabilityConfigError::Invalid(format!(
                "too many endpoints (max {MAX_ENDPOINTS_PER_CAPABILITY})"
            )));
        }
        for endpoint in &self.endpoints {
            if endpoint.trim().is_empty() {
                return Err(CapabilityConfigError::Invalid(
                    "endpoint prefixes must be non-empty".to_string(),
                ));
            }
            if endpoint.len() > MAX_ENDPOINT_LENGTH {
                return Err(CapabilityConfigError::Invalid(format!(
                    "endpoint prefix exceeds {MAX_ENDPOINT_LENGTH} bytes"
                )));
            }
        }
        if let Some(role) = &self.requires_role
            && role.trim().is_empty()
        {
            return Err(CapabilityConfigError::Invalid(
                "requires_role must be non-empty when set".to_string(),
            ));
        }
        for labels in [&self.permissions, &self.platforms, &self.providers] {
            if labels.len() > MAX_METADATA_LABELS {
                return Err(CapabilityConfigError::Invalid(format!(
                    "too many metadata labels (max {MAX_METADATA_LABELS})"
                )));
            }
        }
        match self.policy() {
            Err(err @ RateLimitParseError::ZeroQuota {
                ..
            }) => Err(CapabilityConfigError::Invalid(err.to_string())),
            _ => Ok(()),
        }
    }
}

/// Capability configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapabilityConfigError {
    /// Capability name is invalid.
    #[error("invalid capability name: {0}")]
    InvalidName(String),
    /// Capability configuration is invalid.
    #[error("invalid capability config: {0}")]
    Invalid(String),
}

/// Validates a capability name.
///
/// # Errors
///
/// Returns [`CapabilityConfigError::InvalidName`] when the name is empty,
/// too long, or contains characters outside `[A-Za-z0-9_.-]`.
pub fn validate_capability_name(name: &str) -> Result<(), CapabilityConfigError> {
    if name.is_empty() {
        return Err(CapabilityConfigError::InvalidName("name must be non-empty".to_string()));
    }
    if name.len() > MAX_CAPABILITY_NAME_LENGTH {
        return Err(CapabilityConfigError::InvalidName(format!(
            "name exceeds {MAX_CAPABILITY_NAME_LENGTH} bytes"
        )));
    }
    if !name.chars().all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.')) {
        return Err(CapabilityConfigError::InvalidName(format!(
            "{name:?} contains unsupported characters"
        )));
    }
    Ok(())
}

// ============================================================================
// SECTION: Capability
// ============================================================================

/// Named capability entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    /// Unique capability name.
    pub name: CapabilityName,
    /// Capability configuration.
    #[serde(flatten)]
    pub config: CapabilityConfig,
}

impl Capability {
    /// Builds a capability entry.
    #[must_use]
    pub fn new(name: impl Into<CapabilityName>, config: CapabilityConfig) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }

    /// Validates the name and configuration.
    ///
    /// # Errors
    ///
    /// Returns [`CapabilityConfigError`] when either is invalid.
    pub fn validate(&self) -> Result<(), CapabilityConfigError> {
        validate_capability_name(self.name.as_str())?;
        self.config.validate()
    }
}

/// Returns the built-in capability set used when no configuration is
/// available.
#[must_use]
pub fn default_capabilities() -> Vec<Capability> {
    let mut web_scraping = CapabilityConfig::new(true, &["/api/scrape", "/api/browse"])
        .with_rate_limit("100/hour");
    web_scraping.permissions = vec!["read".to_string(), "write".to_string()];

    let mut social_media =
        CapabilityConfig::new(true, &["/api/social/post", "/api/social/schedule"])
            .with_rate_limit("50/hour");
    social_media.platforms = vec!["twitter".to_string(), "linkedin".to_string()];

    let cloud_management = CapabilityConfig::new(false, &["/api/cloud/deploy", "/api/cloud/manage"])
        .with_required_role("admin");

    vec![
        Capability::new("web_scraping", web_scraping),
        Capability::new("social_media", social_media),
        Capability::new("cloud_management", cloud_management),
    ]
}

// ============================================================================
// SECTION: Tests
// ============================================================================

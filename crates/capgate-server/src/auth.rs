// capgate-server/src/auth.rs
// ============================================================================
// Module: Caller Resolution
// Description: Resolve the calling identity from request credentials.
// Purpose: Provide the caller partition key and roles for gate decisions.
// Dependencies: capgate-core, capgate-config, sha2
// ============================================================================

//! ## Overview
//! Caller identity is issued elsewhere; this module only maps a presented
//! bearer token to a [`ResolvedCaller`]. A request without credentials is
//! anonymous and runs ungated on governed paths. Credentials that are
//! present but malformed or unknown are rejected. Tokens are held as
//! SHA-256 fingerprints, never in plaintext.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt::Write as _;

use capgate_config::ServerAuthConfig;
use capgate_core::CallerId;
use sha2::Digest;
use sha2::Sha256;
use thiserror::Error;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Maximum accepted `Authorization` header size.
const MAX_AUTH_HEADER_BYTES: usize = 8 * 1024;

// ============================================================================
// SECTION: Types
// ============================================================================

/// Identity resolved for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCaller {
    /// Caller identifier used as the usage partition key.
    pub caller_id: CallerId,
    /// Roles held by the caller.
    pub roles: BTreeSet<String>,
}

impl ResolvedCaller {
    /// Creates a caller with the given roles.
    #[must_use]
    pub fn new(caller_id: impl Into<CallerId>, roles: &[&str]) -> Self {
        Self {
            caller_id: caller_id.into(),
            roles: roles.iter().map(|role| (*role).to_string()).collect(),
        }
    }

    /// Returns true when the caller holds `role`.
    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }
}

/// Caller resolution errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// Credentials were presented but could not be accepted.
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),
}

// ============================================================================
// SECTION: Resolver
// ============================================================================

/// Resolves callers from the raw `Authorization` header.
pub trait CallerResolver: Send + Sync {
    /// Returns `Ok(None)` for anonymous requests.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError`] when credentials are present but invalid.
    fn resolve(&self, auth_header: Option<&str>) -> Result<Option<ResolvedCaller>, AuthError>;
}

/// Resolver backed by a static bearer token map.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenResolver {
    /// Callers keyed by token fingerprint.
    callers: BTreeMap<String, ResolvedCaller>,
}

impl StaticTokenResolver {
    /// Builds a resolver from server auth configuration.
    #[must_use]
    pub fn from_config(config: &ServerAuthConfig) -> Self {
        let callers = config
            .tokens
            .iter()
            .map(|entry| {
                let caller = ResolvedCaller {
                    caller_id: CallerId::new(entry.caller_id.clone()),
                    roles: entry.roles.iter().cloned().collect(),
                };
                (token_fingerprint(&entry.token), caller)
            })
            .collect();
        Self {
            callers,
        }
    }

    /// Returns the number of configured tokens.
    #[must_use]
    pub fn len(&self) -> usize {
        self.callers.len()
    }

    /// Returns true when no tokens are configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.callers.is_empty()
    }
}

impl CallerResolver for StaticTokenResolver {
    fn resolve(&self, auth_header: Option<&str>) -> Result<Option<ResolvedCaller>, AuthError> {
        let Some(header) = auth_header else {
            return Ok(None);
        };
        let token = parse_bearer_token(header)?;
        self.callers
            .get(&token_fingerprint(&token))
            .cloned()
            .map(Some)
            .ok_or_else(|| AuthError::Unauthenticated("unknown bearer token".to_string()))
    }
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Extracts the bearer token from an `Authorization` header value.
fn parse_bearer_token(header: &str) -> Result<String, AuthError> {
    if header.len() > MAX_AUTH_HEADER_BYTES {
        return Err(AuthError::Unauthenticated("authorization header too large".to_string()));
    }
    let mut parts = header.trim().splitn(2, ' ');
    let scheme = parts.next().unwrap_or_default();
    let token = parts.next().unwrap_or_default().trim();
    if !scheme.eq_ignore_ascii_case("bearer") || token.is_empty() {
        return Err(AuthError::Unauthenticated("invalid authorization header".to_string()));
    }
    Ok(token.to_string())
}

/// Returns the lowercase hex SHA-256 fingerprint of `token`.
fn token_fingerprint(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest.iter() {
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}

// ============================================================================
// SECTION: Tests
// ============================================================================

// capgate-config/src/config.rs
// ============================================================================
// Module: capgate Configuration
// Description: Configuration loading and validation for the capability gate.
// Purpose: Provide strict, fail-closed config parsing with limits.
// Dependencies: capgate-core, capgate-store-sqlite, serde, toml
// ============================================================================

//! ## Overview
//! This module loads `capgate.toml` and validates it. The path is resolved
//! from an explicit argument, then the `CAPGATE_CONFIG` environment
//! variable, then `./capgate.toml`. Validation is fail-closed for
//! structural errors (empty endpoint prefixes, zero quotas, duplicate
//! capability names, missing store paths). Rate limits the gate would
//! evaluate as unlimited are reported by [`CapgateConfig::warnings`].

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeSet;
use std::env;
use std::fmt;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::path::PathBuf;

use capgate_core::Capability;
use capgate_core::CapabilityName;
use capgate_core::RateLimitParseError;
use capgate_core::default_capabilities;
use capgate_store_sqlite::SqliteStoreConfig;
use capgate_store_sqlite::SqliteStoreMode;
use capgate_store_sqlite::SqliteSyncMode;
use serde::Deserialize;
use thiserror::Error;

// ============================================================================
// SECTION: Limits
// ============================================================================

/// Default config file name.
const DEFAULT_CONFIG_NAME: &str = "capgate.toml";
/// Environment variable used to override the config path.
pub const CONFIG_ENV_VAR: &str = "CAPGATE_CONFIG";
/// Maximum configuration file size in bytes.
const MAX_CONFIG_FILE_SIZE: usize = 1024 * 1024;
/// Maximum length of a single path component.
const MAX_PATH_COMPONENT_LENGTH: usize = 255;
/// Maximum total path length.
const MAX_TOTAL_PATH_LENGTH: usize = 4096;
/// Maximum number of configured bearer tokens.
const MAX_AUTH_TOKENS: usize = 64;
/// Maximum length of a bearer token.
const MAX_AUTH_TOKEN_LENGTH: usize = 256;
/// Maximum number of roles bound to one token.
const MAX_TOKEN_ROLES: usize = 32;
/// Maximum length of a caller identifier or role label.
const MAX_LABEL_LENGTH: usize = 128;
/// Maximum number of configured capabilities.
const MAX_CAPABILITIES: usize = 256;
/// Default bind address.
const DEFAULT_BIND: &str = "127.0.0.1:8080";
/// Default maximum request body size.
const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;
/// Default role required for admin endpoints.
const DEFAULT_ADMIN_ROLE: &str = "admin";
/// Default `SQLite` busy timeout.
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

// ============================================================================
// SECTION: Configuration Types
// ============================================================================

/// Capability gate configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CapgateConfig {
    /// HTTP server configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Durable capability store configuration.
    #[serde(default)]
    pub capability_store: CapabilityStoreConfig,
    /// Usage ledger configuration.
    #[serde(default)]
    pub usage_ledger: UsageLedgerConfig,
    /// Request gate behaviour.
    #[serde(default)]
    pub gate: GateConfig,
    /// Audit logging configuration.
    #[serde(default)]
    pub audit: AuditConfig,
    /// Seed capabilities used when the store has none. Replaces the
    /// built-in defaults when non-empty.
    #[serde(default)]
    pub capabilities: Vec<Capability>,
}

impl CapgateConfig {
    /// Loads configuration from disk using the default resolution rules.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when loading or validation fails.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let resolved = resolve_path(path)?;
        validate_path(&resolved)?;
        let bytes = fs::read(&resolved).map_err(|err| ConfigError::Io(err.to_string()))?;
        if bytes.len() > MAX_CONFIG_FILE_SIZE {
            return Err(ConfigError::Invalid("config file exceeds size limit".to_string()));
        }
        let content = std::str::from_utf8(&bytes)
            .map_err(|_| ConfigError::Invalid("config file must be utf-8".to_string()))?;
        Self::parse(content)
    }

    /// Parses and validates configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when parsing or validation fails.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(content).map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration for internal consistency.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when configuration is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate()?;
        self.capability_store.validate()?;
        self.usage_ledger.validate()?;
        self.audit.validate()?;
        if self.capabilities.len() > MAX_CAPABILITIES {
            return Err(ConfigError::Invalid(format!(
                "too many capabilities (max {MAX_CAPABILITIES})"
            )));
        }
        let mut seen = BTreeSet::new();
        for capability in &self.capabilities {
            capability.validate().map_err(|err| {
                ConfigError::Invalid(format!("capabilities.{}: {err}", capability.name))
            })?;
            if !seen.insert(capability.name.clone()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate capability name: {}",
                    capability.name
                )));
            }
        }
        Ok(())
    }

    /// Returns warnings for configuration that is accepted but likely
    /// unintended.
    #[must_use]
    pub fn warnings(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        for capability in &self.fallback_capabilities() {
            if let Err(err) = capability.config.policy()
                && !matches!(err, RateLimitParseError::ZeroQuota { .. })
            {
                warnings.push(ConfigWarning {
                    capability: Some(capability.name.clone()),
                    code: err.code(),
                    message: format!("{err}; requests will not be rate limited"),
                });
            }
            if !self.gate.enforce_roles && capability.config.requires_role.is_some() {
                warnings.push(ConfigWarning {
                    capability: Some(capability.name.clone()),
                    code: "role_not_enforced",
                    message: "requires_role is set but gate.enforce_roles is false".to_string(),
                });
            }
        }
        if self.server.auth.tokens.is_empty() {
            warnings.push(ConfigWarning {
                capability: None,
                code: "no_callers_configured",
                message: "no auth tokens configured; all governed requests run ungated"
                    .to_string(),
            });
        }
        warnings
    }

    /// Returns the capability set used when the store has none.
    #[must_use]
    pub fn fallback_capabilities(&self) -> Vec<Capability> {
        if self.capabilities.is_empty() {
            default_capabilities()
        } else {
            self.capabilities.clone()
        }
    }
}

/// Startup warning for accepted but suspicious configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWarning {
    /// Capability the warning concerns, when any.
    pub capability: Option<CapabilityName>,
    /// Stable warning code.
    pub code: &'static str,
    /// Human-readable message.
    pub message: String,
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.capability {
            Some(name) => write!(f, "[{}] {name}: {}", self.code, self.message),
            None => write!(f, "[{}] {}", self.code, self.message),
        }
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address.
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Maximum request body size in bytes.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Role required for admin endpoints.
    #[serde(default = "default_admin_role")]
    pub admin_role: String,
    /// Caller resolution configuration.
    #[serde(default)]
    pub auth: ServerAuthConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            max_body_bytes: default_max_body_bytes(),
            admin_role: default_admin_role(),
            auth: ServerAuthConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Returns the parsed bind address.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when the address does not parse.
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.bind
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("invalid server.bind: {}", self.bind)))
    }

    /// Validates server configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        self.bind_addr()?;
        if self.max_body_bytes == 0 {
            return Err(ConfigError::Invalid(
                "max_body_bytes must be greater than zero".to_string(),
            ));
        }
        validate_label("server.admin_role", &self.admin_role)?;
        self.auth.validate()
    }
}

/// Static bearer-token caller resolution.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerAuthConfig {
    /// Accepted bearer tokens and the callers they resolve to.
    #[serde(default)]
    pub tokens: Vec<TokenConfig>,
}

impl ServerAuthConfig {
    /// Validates auth configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.tokens.len() > MAX_AUTH_TOKENS {
            return Err(ConfigError::Invalid("too many auth tokens".to_string()));
        }
        let mut seen = BTreeSet::new();
        for entry in &self.tokens {
            entry.validate()?;
            if !seen.insert(entry.token.as_str()) {
                return Err(ConfigError::Invalid("duplicate auth token".to_string()));
            }
        }
        Ok(())
    }
}

/// One bearer token binding.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    /// Bearer token value.
    pub token: String,
    /// Caller identifier the token resolves to.
    pub caller_id: String,
    /// Roles held by the caller.
    #[serde(default)]
    pub roles: Vec<String>,
}

impl TokenConfig {
    /// Validates a token binding.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.token.trim().is_empty() {
            return Err(ConfigError::Invalid("auth token must be non-empty".to_string()));
        }
        if self.token.len() > MAX_AUTH_TOKEN_LENGTH {
            return Err(ConfigError::Invalid("auth token too long".to_string()));
        }
        if self.token.chars().any(char::is_whitespace) {
            return Err(ConfigError::Invalid("auth token must not contain whitespace".to_string()));
        }
        validate_label("auth caller_id", &self.caller_id)?;
        if self.roles.len() > MAX_TOKEN_ROLES {
            return Err(ConfigError::Invalid("too many roles for auth token".to_string()));
        }
        for role in &self.roles {
            validate_label("auth role", role)?;
        }
        Ok(())
    }
}

/// Capability store backend type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityStoreType {
    /// In-memory store (lost on restart).
    #[default]
    Memory,
    /// `SQLite`-backed durable store.
    Sqlite,
    /// JSON snapshot file.
    File,
}

/// Capability store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CapabilityStoreConfig {
    /// Store backend type.
    #[serde(rename = "type", default)]
    pub store_type: CapabilityStoreType,
    /// Database or snapshot path for durable backends.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Busy timeout in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// `SQLite` journal mode.
    #[serde(default)]
    pub journal_mode: SqliteStoreMode,
    /// `SQLite` synchronous mode.
    #[serde(default)]
    pub sync_mode: SqliteSyncMode,
}

impl Default for CapabilityStoreConfig {
    fn default() -> Self {
        Self {
            store_type: CapabilityStoreType::default(),
            path: None,
            busy_timeout_ms: default_busy_timeout_ms(),
            journal_mode: SqliteStoreMode::default(),
            sync_mode: SqliteSyncMode::default(),
        }
    }
}

impl CapabilityStoreConfig {
    /// Returns the `SQLite` configuration when the sqlite backend is used.
    #[must_use]
    pub fn sqlite_config(&self) -> Option<SqliteStoreConfig> {
        match (self.store_type, &self.path) {
            (CapabilityStoreType::Sqlite, Some(path)) => Some(SqliteStoreConfig {
                path: path.clone(),
                busy_timeout_ms: self.busy_timeout_ms,
                journal_mode: self.journal_mode,
                sync_mode: self.sync_mode,
            }),
            _ => None,
        }
    }

    /// Validates capability store configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        match self.store_type {
            CapabilityStoreType::Memory => {
                if self.path.is_some() {
                    return Err(ConfigError::Invalid(
                        "memory capability_store must not set path".to_string(),
                    ));
                }
                Ok(())
            }
            CapabilityStoreType::Sqlite | CapabilityStoreType::File => {
                let path = self.path.as_ref().ok_or_else(|| {
                    ConfigError::Invalid("durable capability_store requires path".to_string())
                })?;
                validate_store_path("capability_store.path", path)
            }
        }
    }
}

/// Usage ledger backend type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UsageLedgerType {
    /// In-memory ledger (lost on restart).
    #[default]
    Memory,
    /// `SQLite`-backed durable ledger.
    Sqlite,
}

/// Usage ledger configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct UsageLedgerConfig {
    /// Ledger backend type.
    #[serde(rename = "type", default)]
    pub ledger_type: UsageLedgerType,
    /// `SQLite` database path when using the sqlite backend.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Busy timeout in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// `SQLite` journal mode.
    #[serde(default)]
    pub journal_mode: SqliteStoreMode,
    /// `SQLite` synchronous mode.
    #[serde(default)]
    pub sync_mode: SqliteSyncMode,
}

impl Default for UsageLedgerConfig {
    fn default() -> Self {
        Self {
            ledger_type: UsageLedgerType::default(),
            path: None,
            busy_timeout_ms: default_busy_timeout_ms(),
            journal_mode: SqliteStoreMode::default(),
            sync_mode: SqliteSyncMode::default(),
        }
    }
}

impl UsageLedgerConfig {
    /// Returns the `SQLite` configuration when the sqlite backend is used.
    #[must_use]
    pub fn sqlite_config(&self) -> Option<SqliteStoreConfig> {
        match (self.ledger_type, &self.path) {
            (UsageLedgerType::Sqlite, Some(path)) => Some(SqliteStoreConfig {
                path: path.clone(),
                busy_timeout_ms: self.busy_timeout_ms,
                journal_mode: self.journal_mode,
                sync_mode: self.sync_mode,
            }),
            _ => None,
        }
    }

    /// Validates usage ledger configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        match self.ledger_type {
            UsageLedgerType::Memory => {
                if self.path.is_some() {
                    return Err(ConfigError::Invalid(
                        "memory usage_ledger must not set path".to_string(),
                    ));
                }
                Ok(())
            }
            UsageLedgerType::Sqlite => {
                let path = self.path.as_ref().ok_or_else(|| {
                    ConfigError::Invalid("sqlite usage_ledger requires path".to_string())
                })?;
                validate_store_path("usage_ledger.path", path)
            }
        }
    }
}

/// Request gate configuration.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct GateConfig {
    /// Deny gated requests whose caller lacks the capability's
    /// `requires_role`.
    #[serde(default)]
    pub enforce_roles: bool,
}

/// Audit logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AuditConfig {
    /// Enable structured audit logging.
    #[serde(default = "default_audit_enabled")]
    pub enabled: bool,
    /// Optional audit log path (JSON lines); stderr when absent.
    #[serde(default)]
    pub path: Option<String>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: default_audit_enabled(),
            path: None,
        }
    }
}

impl AuditConfig {
    /// Validates audit configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(path) = &self.path {
            validate_path_string("audit.path", path)?;
        }
        Ok(())
    }
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Configuration loading or validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O failure while reading configuration.
    #[error("config io error: {0}")]
    Io(String),
    /// TOML parsing error.
    #[error("config parse error: {0}")]
    Parse(String),
    /// Invalid configuration data.
    #[error("invalid config: {0}")]
    Invalid(String),
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Resolves the config path from CLI or environment defaults.
fn resolve_path(path: Option<&Path>) -> Result<PathBuf, ConfigError> {
    if let Some(path) = path {
        return Ok(path.to_path_buf());
    }
    if let Ok(env_path) = env::var(CONFIG_ENV_VAR) {
        if env_path.len() > MAX_TOTAL_PATH_LENGTH {
            return Err(ConfigError::Invalid("config path exceeds max length".to_string()));
        }
        return Ok(PathBuf::from(env_path));
    }
    Ok(PathBuf::from(DEFAULT_CONFIG_NAME))
}

/// Validates the resolved path against security limits.
fn validate_path(path: &Path) -> Result<(), ConfigError> {
    let text = path.to_string_lossy();
    if text.len() > MAX_TOTAL_PATH_LENGTH {
        return Err(ConfigError::Invalid("config path exceeds max length".to_string()));
    }
    for component in path.components() {
        let value = component.as_os_str().to_string_lossy();
        if value.len() > MAX_PATH_COMPONENT_LENGTH {
            return Err(ConfigError::Invalid("config path component too long".to_string()));
        }
    }
    Ok(())
}

/// Validates a path string against length constraints.
fn validate_path_string(field: &str, value: &str) -> Result<(), ConfigError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ConfigError::Invalid(format!("{field} must be non-empty")));
    }
    validate_store_path(field, Path::new(trimmed))
}

/// Validates store paths for safety limits.
fn validate_store_path(field: &str, path: &Path) -> Result<(), ConfigError> {
    let text = path.to_string_lossy();
    if text.trim().is_empty() {
        return Err(ConfigError::Invalid(format!("{field} must be non-empty")));
    }
    if text.len() > MAX_TOTAL_PATH_LENGTH {
        return Err(ConfigError::Invalid(format!("{field} exceeds max length")));
    }
    for component in path.components() {
        let value = component.as_os_str().to_string_lossy();
        if value.len() > MAX_PATH_COMPONENT_LENGTH {
            return Err(ConfigError::Invalid(format!("{field} path component too long")));
        }
    }
    Ok(())
}

/// Validates an identifier-like label.
fn validate_label(field: &str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::Invalid(format!("{field} must be non-empty")));
    }
    if value.len() > MAX_LABEL_LENGTH {
        return Err(ConfigError::Invalid(format!("{field} exceeds {MAX_LABEL_LENGTH} bytes")));
    }
    Ok(())
}

/// Returns the default bind address.
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}

/// Returns the default maximum request body size.
const fn default_max_body_bytes() -> usize {
    DEFAULT_MAX_BODY_BYTES
}

/// Returns the default admin role.
fn default_admin_role() -> String {
    DEFAULT_ADMIN_ROLE.to_string()
}

/// Returns the default busy timeout for `SQLite` connections.
const fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}

/// Returns the default audit enablement.
const fn default_audit_enabled() -> bool {
    true
}

// ============================================================================
// SECTION: Tests
// ============================================================================

// capgate-server/src/server.rs
// ============================================================================
// Module: Gate Server
// Description: Assemble the gate, admin API, and downstream routes.
// Purpose: Build backends from configuration and serve HTTP.
// Dependencies: axum, tokio, capgate-core, capgate-config, capgate-store-sqlite
// ============================================================================

//! ## Overview
//! [`GateServer`] builds the capability store, usage ledger, audit sink, and
//! caller resolver from [`CapgateConfig`], loads the registry, and produces
//! an axum [`Router`] in which every route, including the fallback, passes
//! through the gate middleware. Downstream business routes are supplied by
//! the embedding application.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use capgate_config::AuditConfig;
use capgate_config::CapabilityStoreType;
use capgate_config::CapgateConfig;
use capgate_config::UsageLedgerType;
use capgate_core::AuditSink;
use capgate_core::CapabilityRegistry;
use capgate_core::Clock;
use capgate_core::FileAuditSink;
use capgate_core::InMemoryCapabilityStore;
use capgate_core::InMemoryUsageLedger;
use capgate_core::NoopAuditSink;
use capgate_core::SharedCapabilityStore;
use capgate_core::SharedUsageLedger;
use capgate_core::StderrAuditSink;
use capgate_core::SystemClock;
use capgate_store_sqlite::SqliteCapabilityStore;
use capgate_store_sqlite::SqliteUsageLedger;
use serde_json::json;
use tokio::net::TcpListener;

use crate::admin;
use crate::auth::CallerResolver;
use crate::auth::StaticTokenResolver;
use crate::gate::RequestGate;
use crate::middleware::capability_gate;
use crate::snapshot_store::JsonFileCapabilityStore;
use crate::telemetry::GateMetrics;
use crate::telemetry::NoopMetrics;

// ============================================================================
// SECTION: State
// ============================================================================

/// Shared state for the gate middleware and admin handlers.
pub struct AppState {
    /// Request gate.
    pub gate: RequestGate,
    /// Capability registry (shared with the gate).
    pub registry: Arc<CapabilityRegistry>,
    /// Usage ledger (shared with the gate).
    pub ledger: SharedUsageLedger,
    /// Caller resolver.
    pub resolver: Arc<dyn CallerResolver>,
    /// Audit sink.
    pub audit: Arc<dyn AuditSink>,
    /// Time source.
    pub clock: Arc<dyn Clock>,
    /// Role required for admin endpoints.
    pub admin_role: String,
}

/// Backends used to assemble a server.
pub struct GateComponents {
    /// Durable capability store.
    pub store: SharedCapabilityStore,
    /// Usage ledger.
    pub ledger: SharedUsageLedger,
    /// Caller resolver.
    pub resolver: Arc<dyn CallerResolver>,
    /// Audit sink.
    pub audit: Arc<dyn AuditSink>,
    /// Time source.
    pub clock: Arc<dyn Clock>,
    /// Decision metrics.
    pub metrics: Arc<dyn GateMetrics>,
}

impl GateComponents {
    /// Builds backends from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError`] when a backend cannot be opened.
    pub fn from_config(config: &CapgateConfig) -> Result<Self, ServerError> {
        Ok(Self {
            store: build_capability_store(config)?,
            ledger: build_usage_ledger(config)?,
            resolver: Arc::new(StaticTokenResolver::from_config(&config.server.auth)),
            audit: build_audit_sink(&config.audit)?,
            clock: Arc::new(SystemClock),
            metrics: Arc::new(NoopMetrics),
        })
    }
}

// ============================================================================
// SECTION: Server
// ============================================================================

/// Capability gate HTTP server.
pub struct GateServer {
    /// Validated configuration.
    config: CapgateConfig,
    /// Shared handler state.
    state: Arc<AppState>,
}

impl GateServer {
    /// Builds a server from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError`] when configuration is invalid or a backend
    /// cannot be opened.
    pub fn from_config(config: CapgateConfig) -> Result<Self, ServerError> {
        config.validate().map_err(|err| ServerError::Config(err.to_string()))?;
        let components = GateComponents::from_config(&config)?;
        Ok(Self::with_components(config, components))
    }

    /// Builds a server from configuration and explicit backends.
    #[must_use]
    pub fn with_components(config: CapgateConfig, components: GateComponents) -> Self {
        let registry = Arc::new(CapabilityRegistry::load(
            components.store,
            config.fallback_capabilities(),
            Arc::clone(&components.audit),
        ));
        let gate = RequestGate::new(
            Arc::clone(&registry),
            components.ledger.clone(),
            Arc::clone(&components.audit),
            Arc::clone(&components.clock),
            components.metrics,
        )
        .with_role_enforcement(config.gate.enforce_roles);
        let state = Arc::new(AppState {
            gate,
            registry,
            ledger: components.ledger,
            resolver: components.resolver,
            audit: components.audit,
            clock: components.clock,
            admin_role: config.server.admin_role.clone(),
        });
        Self {
            config,
            state,
        }
    }

    /// Returns the shared handler state.
    #[must_use]
    pub fn state(&self) -> Arc<AppState> {
        Arc::clone(&self.state)
    }

    /// Builds the gated router around `downstream`.
    #[must_use]
    pub fn router(&self, downstream: Router) -> Router {
        Router::new()
            .route("/healthz", get(health))
            .merge(admin::routes())
            .with_state(Arc::clone(&self.state))
            .merge(downstream)
            .fallback(not_found)
            .layer(axum::middleware::from_fn_with_state(Arc::clone(&self.state), capability_gate))
            .layer(DefaultBodyLimit::max(self.config.server.max_body_bytes))
    }

    /// Binds the configured address and serves `downstream` behind the gate.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError`] when binding or serving fails.
    pub async fn serve(self, downstream: Router) -> Result<(), ServerError> {
        let addr: SocketAddr =
            self.config.server.bind_addr().map_err(|err| ServerError::Config(err.to_string()))?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|err| ServerError::Transport(format!("http bind failed: {err}")))?;
        self.serve_listener(listener, downstream).await
    }

    /// Serves on an already bound listener.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError`] when serving fails.
    pub async fn serve_listener(
        self,
        listener: TcpListener,
        downstream: Router,
    ) -> Result<(), ServerError> {
        let app = self.router(downstream);
        axum::serve(listener, app)
            .await
            .map_err(|err| ServerError::Transport(format!("http server failed: {err}")))
    }
}

// ============================================================================
// SECTION: Handlers
// ============================================================================

/// Liveness probe.
async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

/// JSON 404 for unmatched routes.
async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, Json(json!({"detail": "Not Found"})))
}

// ============================================================================
// SECTION: Backends
// ============================================================================

/// Builds the capability store from configuration.
fn build_capability_store(config: &CapgateConfig) -> Result<SharedCapabilityStore, ServerError> {
    let store_config = &config.capability_store;
    let store = match store_config.store_type {
        CapabilityStoreType::Memory => {
            SharedCapabilityStore::from_store(InMemoryCapabilityStore::new())
        }
        CapabilityStoreType::Sqlite => {
            let sqlite_config = store_config.sqlite_config().ok_or_else(|| {
                ServerError::Config("sqlite capability_store requires path".to_string())
            })?;
            let store = SqliteCapabilityStore::new(&sqlite_config)
                .map_err(|err| ServerError::Init(err.to_string()))?;
            SharedCapabilityStore::from_store(store)
        }
        CapabilityStoreType::File => {
            let path = store_config.path.clone().ok_or_else(|| {
                ServerError::Config("file capability_store requires path".to_string())
            })?;
            SharedCapabilityStore::from_store(JsonFileCapabilityStore::new(path))
        }
    };
    Ok(store)
}

/// Builds the usage ledger from configuration.
fn build_usage_ledger(config: &CapgateConfig) -> Result<SharedUsageLedger, ServerError> {
    let ledger = match config.usage_ledger.ledger_type {
        UsageLedgerType::Memory => SharedUsageLedger::from_ledger(InMemoryUsageLedger::new()),
        UsageLedgerType::Sqlite => {
            let sqlite_config = config.usage_ledger.sqlite_config().ok_or_else(|| {
                ServerError::Config("sqlite usage_ledger requires path".to_string())
            })?;
            let ledger = SqliteUsageLedger::new(&sqlite_config)
                .map_err(|err| ServerError::Init(err.to_string()))?;
            SharedUsageLedger::from_ledger(ledger)
        }
    };
    Ok(ledger)
}

/// Builds the audit sink from configuration.
fn build_audit_sink(config: &AuditConfig) -> Result<Arc<dyn AuditSink>, ServerError> {
    if !config.enabled {
        return Ok(Arc::new(NoopAuditSink));
    }
    match &config.path {
        Some(path) => {
            let sink = FileAuditSink::new(Path::new(path))
                .map_err(|err| ServerError::Init(format!("audit log open failed: {err}")))?;
            Ok(Arc::new(sink))
        }
        None => Ok(Arc::new(StderrAuditSink)),
    }
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Gate server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),
    /// Initialization errors.
    #[error("init error: {0}")]
    Init(String),
    /// Transport errors.
    #[error("transport error: {0}")]
    Transport(String),
}

// capgate-server/tests/common/mod.rs
// ============================================================================
// Module: Common HTTP Test Fixtures
// Description: Ephemeral gate servers with inspectable backends.
// Purpose: Drive the gate end to end over real HTTP.
// Dependencies: capgate-server, capgate-core, axum, reqwest, tokio
// ============================================================================

//! ## Overview
//! Spawns a [`GateServer`] on an ephemeral loopback port with an in-memory
//! ledger, a capturing audit sink, and a manual clock, plus a small
//! downstream router standing in for business endpoints.

#![allow(dead_code, reason = "Shared test helpers may be unused in some cases.")]

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use axum::Router;
use axum::http::StatusCode;
use axum::routing::get;
use axum::routing::post;
use capgate_config::CapgateConfig;
use capgate_core::AuditEvent;
use capgate_core::AuditEventKind;
use capgate_core::AuditSink;
use capgate_core::CallerId;
use capgate_core::Capability;
use capgate_core::CapabilityStore;
use capgate_core::InMemoryCapabilityStore;
use capgate_core::InMemoryUsageLedger;
use capgate_core::ManualClock;
use capgate_core::SharedCapabilityStore;
use capgate_core::SharedUsageLedger;
use capgate_core::StoreError;
use capgate_core::Timestamp;
use capgate_core::UsageEvent;
use capgate_core::UsageLedger;
use capgate_server::GateComponents;
use capgate_server::GateServer;
use capgate_server::InMemoryGateMetrics;
use capgate_server::StaticTokenResolver;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Token for a regular caller.
pub const ALICE: &str = "tok-alice";
/// Token for a second regular caller.
pub const BOB: &str = "tok-bob";
/// Token for an admin caller.
pub const ADMIN: &str = "tok-admin";

/// Auth section shared by all test configs.
const AUTH_TOML: &str = r#"
[[server.auth.tokens]]
token = "tok-alice"
caller_id = "alice"

[[server.auth.tokens]]
token = "tok-bob"
caller_id = "bob"

[[server.auth.tokens]]
token = "tok-admin"
caller_id = "root"
roles = ["admin"]
"#;

// ============================================================================
// SECTION: Audit
// ============================================================================

/// Audit sink that keeps every event in memory.
#[derive(Default)]
pub struct CapturingAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl CapturingAuditSink {
    pub fn count(&self, kind: AuditEventKind) -> usize {
        self.events.lock().unwrap().iter().filter(|event| event.event == kind).count()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl AuditSink for CapturingAuditSink {
    fn record(&self, event: &AuditEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

// ============================================================================
// SECTION: Stores
// ============================================================================

/// Capability store whose writes can be forced to fail.
#[derive(Clone, Default)]
pub struct ToggleFailStore {
    pub inner: InMemoryCapabilityStore,
    fail_writes: Arc<AtomicBool>,
}

impl ToggleFailStore {
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

impl CapabilityStore for ToggleFailStore {
    fn load_all(&self) -> Result<Vec<Capability>, StoreError> {
        self.inner.load_all()
    }

    fn upsert(&self, capability: &Capability, actor: &CallerId) -> Result<(), StoreError> {
        self.upsert_all(std::slice::from_ref(capability), actor)
    }

    fn upsert_all(&self, capabilities: &[Capability], actor: &CallerId) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Io("disk full".to_string()));
        }
        self.inner.upsert_all(capabilities, actor)
    }
}

// ============================================================================
// SECTION: Server
// ============================================================================

/// Running gate server and its inspectable backends.
pub struct TestServer {
    pub base_url: String,
    pub client: reqwest::Client,
    pub ledger: Arc<InMemoryUsageLedger>,
    pub audit: Arc<CapturingAuditSink>,
    pub clock: Arc<ManualClock>,
    pub metrics: Arc<InMemoryGateMetrics>,
    task: JoinHandle<()>,
}

impl TestServer {
    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    pub async fn get(&self, path: &str, token: Option<&str>) -> reqwest::Response {
        let mut request = self.client.get(self.url(path));
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        request.send().await.unwrap()
    }

    pub async fn post(&self, path: &str, token: Option<&str>) -> reqwest::Response {
        let mut request = self.client.post(self.url(path));
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        request.send().await.unwrap()
    }

    pub fn recorded(&self) -> Vec<UsageEvent> {
        self.ledger.events().unwrap()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Parses a config from the shared auth section plus `extra`.
pub fn config_with(extra: &str) -> CapgateConfig {
    CapgateConfig::parse(&format!("{AUTH_TOML}\n{extra}")).unwrap()
}

/// Downstream routes standing in for business endpoints.
pub fn downstream() -> Router {
    Router::new()
        .route("/api/scrape/page", get(|| async { "scraped" }))
        .route("/api/scrape/fail", get(|| async { (StatusCode::BAD_GATEWAY, "upstream down") }))
        .route("/api/social/post", post(|| async { StatusCode::CREATED }))
        .route("/api/cloud/deploy", post(|| async { "deployed" }))
        .route("/api/users", get(|| async { "users" }))
}

/// Spawns a server backed by an empty in-memory capability store.
pub async fn spawn_server(config: CapgateConfig) -> TestServer {
    spawn_with_store(config, SharedCapabilityStore::from_store(InMemoryCapabilityStore::new()))
        .await
}

/// Spawns a server backed by `store`.
pub async fn spawn_with_store(config: CapgateConfig, store: SharedCapabilityStore) -> TestServer {
    let ledger = Arc::new(InMemoryUsageLedger::new());
    let shared_ledger: Arc<dyn UsageLedger> = ledger.clone();
    let audit = Arc::new(CapturingAuditSink::default());
    let clock = Arc::new(ManualClock::new(Timestamp::from_unix_millis(1_700_000_000_000)));
    let metrics = Arc::new(InMemoryGateMetrics::new());
    let components = GateComponents {
        store,
        ledger: SharedUsageLedger::new(shared_ledger),
        resolver: Arc::new(StaticTokenResolver::from_config(&config.server.auth)),
        audit: audit.clone(),
        clock: clock.clone(),
        metrics: metrics.clone(),
    };
    let server = GateServer::with_components(config, components);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task = tokio::spawn(async move {
        let _ = server.serve_listener(listener, downstream()).await;
    });
    TestServer {
        base_url: format!("http://{addr}"),
        client: reqwest::Client::new(),
        ledger,
        audit,
        clock,
        metrics,
        task,
    }
}

// capgate-core/tests/registry.rs
// ============================================================================
// Module: Capability Registry Tests
// Description: Load fallback, write-through updates, and path resolution.
// Purpose: Validate registry invariants against real and failing stores.
// Dependencies: capgate-core
// ============================================================================

//! Capability registry tests.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    reason = "Test-only assertions use unwrap for clarity."
)]

mod common;

use std::sync::Arc;
use std::thread;

use capgate_core::AuditEventKind;
use capgate_core::CallerId;
use capgate_core::Capability;
use capgate_core::CapabilityConfig;
use capgate_core::CapabilityName;
use capgate_core::CapabilityRegistry;
use capgate_core::CapabilityStore;
use capgate_core::InMemoryCapabilityStore;
use capgate_core::RegistryError;
use capgate_core::RegistrySource;
use capgate_core::SharedCapabilityStore;
use capgate_core::default_capabilities;

use crate::common::CapturingAuditSink;
use crate::common::FlakyCapabilityStore;

fn admin() -> CallerId {
    CallerId::new("admin-1")
}

#[test]
fn unreadable_store_falls_back_to_defaults() {
    let store = FlakyCapabilityStore::default();
    store.fail_reads(true);
    let audit = CapturingAuditSink::shared();
    let registry = CapabilityRegistry::load(
        SharedCapabilityStore::from_store(store),
        default_capabilities(),
        audit.clone(),
    );

    let snapshot = registry.snapshot();
    assert_eq!(snapshot.source(), RegistrySource::Fallback);
    assert_eq!(snapshot.len(), 3);
    assert!(registry.is_enabled("web_scraping"));
    assert!(!registry.is_enabled("cloud_management"));
    assert_eq!(audit.count(AuditEventKind::CapabilityRegistryFallback), 1);
}

#[test]
fn empty_store_falls_back_without_persisting() {
    let store = InMemoryCapabilityStore::new();
    let registry = CapabilityRegistry::load(
        SharedCapabilityStore::from_store(store.clone()),
        default_capabilities(),
        CapturingAuditSink::shared(),
    );
    assert_eq!(registry.snapshot().source(), RegistrySource::Fallback);
    assert!(store.load_all().unwrap().is_empty());
}

#[test]
fn persisted_entries_win_over_fallback() {
    let store = InMemoryCapabilityStore::with_capabilities(vec![Capability::new(
        "reports",
        CapabilityConfig::new(true, &["/api/reports"]),
    )]);
    let registry = CapabilityRegistry::load(
        SharedCapabilityStore::from_store(store),
        default_capabilities(),
        CapturingAuditSink::shared(),
    );
    let snapshot = registry.snapshot();
    assert_eq!(snapshot.source(), RegistrySource::Persisted);
    assert_eq!(snapshot.len(), 1);
    assert!(!registry.is_enabled("web_scraping"));
}

#[test]
fn duplicate_persisted_names_fall_back() {
    let entry = Capability::new("dup", CapabilityConfig::new(true, &["/a"]));
    let store = InMemoryCapabilityStore::with_capabilities(vec![entry.clone(), entry]);
    let audit = CapturingAuditSink::shared();
    let registry = CapabilityRegistry::load(
        SharedCapabilityStore::from_store(store),
        default_capabilities(),
        audit.clone(),
    );
    assert_eq!(registry.snapshot().source(), RegistrySource::Fallback);
    let fallback = audit
        .events()
        .into_iter()
        .find(|event| event.event == AuditEventKind::CapabilityRegistryFallback)
        .unwrap();
    assert_eq!(fallback.reason, Some("store_invalid"));
}

#[test]
fn unknown_names_are_disabled() {
    let registry = CapabilityRegistry::load(
        SharedCapabilityStore::from_store(InMemoryCapabilityStore::new()),
        default_capabilities(),
        CapturingAuditSink::shared(),
    );
    assert!(!registry.is_enabled("does_not_exist"));
    assert!(!registry.requires_elevated_role("does_not_exist"));
    assert!(registry.requires_elevated_role("cloud_management"));
}

#[test]
fn resolution_picks_first_registered_prefix() {
    let store = InMemoryCapabilityStore::with_capabilities(vec![
        Capability::new("broad", CapabilityConfig::new(true, &["/api"])),
        Capability::new("narrow", CapabilityConfig::new(true, &["/api/scrape"])),
    ]);
    let registry = CapabilityRegistry::load(
        SharedCapabilityStore::from_store(store),
        Vec::new(),
        CapturingAuditSink::shared(),
    );
    let first = registry.resolve_capability_for_path("/api/scrape/page");
    assert_eq!(first, Some(CapabilityName::new("broad")));
    for _ in 0 .. 10 {
        assert_eq!(registry.resolve_capability_for_path("/api/scrape/page"), first);
    }
    assert_eq!(registry.resolve_capability_for_path("/health"), None);
}

#[test]
fn update_is_visible_immediately() {
    let registry = CapabilityRegistry::load(
        SharedCapabilityStore::from_store(InMemoryCapabilityStore::new()),
        default_capabilities(),
        CapturingAuditSink::shared(),
    );
    let mut config = registry.snapshot().get("web_scraping").unwrap().config.clone();
    config.enabled = false;

    registry.update(&CapabilityName::new("web_scraping"), config, &admin()).unwrap();

    assert!(!registry.is_enabled("web_scraping"));
}

#[test]
fn first_update_over_fallback_persists_whole_set() {
    let store = InMemoryCapabilityStore::new();
    let registry = CapabilityRegistry::load(
        SharedCapabilityStore::from_store(store.clone()),
        default_capabilities(),
        CapturingAuditSink::shared(),
    );
    let config = CapabilityConfig::new(true, &["/api/cloud/deploy"]).with_required_role("admin");
    let snapshot =
        registry.update(&CapabilityName::new("cloud_management"), config, &admin()).unwrap();

    assert_eq!(snapshot.source(), RegistrySource::Persisted);
    let persisted = store.load_all().unwrap();
    let names: Vec<&str> = persisted.iter().map(|cap| cap.name.as_str()).collect();
    assert_eq!(names, vec!["web_scraping", "social_media", "cloud_management"]);
    assert!(persisted[2].config.enabled);
}

#[test]
fn failed_durable_write_leaves_state_unchanged() {
    let store = Arc::new(FlakyCapabilityStore::with_capabilities(default_capabilities()));
    let audit = CapturingAuditSink::shared();
    let registry = CapabilityRegistry::load(
        SharedCapabilityStore::new(store.clone()),
        Vec::new(),
        audit.clone(),
    );
    store.fail_writes(true);

    let mut config = registry.snapshot().get("web_scraping").unwrap().config.clone();
    config.enabled = false;
    let err = registry.update(&CapabilityName::new("web_scraping"), config, &admin()).unwrap_err();

    assert!(matches!(err, RegistryError::Persist(_)));
    assert!(registry.is_enabled("web_scraping"));
    assert_eq!(audit.count(AuditEventKind::CapabilityUpdateFailed), 1);
    assert_eq!(audit.count(AuditEventKind::CapabilityUpdated), 0);
}

#[test]
fn failed_fallback_persist_leaves_store_empty() {
    let store = Arc::new(FlakyCapabilityStore::default());
    store.fail_on_write(2);
    let registry = CapabilityRegistry::load(
        SharedCapabilityStore::new(store.clone()),
        default_capabilities(),
        CapturingAuditSink::shared(),
    );
    let mut config = registry.snapshot().get("web_scraping").unwrap().config.clone();
    config.enabled = false;
    let err = registry.update(&CapabilityName::new("web_scraping"), config, &admin()).unwrap_err();
    assert!(matches!(err, RegistryError::Persist(_)));
    assert!(store.load_all().unwrap().is_empty());

    let reloaded = CapabilityRegistry::load(
        SharedCapabilityStore::new(store),
        default_capabilities(),
        CapturingAuditSink::shared(),
    );
    let snapshot = reloaded.snapshot();
    assert_eq!(snapshot.source(), RegistrySource::Fallback);
    assert_eq!(snapshot.len(), 3);
    assert!(reloaded.is_enabled("web_scraping"));
    assert_eq!(
        reloaded.resolve_capability_for_path("/api/cloud/deploy"),
        Some(CapabilityName::new("cloud_management"))
    );
}

#[test]
fn invalid_update_is_rejected_before_persisting() {
    let store = Arc::new(FlakyCapabilityStore::with_capabilities(default_capabilities()));
    let registry = CapabilityRegistry::load(
        SharedCapabilityStore::new(store.clone()),
        Vec::new(),
        CapturingAuditSink::shared(),
    );
    let config = CapabilityConfig::new(true, &["/api/scrape"]).with_rate_limit("0/hour");
    let err = registry.update(&CapabilityName::new("web_scraping"), config, &admin()).unwrap_err();
    assert_eq!(err.code(), "invalid_capability");

    let bad_name = CapabilityConfig::new(true, &["/x"]);
    assert!(registry.update(&CapabilityName::new("bad name"), bad_name, &admin()).is_err());
    assert_eq!(store.load_all().unwrap().len(), 3);
}

#[test]
fn update_appends_new_capability_last() {
    let registry = CapabilityRegistry::load(
        SharedCapabilityStore::from_store(InMemoryCapabilityStore::with_capabilities(
            default_capabilities(),
        )),
        Vec::new(),
        CapturingAuditSink::shared(),
    );
    registry
        .update(&CapabilityName::new("exports"), CapabilityConfig::new(true, &["/api"]), &admin())
        .unwrap();
    let snapshot = registry.snapshot();
    assert_eq!(snapshot.capabilities().last().unwrap().name.as_str(), "exports");
    assert_eq!(
        registry.resolve_capability_for_path("/api/scrape"),
        Some(CapabilityName::new("web_scraping"))
    );
}

#[test]
fn misconfigured_rate_limits_are_reported_at_load() {
    let store = InMemoryCapabilityStore::with_capabilities(vec![Capability::new(
        "weekly",
        CapabilityConfig::new(true, &["/api/weekly"]).with_rate_limit("10/week"),
    )]);
    let audit = CapturingAuditSink::shared();
    let _registry = CapabilityRegistry::load(
        SharedCapabilityStore::from_store(store),
        Vec::new(),
        audit.clone(),
    );
    assert_eq!(audit.count(AuditEventKind::RateLimitMisconfigured), 1);
}

#[test]
fn readers_see_old_or_new_snapshot_during_updates() {
    let registry = Arc::new(CapabilityRegistry::load(
        SharedCapabilityStore::from_store(InMemoryCapabilityStore::with_capabilities(
            default_capabilities(),
        )),
        Vec::new(),
        CapturingAuditSink::shared(),
    ));
    let writer = {
        let registry = Arc::clone(&registry);
        thread::spawn(move || {
            for round in 0 .. 50 {
                let config = CapabilityConfig::new(round % 2 == 0, &["/api/scrape"]);
                registry.update(&CapabilityName::new("web_scraping"), config, &admin()).unwrap();
            }
        })
    };
    for _ in 0 .. 200 {
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 3);
        assert!(snapshot.get("web_scraping").is_some());
    }
    writer.join().unwrap();
    assert!(!registry.is_enabled("web_scraping"));
}

// capgate-store-sqlite/tests/sqlite_store.rs
// ============================================================================
// Module: SQLite Store Tests
// Description: Validate SQLite capability store and usage ledger behavior.
// Purpose: Ensure durable persistence, ordering, and fail-closed decoding.
// Dependencies: capgate-store-sqlite, capgate-core, rusqlite, tempfile
// ============================================================================

//! ## Overview
//! Conformance tests for the SQLite-backed capability store and usage
//! ledger, including reopen durability, registration order, corrupted rows,
//! and atomic bucket contention.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic_in_result_fn,
    clippy::unwrap_in_result,
    reason = "Test-only assertions and helpers are permitted."
)]

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;
use std::thread;

use capgate_core::BucketKey;
use capgate_core::CallerId;
use capgate_core::Capability;
use capgate_core::CapabilityConfig;
use capgate_core::CapabilityName;
use capgate_core::CapabilityStore;
use capgate_core::StoreError;
use capgate_core::Timestamp;
use capgate_core::UsageEvent;
use capgate_core::UsageLedger;
use capgate_core::default_capabilities;
use capgate_store_sqlite::SqliteCapabilityStore;
use capgate_store_sqlite::SqliteStoreConfig;
use capgate_store_sqlite::SqliteStoreError;
use capgate_store_sqlite::SqliteUsageLedger;
use rusqlite::Connection;
use rusqlite::params;
use tempfile::TempDir;

// ============================================================================
// SECTION: Helpers
// ============================================================================

fn config_in(dir: &TempDir) -> SqliteStoreConfig {
    SqliteStoreConfig::new(dir.path().join("capgate.db"))
}

fn actor() -> CallerId {
    CallerId::new("admin-1")
}

fn event(caller: &str, capability: &str, at_ms: i64, success: bool) -> UsageEvent {
    UsageEvent {
        caller_id: CallerId::new(caller),
        capability: CapabilityName::new(capability),
        endpoint: "/api/scrape/page".to_string(),
        timestamp: Timestamp::from_unix_millis(at_ms),
        success,
        latency_ms: Some(12),
        error: (!success).then(|| "upstream failed".to_string()),
    }
}

// ============================================================================
// SECTION: Capability Store
// ============================================================================

#[test]
fn capabilities_survive_reopen_in_registration_order() {
    let dir = TempDir::new().unwrap();
    let config = config_in(&dir);
    {
        let store = SqliteCapabilityStore::new(&config).unwrap();
        for capability in default_capabilities() {
            store.upsert(&capability, &actor()).unwrap();
        }
    }
    let store = SqliteCapabilityStore::new(&config).unwrap();
    let loaded = store.load_all().unwrap();
    assert_eq!(loaded, default_capabilities());
}

#[test]
fn upsert_replaces_in_place_and_appends_history() {
    let dir = TempDir::new().unwrap();
    let config = config_in(&dir);
    let store = SqliteCapabilityStore::new(&config).unwrap();
    for capability in default_capabilities() {
        store.upsert(&capability, &actor()).unwrap();
    }
    let disabled = Capability::new("web_scraping", CapabilityConfig::new(false, &["/api/scrape"]));
    store.upsert(&disabled, &CallerId::new("admin-2")).unwrap();

    let loaded = store.load_all().unwrap();
    assert_eq!(loaded[0], disabled);
    assert_eq!(loaded.len(), 3);

    let connection = Connection::open(&config.path).unwrap();
    let history: i64 = connection
        .query_row(
            "SELECT COUNT(*) FROM capability_history WHERE name = ?1",
            params!["web_scraping"],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(history, 2);
    let updated_by: String = connection
        .query_row(
            "SELECT updated_by FROM capabilities WHERE name = ?1",
            params!["web_scraping"],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(updated_by, "admin-2");
}

#[test]
fn batch_upsert_is_all_or_nothing() {
    let dir = TempDir::new().unwrap();
    let config = config_in(&dir);
    let store = SqliteCapabilityStore::new(&config).unwrap();
    let connection = Connection::open(&config.path).unwrap();
    connection
        .execute_batch(
            "CREATE TRIGGER reject_cloud BEFORE INSERT ON capabilities \
             WHEN NEW.name = 'cloud_management' BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
        )
        .unwrap();

    let err = store.upsert_all(&default_capabilities(), &actor()).unwrap_err();
    assert!(matches!(err, StoreError::Store(_)));
    assert!(store.load_all().unwrap().is_empty());
    let history: i64 = connection
        .query_row("SELECT COUNT(*) FROM capability_history", params![], |row| row.get(0))
        .unwrap();
    assert_eq!(history, 0);

    connection.execute_batch("DROP TRIGGER reject_cloud;").unwrap();
    store.upsert_all(&default_capabilities(), &actor()).unwrap();
    let names: Vec<String> =
        store.load_all().unwrap().into_iter().map(|cap| cap.name.to_string()).collect();
    assert_eq!(names, vec!["web_scraping", "social_media", "cloud_management"]);
}

#[test]
fn concurrent_appends_and_counts_all_land() {
    let dir = TempDir::new().unwrap();
    let ledger = Arc::new(SqliteUsageLedger::new(&config_in(&dir)).unwrap());
    let handles: Vec<_> = (0 .. 4)
        .map(|worker| {
            let ledger = Arc::clone(&ledger);
            thread::spawn(move || {
                let caller = format!("caller-{worker}");
                for step in 0 .. 10 {
                    ledger.append(event(&caller, "web_scraping", step, true)).unwrap();
                    ledger
                        .count_in_window(
                            &CallerId::new(caller.as_str()),
                            &CapabilityName::new("web_scraping"),
                            Timestamp::from_unix_millis(0),
                        )
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(ledger.count_all_since(Timestamp::from_unix_millis(0)).unwrap(), 40);
}

#[test]
fn empty_database_loads_no_capabilities() {
    let dir = TempDir::new().unwrap();
    let store = SqliteCapabilityStore::new(&config_in(&dir)).unwrap();
    assert!(store.load_all().unwrap().is_empty());
}

#[test]
fn corrupted_config_row_fails_closed() {
    let dir = TempDir::new().unwrap();
    let config = config_in(&dir);
    let store = SqliteCapabilityStore::new(&config).unwrap();
    store
        .upsert(&Capability::new("reports", CapabilityConfig::new(true, &["/api/r"])), &actor())
        .unwrap();
    let connection = Connection::open(&config.path).unwrap();
    connection
        .execute(
            "UPDATE capabilities SET config_json = ?1 WHERE name = ?2",
            params![b"{not json".to_vec(), "reports"],
        )
        .unwrap();

    let err = store.load_all().unwrap_err();
    assert!(matches!(err, StoreError::Corrupt(_)));
}

#[test]
fn schema_version_mismatch_is_rejected() {
    let dir = TempDir::new().unwrap();
    let config = config_in(&dir);
    drop(SqliteCapabilityStore::new(&config).unwrap());
    let connection = Connection::open(&config.path).unwrap();
    connection.execute("UPDATE store_meta SET version = 99", params![]).unwrap();
    drop(connection);

    let err = SqliteCapabilityStore::new(&config).err().unwrap();
    assert!(matches!(err, SqliteStoreError::VersionMismatch(_)));
}

#[test]
fn directory_path_is_rejected() {
    let dir = TempDir::new().unwrap();
    let config = SqliteStoreConfig::new(dir.path());
    let err = SqliteCapabilityStore::new(&config).err().unwrap();
    assert!(matches!(err, SqliteStoreError::Invalid(_)));
}

// ============================================================================
// SECTION: Usage Ledger
// ============================================================================

#[test]
fn ledger_counts_trailing_window_per_caller() {
    let dir = TempDir::new().unwrap();
    let ledger = SqliteUsageLedger::new(&config_in(&dir)).unwrap();
    ledger.append(event("c", "web_scraping", 1_000, true)).unwrap();
    ledger.append(event("c", "web_scraping", 2_000, false)).unwrap();
    ledger.append(event("c", "social_media", 2_000, true)).unwrap();
    ledger.append(event("d", "web_scraping", 2_000, true)).unwrap();

    let count = ledger
        .count_in_window(
            &CallerId::new("c"),
            &CapabilityName::new("web_scraping"),
            Timestamp::from_unix_millis(1_500),
        )
        .unwrap();
    assert_eq!(count, 1);
    assert_eq!(ledger.count_all_since(Timestamp::from_unix_millis(0)).unwrap(), 4);
}

#[test]
fn ledger_and_store_share_one_database() {
    let dir = TempDir::new().unwrap();
    let config = config_in(&dir);
    let store = SqliteCapabilityStore::new(&config).unwrap();
    let ledger = SqliteUsageLedger::new(&config).unwrap();
    store.upsert(&default_capabilities()[0], &actor()).unwrap();
    ledger.append(event("c", "web_scraping", 10, true)).unwrap();
    drop(ledger);

    let reopened = SqliteUsageLedger::new(&config).unwrap();
    assert_eq!(reopened.count_all_since(Timestamp::from_unix_millis(0)).unwrap(), 1);
    assert_eq!(store.load_all().unwrap().len(), 1);
}

#[test]
fn bucket_slots_reset_on_new_window() {
    let dir = TempDir::new().unwrap();
    let ledger = SqliteUsageLedger::new(&config_in(&dir)).unwrap();
    let key = |window_start: i64| BucketKey {
        caller_id: CallerId::new("c"),
        capability: CapabilityName::new("web_scraping"),
        window_start: Timestamp::from_unix_millis(window_start),
    };
    assert!(ledger.acquire_bucket_slot(&key(60_000), 2).unwrap());
    assert!(ledger.acquire_bucket_slot(&key(60_000), 2).unwrap());
    assert!(!ledger.acquire_bucket_slot(&key(60_000), 2).unwrap());
    assert!(ledger.acquire_bucket_slot(&key(120_000), 2).unwrap());
}

#[test]
fn bucket_slots_never_overshoot_under_contention() {
    let dir = TempDir::new().unwrap();
    let ledger = Arc::new(SqliteUsageLedger::new(&config_in(&dir)).unwrap());
    let handles: Vec<_> = (0 .. 4)
        .map(|_| {
            let ledger = Arc::clone(&ledger);
            thread::spawn(move || {
                let key = BucketKey {
                    caller_id: CallerId::new("c"),
                    capability: CapabilityName::new("web_scraping"),
                    window_start: Timestamp::from_unix_millis(0),
                };
                (0 .. 10).filter(|_| ledger.acquire_bucket_slot(&key, 7).unwrap()).count()
            })
        })
        .collect();
    let acquired: usize = handles.into_iter().map(|handle| handle.join().unwrap()).sum();
    assert_eq!(acquired, 7);
}

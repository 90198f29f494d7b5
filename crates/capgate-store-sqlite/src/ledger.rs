// capgate-store-sqlite/src/ledger.rs
// ============================================================================
// Module: SQLite Usage Ledger
// Description: Durable UsageLedger backed by SQLite.
// Purpose: Persist usage events and atomic rate buckets across restarts.
// Dependencies: capgate-core, rusqlite
// ============================================================================

//! ## Overview
//! Usage events are appended to `usage_events` and counted with indexed
//! range queries on `(caller_id, capability, timestamp_ms)`. Atomic buckets
//! live in `usage_buckets`; a slot is acquired by a single conditional
//! upsert, so concurrent acquisitions never exceed the quota.
//!
//! Each operation checks a connection out of a small pool instead of
//! sharing one locked connection, so gated requests only contend inside
//! `SQLite` itself (readers run in parallel under WAL; writers wait on the
//! busy timeout).

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;
use std::sync::Mutex;

use capgate_core::BucketKey;
use capgate_core::CallerId;
use capgate_core::CapabilityName;
use capgate_core::LedgerError;
use capgate_core::Timestamp;
use capgate_core::UsageEvent;
use capgate_core::UsageLedger;
use rusqlite::Connection;
use rusqlite::params;

use crate::store::SqliteStoreConfig;
use crate::store::SqliteStoreError;
use crate::store::open_connection;
use crate::store::open_database;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Maximum idle connections kept for reuse.
const MAX_IDLE_CONNECTIONS: usize = 8;

// ============================================================================
// SECTION: Connection Pool
// ============================================================================

/// Idle connections to one ledger database.
struct ConnectionPool {
    /// Settings for new connections.
    config: SqliteStoreConfig,
    /// Connections available for checkout.
    idle: Mutex<Vec<Connection>>,
}

impl ConnectionPool {
    /// Takes an idle connection or opens a new one.
    fn checkout(&self) -> Result<Connection, LedgerError> {
        let reused = self
            .idle
            .lock()
            .map_err(|_| LedgerError::Storage("connection pool poisoned".to_string()))?
            .pop();
        match reused {
            Some(connection) => Ok(connection),
            None => open_connection(&self.config)
                .map_err(|err| LedgerError::Storage(err.to_string())),
        }
    }

    /// Returns a connection to the pool; surplus connections are closed.
    fn checkin(&self, connection: Connection) {
        if let Ok(mut idle) = self.idle.lock()
            && idle.len() < MAX_IDLE_CONNECTIONS
        {
            idle.push(connection);
        }
    }
}

// ============================================================================
// SECTION: Ledger
// ============================================================================

/// `SQLite`-backed usage ledger.
#[derive(Clone)]
pub struct SqliteUsageLedger {
    /// Pooled connections to the ledger database.
    pool: Arc<ConnectionPool>,
}

impl SqliteUsageLedger {
    /// Opens an `SQLite`-backed usage ledger.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteStoreError`] when the database cannot be opened or
    /// initialized.
    pub fn new(config: &SqliteStoreConfig) -> Result<Self, SqliteStoreError> {
        let connection = open_database(config)?;
        Ok(Self {
            pool: Arc::new(ConnectionPool {
                config: config.clone(),
                idle: Mutex::new(vec![connection]),
            }),
        })
    }

    /// Runs `f` on a pooled connection. The pool lock is not held while
    /// `f` runs.
    fn with_connection<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, rusqlite::Error>,
    ) -> Result<T, LedgerError> {
        let mut connection = self.pool.checkout()?;
        let result = f(&mut connection).map_err(|err| LedgerError::Storage(err.to_string()));
        self.pool.checkin(connection);
        result
    }
}

impl UsageLedger for SqliteUsageLedger {
    fn append(&self, event: UsageEvent) -> Result<(), LedgerError> {
        let latency_ms =
            event.latency_ms.map(|latency| i64::try_from(latency).unwrap_or(i64::MAX));
        self.with_connection(|connection| {
            connection.execute(
                "INSERT INTO usage_events (caller_id, capability, endpoint, timestamp_ms, \
                 success, latency_ms, error) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    event.caller_id.as_str(),
                    event.capability.as_str(),
                    event.endpoint,
                    event.timestamp.as_unix_millis(),
                    event.success,
                    latency_ms,
                    event.error
                ],
            )
        })?;
        Ok(())
    }

    fn count_in_window(
        &self,
        caller_id: &CallerId,
        capability: &CapabilityName,
        since: Timestamp,
    ) -> Result<u64, LedgerError> {
        let count: i64 = self.with_connection(|connection| {
            connection.query_row(
                "SELECT COUNT(*) FROM usage_events WHERE caller_id = ?1 AND capability = ?2 AND \
                 timestamp_ms >= ?3",
                params![caller_id.as_str(), capability.as_str(), since.as_unix_millis()],
                |row| row.get(0),
            )
        })?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    fn count_all_since(&self, since: Timestamp) -> Result<u64, LedgerError> {
        let count: i64 = self.with_connection(|connection| {
            connection.query_row(
                "SELECT COUNT(*) FROM usage_events WHERE timestamp_ms >= ?1",
                params![since.as_unix_millis()],
                |row| row.get(0),
            )
        })?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    fn acquire_bucket_slot(&self, key: &BucketKey, quota: u64) -> Result<bool, LedgerError> {
        let quota = i64::try_from(quota).unwrap_or(i64::MAX);
        let changed = self.with_connection(|connection| {
            connection.execute(
                "INSERT INTO usage_buckets (caller_id, capability, window_start, used) \
                 VALUES (?1, ?2, ?3, 1) \
                 ON CONFLICT(caller_id, capability) DO UPDATE SET \
                 used = CASE WHEN excluded.window_start > usage_buckets.window_start \
                 THEN 1 ELSE usage_buckets.used + 1 END, \
                 window_start = MAX(excluded.window_start, usage_buckets.window_start) \
                 WHERE excluded.window_start > usage_buckets.window_start \
                 OR usage_buckets.used < ?4",
                params![
                    key.caller_id.as_str(),
                    key.capability.as_str(),
                    key.window_start.as_unix_millis(),
                    quota
                ],
            )
        })?;
        Ok(changed == 1)
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, reason = "Test-only assertions.")]

    use capgate_core::Timestamp;
    use capgate_core::UsageLedger;
    use tempfile::TempDir;

    use super::MAX_IDLE_CONNECTIONS;
    use super::SqliteUsageLedger;
    use crate::store::SqliteStoreConfig;

    fn idle_connections(ledger: &SqliteUsageLedger) -> usize {
        ledger.pool.idle.lock().unwrap().len()
    }

    #[test]
    fn queries_proceed_while_another_connection_is_busy() {
        let dir = TempDir::new().unwrap();
        let ledger = SqliteUsageLedger::new(&SqliteStoreConfig::new(dir.path().join("u.db")))
            .unwrap();
        let busy = ledger.pool.checkout().unwrap();
        assert_eq!(idle_connections(&ledger), 0);

        assert_eq!(ledger.count_all_since(Timestamp::from_unix_millis(0)).unwrap(), 0);
        ledger.pool.checkin(busy);
        assert_eq!(idle_connections(&ledger), 2);
    }

    #[test]
    fn surplus_connections_are_closed() {
        let dir = TempDir::new().unwrap();
        let ledger = SqliteUsageLedger::new(&SqliteStoreConfig::new(dir.path().join("u.db")))
            .unwrap();
        let held: Vec<_> =
            (0 .. MAX_IDLE_CONNECTIONS + 2).map(|_| ledger.pool.checkout().unwrap()).collect();
        for connection in held {
            ledger.pool.checkin(connection);
        }
        assert_eq!(idle_connections(&ledger), MAX_IDLE_CONNECTIONS);
    }
}

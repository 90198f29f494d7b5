// capgate-server/src/snapshot_store.rs
// ============================================================================
// Module: JSON Snapshot Capability Store
// Description: File-backed capability store using a single JSON document.
// Purpose: Persist the capability set in a human-editable file.
// Dependencies: capgate-core, serde_json, tempfile
// ============================================================================

//! ## Overview
//! The snapshot file holds `{"capabilities": [...]}` in registration order.
//! Every upsert rewrites the whole document through a temporary file in the
//! same directory and renames it into place, so readers never observe a
//! partially written file. A missing file loads as an empty set.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fs;
use std::io::ErrorKind;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;

use capgate_core::CallerId;
use capgate_core::Capability;
use capgate_core::CapabilityStore;
use capgate_core::StoreError;
use serde::Deserialize;
use serde::Serialize;
use tempfile::NamedTempFile;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Maximum snapshot file size in bytes.
const MAX_SNAPSHOT_BYTES: u64 = 4 * 1024 * 1024;

// ============================================================================
// SECTION: Types
// ============================================================================

/// On-disk document layout.
#[derive(Debug, Default, Serialize, Deserialize)]
struct SnapshotDocument {
    /// Capabilities in registration order.
    #[serde(default)]
    capabilities: Vec<Capability>,
}

/// Capability store persisted as a JSON snapshot file.
pub struct JsonFileCapabilityStore {
    /// Snapshot path.
    path: PathBuf,
    /// Serializes read-modify-write cycles.
    write_lock: Mutex<()>,
}

impl JsonFileCapabilityStore {
    /// Creates a store for `path`. The file is created on first upsert.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Returns the snapshot path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the current document.
    fn read_document(&self) -> Result<SnapshotDocument, StoreError> {
        let metadata = match fs::metadata(&self.path) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Ok(SnapshotDocument::default());
            }
            Err(err) => return Err(StoreError::Io(err.to_string())),
        };
        if !metadata.is_file() {
            return Err(StoreError::Invalid("snapshot path is not a file".to_string()));
        }
        if metadata.len() > MAX_SNAPSHOT_BYTES {
            return Err(StoreError::Invalid("snapshot file exceeds size limit".to_string()));
        }
        let bytes = fs::read(&self.path).map_err(|err| StoreError::Io(err.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|err| StoreError::Corrupt(err.to_string()))
    }

    /// Atomically replaces the document on disk.
    fn write_document(&self, document: &SnapshotDocument) -> Result<(), StoreError> {
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent).map_err(|err| StoreError::Io(err.to_string()))?;
        let payload = serde_json::to_vec_pretty(document)
            .map_err(|err| StoreError::Invalid(err.to_string()))?;
        let mut temp =
            NamedTempFile::new_in(&parent).map_err(|err| StoreError::Io(err.to_string()))?;
        temp.write_all(&payload).map_err(|err| StoreError::Io(err.to_string()))?;
        temp.as_file().sync_all().map_err(|err| StoreError::Io(err.to_string()))?;
        temp.persist(&self.path).map_err(|err| StoreError::Io(err.error.to_string()))?;
        Ok(())
    }
}

impl CapabilityStore for JsonFileCapabilityStore {
    fn load_all(&self) -> Result<Vec<Capability>, StoreError> {
        Ok(self.read_document()?.capabilities)
    }

    fn upsert(&self, capability: &Capability, actor: &CallerId) -> Result<(), StoreError> {
        self.upsert_all(std::slice::from_ref(capability), actor)
    }

    fn upsert_all(
        &self,
        capabilities: &[Capability],
        _actor: &CallerId,
    ) -> Result<(), StoreError> {
        let guard =
            self.write_lock.lock().map_err(|_| StoreError::Store("mutex poisoned".to_string()))?;
        let mut document = self.read_document()?;
        for capability in capabilities {
            match document.capabilities.iter_mut().find(|entry| entry.name == capability.name) {
                Some(entry) => *entry = capability.clone(),
                None => document.capabilities.push(capability.clone()),
            }
        }
        let result = self.write_document(&document);
        drop(guard);
        result
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================

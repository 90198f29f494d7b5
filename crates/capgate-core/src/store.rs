// capgate-core/src/store.rs
// ============================================================================
// Module: Capability Store
// Description: Durable capability configuration interface and in-memory store.
// Purpose: Abstract where the registry reads and writes capability entries.
// Dependencies: thiserror
// ============================================================================

//! ## Overview
//! A [`CapabilityStore`] holds the persisted capability set. The registry
//! reads it once at load and writes through it on every update before the
//! new configuration becomes visible. Stores must preserve registration
//! order: `load_all` returns entries in the order they were first inserted.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;
use std::sync::Mutex;

use thiserror::Error;

use crate::capability::Capability;
use crate::identifiers::CallerId;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Actor recorded for writes issued by the system itself.
pub const SYSTEM_ACTOR: &str = "system";

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Capability store errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Store I/O error.
    #[error("capability store io error: {0}")]
    Io(String),
    /// Store reported an error.
    #[error("capability store error: {0}")]
    Store(String),
    /// Store data is corrupted or fails integrity checks.
    #[error("capability store corruption: {0}")]
    Corrupt(String),
    /// Store data is invalid.
    #[error("capability store invalid data: {0}")]
    Invalid(String),
}

// ============================================================================
// SECTION: Store Interface
// ============================================================================

/// Durable capability configuration store.
pub trait CapabilityStore: Send + Sync {
    /// Loads every persisted capability in registration order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store cannot be read.
    fn load_all(&self) -> Result<Vec<Capability>, StoreError>;

    /// Inserts or replaces a capability. New names are appended after the
    /// existing entries; existing names keep their position.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the write is not durable.
    fn upsert(&self, capability: &Capability, actor: &CallerId) -> Result<(), StoreError>;

    /// Upserts every entry of `capabilities` as one atomic write: either all
    /// entries are stored or the store is left unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the write is not durable.
    fn upsert_all(&self, capabilities: &[Capability], actor: &CallerId) -> Result<(), StoreError>;
}

// ============================================================================
// SECTION: In-Memory Store
// ============================================================================

/// In-memory capability store for tests and ephemeral deployments.
#[derive(Debug, Default, Clone)]
pub struct InMemoryCapabilityStore {
    /// Capabilities in registration order.
    entries: Arc<Mutex<Vec<Capability>>>,
}

impl InMemoryCapabilityStore {
    /// Creates an empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an in-memory store seeded with `capabilities`.
    #[must_use]
    pub fn with_capabilities(capabilities: Vec<Capability>) -> Self {
        Self {
            entries: Arc::new(Mutex::new(capabilities)),
        }
    }
}

impl CapabilityStore for InMemoryCapabilityStore {
    fn load_all(&self) -> Result<Vec<Capability>, StoreError> {
        let guard = self
            .entries
            .lock()
            .map_err(|_| StoreError::Store("capability store mutex poisoned".to_string()))?;
        Ok(guard.clone())
    }

    fn upsert(&self, capability: &Capability, actor: &CallerId) -> Result<(), StoreError> {
        self.upsert_all(std::slice::from_ref(capability), actor)
    }

    fn upsert_all(
        &self,
        capabilities: &[Capability],
        _actor: &CallerId,
    ) -> Result<(), StoreError> {
        let mut guard = self
            .entries
            .lock()
            .map_err(|_| StoreError::Store("capability store mutex poisoned".to_string()))?;
        for capability in capabilities {
            if let Some(existing) = guard.iter_mut().find(|entry| entry.name == capability.name) {
                *existing = capability.clone();
            } else {
                guard.push(capability.clone());
            }
        }
        drop(guard);
        Ok(())
    }
}

// ============================================================================
// SECTION: Shared Store Wrapper
// ============================================================================

/// Shared capability store backed by an `Arc` trait object.
#[derive(Clone)]
pub struct SharedCapabilityStore {
    /// Inner store implementation.
    inner: Arc<dyn CapabilityStore>,
}

impl SharedCapabilityStore {
    /// Wraps a capability store in a shared, clonable wrapper.
    #[must_use]
    pub fn from_store(store: impl CapabilityStore + 'static) -> Self {
        Self {
            inner: Arc::new(store),
        }
    }

    /// Wraps an existing shared store.
    #[must_use]
    pub const fn new(store: Arc<dyn CapabilityStore>) -> Self {
        Self {
            inner: store,
        }
    }
}

impl CapabilityStore for SharedCapabilityStore {
    fn load_all(&self) -> Result<Vec<Capability>, StoreError> {
        self.inner.load_all()
    }

    fn upsert(&self, capability: &Capability, actor: &CallerId) -> Result<(), StoreError> {
        self.inner.upsert(capability, actor)
    }

    fn upsert_all(&self, capabilities: &[Capability], actor: &CallerId) -> Result<(), StoreError> {
        self.inner.upsert_all(capabilities, actor)
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================

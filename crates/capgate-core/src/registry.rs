// capgate-core/src/registry.rs
// ============================================================================
// Module: Capability Registry
// Description: Immutable capability snapshots with write-through updates.
// Purpose: Answer enablement and path-resolution queries during gating.
// Dependencies: crate::store, crate::audit
// ============================================================================

//! ## Overview
//! The registry publishes an immutable [`RegistrySnapshot`] behind an
//! atomically swapped `Arc`. Readers clone the current `Arc` and never wait
//! on an update in progress. Updates are serialized by a write gate; each
//! one validates, builds the next snapshot, persists it through the
//! [`CapabilityStore`], and only then swaps it in. A failed durable write
//! leaves the published snapshot untouched.
//!
//! Loading never fails. When the store cannot be read, is empty, or holds
//! invalid entries, the registry starts from the fallback set (never
//! "allow all") and records why.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::RwLock;

use thiserror::Error;

use crate::audit::AuditEvent;
use crate::audit::AuditEventKind;
use crate::audit::AuditEventParams;
use crate::audit::AuditSink;
use crate::capability::Capability;
use crate::capability::CapabilityConfig;
use crate::capability::default_capabilities;
use crate::identifiers::CallerId;
use crate::identifiers::CapabilityName;
use crate::store::CapabilityStore;
use crate::store::SharedCapabilityStore;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Capability registry errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The requested update is invalid.
    #[error("invalid capability update: {0}")]
    Invalid(String),
    /// The durable write failed; in-memory state is unchanged.
    #[error("capability update not persisted: {0}")]
    Persist(String),
    /// The registry write gate is unavailable.
    #[error("capability registry lock error: {0}")]
    Lock(String),
}

impl RegistryError {
    /// Returns the stable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Invalid(_) => "invalid_capability",
            Self::Persist(_) => "persist_failed",
            Self::Lock(_) => "registry_locked",
        }
    }
}

// ============================================================================
// SECTION: Snapshot
// ============================================================================

/// Where the published capability set came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrySource {
    /// Loaded from the durable store, or written through it since.
    Persisted,
    /// Started from the fallback set; nothing has been persisted yet.
    Fallback,
}

/// Immutable capability set.
///
/// # Invariants
/// - Names are unique.
/// - `capabilities` is in registration order; `index` maps names into it.
#[derive(Debug, Clone)]
pub struct RegistrySnapshot {
    /// Capabilities in registration order.
    capabilities: Vec<Capability>,
    /// Name to position lookup.
    index: BTreeMap<CapabilityName, usize>,
    /// Origin of the capability set.
    source: RegistrySource,
}

impl RegistrySnapshot {
    /// Builds a snapshot, rejecting duplicate names.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Invalid`] when a name appears twice.
    pub fn from_capabilities(
        capabilities: Vec<Capability>,
        source: RegistrySource,
    ) -> Result<Self, RegistryError> {
        let mut index = BTreeMap::new();
        for (position, capability) in capabilities.iter().enumerate() {
            if index.insert(capability.name.clone(), position).is_some() {
                return Err(RegistryError::Invalid(format!(
                    "duplicate capability name: {}",
                    capability.name
                )));
            }
        }
        Ok(Self {
            capabilities,
            index,
            source,
        })
    }

    /// Returns the capability named `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Capability> {
        self.index.get(name).and_then(|position| self.capabilities.get(*position))
    }

    /// Returns true when `name` exists and is enabled. Unknown names are
    /// disabled.
    #[must_use]
    pub fn is_enabled(&self, name: &str) -> bool {
        self.get(name).is_some_and(|capability| capability.config.enabled)
    }

    /// Returns the first capability, in registration order, with an
    /// endpoint prefix that is a prefix of `path`.
    #[must_use]
    pub fn resolve_capability_for_path(&self, path: &str) -> Option<&Capability> {
        self.capabilities.iter().find(|capability| capability.config.governs(path))
    }

    /// Returns true when `name` declares a required role.
    #[must_use]
    pub fn requires_elevated_role(&self, name: &str) -> bool {
        self.get(name).is_some_and(|capability| capability.config.requires_role.is_some())
    }

    /// Returns every capability in registration order.
    #[must_use]
    pub fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    /// Returns the snapshot origin.
    #[must_use]
    pub const fn source(&self) -> RegistrySource {
        self.source
    }

    /// Returns the number of capabilities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    /// Returns true when no capability is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }

    /// Returns the next snapshot with `capability` replaced in place, or
    /// appended when new.
    fn with_update(&self, capability: Capability) -> Self {
        let mut next = self.clone();
        if let Some(position) = next.index.get(&capability.name).copied() {
            if let Some(slot) = next.capabilities.get_mut(position) {
                *slot = capability;
            }
        } else {
            next.index.insert(capability.name.clone(), next.capabilities.len());
            next.capabilities.push(capability);
        }
        next
    }

    /// Returns a copy marked as persisted.
    fn persisted(mut self) -> Self {
        self.source = RegistrySource::Persisted;
        self
    }
}

// ============================================================================
// SECTION: Registry
// ============================================================================

/// Shared capability registry.
pub struct CapabilityRegistry {
    /// Published snapshot.
    current: RwLock<Arc<RegistrySnapshot>>,
    /// Serializes updates.
    write_gate: Mutex<()>,
    /// Durable backing store.
    store: SharedCapabilityStore,
    /// Audit sink for registry transitions.
    audit: Arc<dyn AuditSink>,
}

impl CapabilityRegistry {
    /// Loads the registry from `store`, falling back to `fallback` when the
    /// store is unreadable, empty, or invalid. An invalid fallback set is
    /// replaced with [`default_capabilities`].
    #[must_use]
    pub fn load(
        store: SharedCapabilityStore,
        fallback: Vec<Capability>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let snapshot = match store.load_all() {
            Ok(entries) if entries.is_empty() => {
                fallback_snapshot(fallback, "store_empty", None, &*audit)
            }
            Ok(entries) => match validated_snapshot(entries) {
                Ok(snapshot) => {
                    audit.record(&AuditEvent::new(
                        AuditEventKind::CapabilityRegistryLoaded,
                        AuditEventParams {
                            detail: Some(format!("{} capabilities", snapshot.len())),
                            ..AuditEventParams::default()
                        },
                    ));
                    snapshot
                }
                Err(err) => {
                    fallback_snapshot(fallback, "store_invalid", Some(err.to_string()), &*audit)
                }
            },
            Err(err) => {
                fallback_snapshot(fallback, "store_unavailable", Some(err.to_string()), &*audit)
            }
        };
        report_misconfigured(snapshot.capabilities(), &*audit);
        Self {
            current: RwLock::new(Arc::new(snapshot)),
            write_gate: Mutex::new(()),
            store,
            audit,
        }
    }

    /// Returns the published snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        let guard = self.current.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard)
    }

    /// Returns true when `name` exists and is enabled.
    #[must_use]
    pub fn is_enabled(&self, name: &str) -> bool {
        self.snapshot().is_enabled(name)
    }

    /// Returns the name of the first capability governing `path`.
    #[must_use]
    pub fn resolve_capability_for_path(&self, path: &str) -> Option<CapabilityName> {
        self.snapshot().resolve_capability_for_path(path).map(|capability| capability.name.clone())
    }

    /// Returns true when `name` declares a required role.
    #[must_use]
    pub fn requires_elevated_role(&self, name: &str) -> bool {
        self.snapshot().requires_elevated_role(name)
    }

    /// Replaces (or adds) `name` with `config`, persisting before
    /// publishing. When the registry is still serving the fallback set, the
    /// whole next snapshot is persisted so the store never holds a partial
    /// capability set.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Invalid`] for invalid input and
    /// [`RegistryError::Persist`] when the durable write fails; in both
    /// cases the published snapshot is unchanged.
    pub fn update(
        &self,
        name: &CapabilityName,
        config: CapabilityConfig,
        actor: &CallerId,
    ) -> Result<Arc<RegistrySnapshot>, RegistryError> {
        let capability = Capability::new(name.clone(), config);
        if let Err(err) = capability.validate() {
            let err = RegistryError::Invalid(err.to_string());
            self.report_update_failure(name, actor, &err);
            return Err(err);
        }

        let _serialized = self
            .write_gate
            .lock()
            .map_err(|_| RegistryError::Lock("registry write gate poisoned".to_string()))?;
        let current = self.snapshot();
        let next = current.with_update(capability.clone());
        let persisted = match current.source() {
            RegistrySource::Persisted => self.store.upsert(&capability, actor),
            RegistrySource::Fallback => self.store.upsert_all(next.capabilities(), actor),
        };
        if let Err(err) = persisted {
            let err = RegistryError::Persist(err.to_string());
            self.report_update_failure(name, actor, &err);
            return Err(err);
        }

        let next = Arc::new(next.persisted());
        {
            let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
            *guard = Arc::clone(&next);
        }
        self.audit.record(&AuditEvent::new(
            AuditEventKind::CapabilityUpdated,
            AuditEventParams {
                capability: Some(name.clone()),
                caller_id: Some(actor.clone()),
                detail: Some(format!("enabled={}", capability.config.enabled)),
                ..AuditEventParams::default()
            },
        ));
        report_misconfigured(std::slice::from_ref(&capability), &*self.audit);
        Ok(next)
    }

    /// Emits a `capability_update_failed` audit event.
    fn report_update_failure(&self, name: &CapabilityName, actor: &CallerId, err: &RegistryError) {
        self.audit.record(&AuditEvent::new(
            AuditEventKind::CapabilityUpdateFailed,
            AuditEventParams {
                capability: Some(name.clone()),
                caller_id: Some(actor.clone()),
                reason: Some(err.code()),
                detail: Some(err.to_string()),
                ..AuditEventParams::default()
            },
        ));
    }
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Builds a persisted snapshot after validating every entry.
fn validated_snapshot(entries: Vec<Capability>) -> Result<RegistrySnapshot, RegistryError> {
    for capability in &entries {
        capability.validate().map_err(|err| RegistryError::Invalid(err.to_string()))?;
    }
    RegistrySnapshot::from_capabilities(entries, RegistrySource::Persisted)
}

/// Builds the fallback snapshot and audits the reason.
fn fallback_snapshot(
    fallback: Vec<Capability>,
    reason: &'static str,
    detail: Option<String>,
    audit: &dyn AuditSink,
) -> RegistrySnapshot {
    audit.record(&AuditEvent::new(
        AuditEventKind::CapabilityRegistryFallback,
        AuditEventParams {
            reason: Some(reason),
            detail,
            ..AuditEventParams::default()
        },
    ));
    let valid = fallback.iter().all(|capability| capability.validate().is_ok());
    let candidate = if valid { fallback } else { default_capabilities() };
    RegistrySnapshot::from_capabilities(candidate, RegistrySource::Fallback).unwrap_or_else(|_| {
        RegistrySnapshot::from_capabilities(default_capabilities(), RegistrySource::Fallback)
            .unwrap_or(RegistrySnapshot {
                capabilities: Vec::new(),
                index: BTreeMap::new(),
                source: RegistrySource::Fallback,
            })
    })
}

/// Audits capabilities whose rate limit evaluates as unlimited because it
/// cannot be parsed.
fn report_misconfigured(capabilities: &[Capability], audit: &dyn AuditSink) {
    for capability in capabilities {
        if let Err(err) = capability.config.policy() {
            audit.record(&AuditEvent::new(
                AuditEventKind::RateLimitMisconfigured,
                AuditEventParams {
                    capability: Some(capability.name.clone()),
                    reason: Some(err.code()),
                    detail: Some(err.to_string()),
                    ..AuditEventParams::default()
                },
            ));
        }
    }
}

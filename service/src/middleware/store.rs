//! In-memory connection presets and their credentials.
//!
//! Each preset lives behind its own mutex.  That mutex guards the credential
//! list, every credential's breaker and the rotation cursor, so management
//! edits and key selection never observe each other half-done.  The outer map
//! lock is only held long enough to find or swap a preset handle.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::middleware::breaker::CircuitBreaker;
use crate::providers::ProviderKind;
use crate::providers::config::PresetConfig;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("preset name must not be empty")]
    EmptyName,
    #[error("preset already exists: {0}")]
    DuplicatePreset(String),
    #[error("preset not found: {0}")]
    PresetNotFound(String),
    #[error("credential {id} not found in preset {preset}")]
    CredentialNotFound { preset: String, id: CredentialId },
    #[error("credential already present in preset {0}")]
    DuplicateCredential(String),
    #[error("credential for preset {0} must not be empty")]
    EmptyCredential(String),
    #[error("invalid endpoint for preset {preset}: {reason}")]
    InvalidEndpoint { preset: String, reason: String },
}

// ---------------------------------------------------------------------------
// Credential identity and secrets
// ---------------------------------------------------------------------------

/// Opaque, store-wide unique credential identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CredentialId(u64);

impl CredentialId {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CredentialId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "key#{}", self.0)
    }
}

/// A credential secret.  Wiped on drop, masked in `Debug`.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(Zeroizing<String>);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(Zeroizing::new(value.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.as_str()
    }

    /// `sk-a...wxyz` style rendering for operators.
    pub fn masked(&self) -> String {
        let s = self.expose();
        let chars: Vec<char> = s.chars().collect();
        if chars.len() > 8 {
            let head: String = chars[..4].iter().collect();
            let tail: String = chars[chars.len() - 4..].iter().collect();
            format!("{head}...{tail}")
        } else {
            "****".to_string()
        }
    }

    /// First 12 hex digits of the SHA-256 of the secret.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.expose().as_bytes());
        let mut hex = hex::encode(digest);
        hex.truncate(12);
        hex
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Secret").field(&self.masked()).finish()
    }
}

// ---------------------------------------------------------------------------
// Preset state
// ---------------------------------------------------------------------------

/// Static description of a preset's backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresetMeta {
    pub name: String,
    pub kind: ProviderKind,
    pub endpoint: String,
    pub model: String,
}

pub(crate) struct CredentialSlot {
    pub(crate) id: CredentialId,
    pub(crate) secret: Secret,
    pub(crate) breaker: CircuitBreaker,
}

pub(crate) struct PresetState {
    pub(crate) meta: PresetMeta,
    pub(crate) credentials: Vec<CredentialSlot>,
    pub(crate) cursor: usize,
}

impl PresetState {
    pub(crate) fn slot_mut(&mut self, id: CredentialId) -> Option<&mut CredentialSlot> {
        self.credentials.iter_mut().find(|c| c.id == id)
    }
}

/// Shared handle to one preset; the per-preset lock lives here.
pub struct PresetHandle {
    state: Mutex<PresetState>,
}

impl PresetHandle {
    pub(crate) fn lock(&self) -> MutexGuard<'_, PresetState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Public view of a credential inside a preset snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialInfo {
    pub id: CredentialId,
    pub masked: String,
    pub fingerprint: String,
}

/// Read-only snapshot of a preset.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionPreset {
    #[serde(flatten)]
    pub meta: PresetMeta,
    pub credentials: Vec<CredentialInfo>,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// All presets known to the gateway, plus the "current" selection.
#[derive(Default)]
pub struct CredentialStore {
    presets: RwLock<HashMap<String, Arc<PresetHandle>>>,
    current: RwLock<Option<String>>,
    next_id: AtomicU64,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from preset definitions; the first becomes current.
    pub fn from_presets<I>(presets: I) -> Result<Self, StoreError>
    where
        I: IntoIterator<Item = PresetConfig>,
    {
        let store = Self::new();
        for preset in presets {
            store.add_preset(preset)?;
        }
        Ok(store)
    }

    fn allocate_id(&self) -> CredentialId {
        CredentialId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub(crate) fn handle(&self, name: &str) -> Option<Arc<PresetHandle>> {
        self.presets
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    /// Add a preset.  Becomes current if no preset is current yet.
    pub fn add_preset(&self, config: PresetConfig) -> Result<(), StoreError> {
        let name = config.name.trim().to_string();
        if name.is_empty() {
            return Err(StoreError::EmptyName);
        }
        let endpoint = config.endpoint();
        validate_endpoint(&name, &endpoint)?;

        let mut credentials: Vec<CredentialSlot> = Vec::with_capacity(config.api_keys.len());
        for key in config.api_keys {
            let secret = Secret::new(key.trim());
            if secret.expose().is_empty() {
                continue;
            }
            if credentials.iter().any(|c| c.secret == secret) {
                return Err(StoreError::DuplicateCredential(name));
            }
            credentials.push(CredentialSlot {
                id: self.allocate_id(),
                secret,
                breaker: CircuitBreaker::new(),
            });
        }

        let handle = Arc::new(PresetHandle {
            state: Mutex::new(PresetState {
                meta: PresetMeta {
                    name: name.clone(),
                    kind: config.kind,
                    endpoint,
                    model: config.model,
                },
                credentials,
                cursor: 0,
            }),
        });

        {
            let mut presets = self.presets.write().unwrap_or_else(|e| e.into_inner());
            if presets.contains_key(&name) {
                return Err(StoreError::DuplicatePreset(name));
            }
            presets.insert(name.clone(), handle);
        }

        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        if current.is_none() {
            *current = Some(name.clone());
        }
        tracing::info!(preset = %name, "preset added");
        Ok(())
    }

    /// Remove a preset.  In-flight leases keep their own handle.
    pub fn remove_preset(&self, name: &str) -> Result<(), StoreError> {
        let removed = self
            .presets
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name);
        if removed.is_none() {
            return Err(StoreError::PresetNotFound(name.to_string()));
        }

        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        if current.as_deref() == Some(name) {
            *current = None;
        }
        tracing::info!(preset = %name, "preset removed");
        Ok(())
    }

    pub fn rename_preset(&self, from: &str, to: &str) -> Result<(), StoreError> {
        let to = to.trim();
        if to.is_empty() {
            return Err(StoreError::EmptyName);
        }
        {
            let mut presets = self.presets.write().unwrap_or_else(|e| e.into_inner());
            if from == to {
                return if presets.contains_key(from) {
                    Ok(())
                } else {
                    Err(StoreError::PresetNotFound(from.to_string()))
                };
            }
            if presets.contains_key(to) {
                return Err(StoreError::DuplicatePreset(to.to_string()));
            }
            let handle = presets
                .remove(from)
                .ok_or_else(|| StoreError::PresetNotFound(from.to_string()))?;
            handle.lock().meta.name = to.to_string();
            presets.insert(to.to_string(), handle);
        }

        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        if current.as_deref() == Some(from) {
            *current = Some(to.to_string());
        }
        tracing::info!(from = %from, to = %to, "preset renamed");
        Ok(())
    }

    /// Append a credential to a preset's rotation.
    pub fn add_credential(
        &self,
        preset: &str,
        secret: impl Into<String>,
    ) -> Result<CredentialId, StoreError> {
        let handle = self
            .handle(preset)
            .ok_or_else(|| StoreError::PresetNotFound(preset.to_string()))?;
        let secret = Secret::new(secret.into().trim());
        if secret.expose().is_empty() {
            return Err(StoreError::EmptyCredential(preset.to_string()));
        }
        let mut state = handle.lock();
        if state.credentials.iter().any(|c| c.secret == secret) {
            return Err(StoreError::DuplicateCredential(preset.to_string()));
        }
        let id = self.allocate_id();
        state.credentials.push(CredentialSlot {
            id,
            secret,
            breaker: CircuitBreaker::new(),
        });
        tracing::info!(preset = %preset, credential = %id, "credential added");
        Ok(id)
    }

    /// Remove a credential.  A lease already holding it reports into the void.
    pub fn remove_credential(&self, preset: &str, id: CredentialId) -> Result<(), StoreError> {
        let handle = self
            .handle(preset)
            .ok_or_else(|| StoreError::PresetNotFound(preset.to_string()))?;
        let mut state = handle.lock();
        let index = state
            .credentials
            .iter()
            .position(|c| c.id == id)
            .ok_or_else(|| StoreError::CredentialNotFound {
                preset: preset.to_string(),
                id,
            })?;
        state.credentials.remove(index);
        if index < state.cursor {
            state.cursor -= 1;
        }
        if state.cursor >= state.credentials.len() {
            state.cursor = 0;
        }
        tracing::info!(preset = %preset, credential = %id, "credential removed");
        Ok(())
    }

    /// Snapshot of one preset.
    pub fn preset(&self, name: &str) -> Result<ConnectionPreset, StoreError> {
        let handle = self
            .handle(name)
            .ok_or_else(|| StoreError::PresetNotFound(name.to_string()))?;
        let state = handle.lock();
        Ok(ConnectionPreset {
            meta: state.meta.clone(),
            credentials: state
                .credentials
                .iter()
                .map(|c| CredentialInfo {
                    id: c.id,
                    masked: c.secret.masked(),
                    fingerprint: c.secret.fingerprint(),
                })
                .collect(),
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handle(name).is_some()
    }

    /// Preset names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .presets
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn set_current(&self, name: &str) -> Result<(), StoreError> {
        if !self.contains(name) {
            return Err(StoreError::PresetNotFound(name.to_string()));
        }
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Some(name.to_string());
        tracing::info!(preset = %name, "current preset switched");
        Ok(())
    }

    pub fn current(&self) -> Option<String> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

fn validate_endpoint(preset: &str, endpoint: &str) -> Result<(), StoreError> {
    let parsed = url::Url::parse(endpoint).map_err(|e| StoreError::InvalidEndpoint {
        preset: preset.to_string(),
        reason: e.to_string(),
    })?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(StoreError::InvalidEndpoint {
            preset: preset.to_string(),
            reason: format!("unsupported scheme {other}"),
        }),
    }
}

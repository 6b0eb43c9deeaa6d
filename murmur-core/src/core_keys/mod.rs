//! Local private-key storage, scoped per identity
//!
//! The key lives in a single fixed storage slot. Every record remembers the
//! identity it was stored for, and a lookup under any other identity behaves
//! exactly like an empty slot. Writing the slot is the provisioning flow's
//! job; the delivery core only reads it.

use crate::core_model::{Timestamp, UserId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

pub mod file_slot;
pub mod memory_slot;

pub use file_slot::FileKeySlot;
pub use memory_slot::MemoryKeySlot;

/// Key store errors
#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Decryption error: {0}")]
    Decryption(String),

    #[error("Invalid passphrase")]
    InvalidPassphrase,

    #[error("Empty key material")]
    EmptyKey,

    #[error("Other error: {0}")]
    Other(String),
}

pub type KeyResult<T> = Result<T, KeyStoreError>;

/// Opaque private key material (PEM text as issued by the server)
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct PrivateKey(String);

impl PrivateKey {
    pub fn new(material: impl Into<String>) -> Self {
        PrivateKey(material.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey(<redacted>)")
    }
}

/// The persisted record in the key slot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrivateKeyRecord {
    pub key: PrivateKey,
    pub owner_id: UserId,
    pub imported_at: Timestamp,
}

/// Backing storage for the single key slot
pub trait KeySlot: Send + Sync {
    fn load(&self) -> KeyResult<Option<PrivateKeyRecord>>;

    /// Overwrites whatever the slot holds
    fn save(&self, record: &PrivateKeyRecord) -> KeyResult<()>;

    fn clear(&self) -> KeyResult<()>;
}

/// Outcome of the start-up key check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    /// A key for this identity was already stored
    Present,
    /// A server-issued temporary key was imported just now
    Imported,
    /// No usable key; the user has to re-provision
    Missing,
}

impl KeyStatus {
    pub fn is_usable(&self) -> bool {
        !matches!(self, KeyStatus::Missing)
    }
}

/// Slot contents as last read or written; outer `None` until first loaded
type CachedRecord = Option<Option<PrivateKeyRecord>>;

/// Identity-scoped view over a key slot.
///
/// The slot is read once and kept in memory; clones share the cached record,
/// and writes through any clone update it. `reload` picks up changes made to
/// the slot outside this process.
#[derive(Clone)]
pub struct KeyStore {
    slot: Arc<dyn KeySlot>,
    cache: Arc<RwLock<CachedRecord>>,
}

impl KeyStore {
    pub fn new(slot: Arc<dyn KeySlot>) -> Self {
        Self {
            slot,
            cache: Arc::new(RwLock::new(None)),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryKeySlot::new()))
    }

    pub fn store_private_key(&self, key: PrivateKey, owner: &UserId) -> KeyResult<()> {
        if key.is_empty() {
            return Err(KeyStoreError::EmptyKey);
        }
        let record = PrivateKeyRecord {
            key,
            owner_id: owner.clone(),
            imported_at: Timestamp::now(),
        };
        self.slot.save(&record)?;
        self.set_cached(Some(record));
        info!(user_id = %owner, "Private key stored");
        Ok(())
    }

    /// Key for `owner`, or `None` when the slot is empty, unreadable or
    /// belongs to someone else.
    pub fn get_private_key(&self, owner: &UserId) -> Option<PrivateKey> {
        match self.record() {
            Some(record) if &record.owner_id == owner => Some(record.key),
            Some(record) => {
                debug!(
                    requested = %owner,
                    stored_for = %record.owner_id,
                    "Private key belongs to a different user"
                );
                None
            }
            None => {
                debug!(user_id = %owner, "No private key in storage");
                None
            }
        }
    }

    pub fn has_private_key(&self, owner: &UserId) -> bool {
        self.get_private_key(owner).is_some()
    }

    /// `get_private_key` for async callers; a cold cache is filled on the
    /// blocking pool
    pub async fn private_key(&self, owner: &UserId) -> Option<PrivateKey> {
        if self.is_loaded() {
            return self.get_private_key(owner);
        }
        let store = self.clone();
        let owner = owner.clone();
        match tokio::task::spawn_blocking(move || store.get_private_key(&owner)).await {
            Ok(key) => key,
            Err(e) => {
                error!(error = %e, "Key slot read task failed");
                None
            }
        }
    }

    pub fn clear_private_key(&self) -> KeyResult<()> {
        self.slot.clear()?;
        self.set_cached(None);
        Ok(())
    }

    /// Re-read the slot. An unreadable slot counts as empty until the next reload.
    pub fn reload(&self) -> Option<PrivateKeyRecord> {
        let record = match self.slot.load() {
            Ok(record) => record,
            Err(e) => {
                error!(error = %e, "Failed to read private key");
                None
            }
        };
        self.set_cached(record.clone());
        record
    }

    /// `reload` on the blocking pool
    pub async fn reload_async(&self) {
        let store = self.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || store.reload()).await {
            error!(error = %e, "Key slot reload task failed");
        }
    }

    fn is_loaded(&self) -> bool {
        self.cache.read().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    fn record(&self) -> Option<PrivateKeyRecord> {
        if let Some(cached) = self.cache.read().unwrap_or_else(PoisonError::into_inner).as_ref() {
            return cached.clone();
        }
        self.reload()
    }

    fn set_cached(&self, record: Option<PrivateKeyRecord>) {
        *self.cache.write().unwrap_or_else(PoisonError::into_inner) = Some(record);
    }

    /// One-time import of the temporary key handed out at registration/login
    pub fn import_temporary_private_key(&self, owner: &UserId, temp_key: &str) -> KeyResult<()> {
        if temp_key.trim().is_empty() {
            warn!(user_id = %owner, "No temporary private key provided");
            return Err(KeyStoreError::EmptyKey);
        }
        self.store_private_key(PrivateKey::new(temp_key), owner)
    }

    /// Make sure a key for `owner` is available, importing `temp_key` if needed
    pub fn ensure_key(&self, owner: &UserId, temp_key: Option<&str>) -> KeyStatus {
        if self.has_private_key(owner) {
            return KeyStatus::Present;
        }
        match temp_key {
            Some(temp) => match self.import_temporary_private_key(owner, temp) {
                Ok(()) => {
                    info!(user_id = %owner, "Imported temporary private key to local storage");
                    KeyStatus::Imported
                }
                Err(e) => {
                    error!(user_id = %owner, error = %e, "Failed to import private key");
                    KeyStatus::Missing
                }
            },
            None => {
                warn!(user_id = %owner, "No private key available");
                KeyStatus::Missing
            }
        }
    }
}

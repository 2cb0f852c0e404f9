//! RoomAgent State
//!
//! Persisted agent state blobs keyed by `(room_id, instance_id)`. Backends
//! store ciphertext only; [`EncryptedStateStore`] seals and opens blobs through
//! a [`StateCipher`] on the way in and out.

pub mod cipher;
pub mod memory;
pub mod sqlite;

use std::fmt;
use std::sync::Arc;

use roomagent_crypto::EncryptError;
use thiserror::Error;
use tracing::debug;
use zeroize::Zeroizing;

pub use cipher::{SeedCipher, StateCipher};
pub use memory::MemoryStateStore;
pub use sqlite::SqliteStateStore;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("encryption error: {0}")]
    Crypto(#[from] EncryptError),
    #[error("state store lock poisoned")]
    Poisoned,
}

/// Exclusive storage slot of one agent instance in one room.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateKey {
    pub room_id: String,
    pub instance_id: String,
}

impl StateKey {
    pub fn new(room_id: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            instance_id: instance_id.into(),
        }
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.room_id, self.instance_id)
    }
}

/// Raw blob persistence. Implementations never see plaintext.
pub trait StateStore: Send + Sync {
    fn get(&self, key: &StateKey) -> Result<Option<Vec<u8>>, StorageError>;
    fn put(&self, key: &StateKey, blob: &[u8]) -> Result<(), StorageError>;
    /// Removing an absent key is not an error.
    fn delete(&self, key: &StateKey) -> Result<(), StorageError>;
}

/// Encrypting front for a [`StateStore`].
#[derive(Clone)]
pub struct EncryptedStateStore {
    backend: Arc<dyn StateStore>,
    cipher: Arc<dyn StateCipher>,
}

impl EncryptedStateStore {
    pub fn new(backend: Arc<dyn StateStore>, cipher: Arc<dyn StateCipher>) -> Self {
        Self { backend, cipher }
    }

    /// Decrypted blob for `key`, if one was written.
    pub fn load(&self, key: &StateKey) -> Result<Option<Zeroizing<Vec<u8>>>, StorageError> {
        match self.backend.get(key)? {
            Some(sealed) => {
                let plain = self.cipher.open(key, &sealed)?;
                debug!(key = %key, len = plain.len(), "loaded agent state");
                Ok(Some(plain))
            }
            None => Ok(None),
        }
    }

    pub fn save(&self, key: &StateKey, plaintext: &[u8]) -> Result<(), StorageError> {
        let sealed = self.cipher.seal(key, plaintext)?;
        self.backend.put(key, &sealed)?;
        debug!(key = %key, len = plaintext.len(), "saved agent state");
        Ok(())
    }

    pub fn remove(&self, key: &StateKey) -> Result<(), StorageError> {
        self.backend.delete(key)
    }
}

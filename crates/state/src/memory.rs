use std::collections::HashMap;
use std::sync::Mutex;

use crate::{StateKey, StateStore, StorageError};

/// In-process backend for tests and ephemeral hosts.
#[derive(Default)]
pub struct MemoryStateStore {
    blobs: Mutex<HashMap<StateKey, Vec<u8>>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StateStore for MemoryStateStore {
    fn get(&self, key: &StateKey) -> Result<Option<Vec<u8>>, StorageError> {
        let blobs = self.blobs.lock().map_err(|_| StorageError::Poisoned)?;
        Ok(blobs.get(key).cloned())
    }

    fn put(&self, key: &StateKey, blob: &[u8]) -> Result<(), StorageError> {
        let mut blobs = self.blobs.lock().map_err(|_| StorageError::Poisoned)?;
        blobs.insert(key.clone(), blob.to_vec());
        Ok(())
    }

    fn delete(&self, key: &StateKey) -> Result<(), StorageError> {
        let mut blobs = self.blobs.lock().map_err(|_| StorageError::Poisoned)?;
        blobs.remove(key);
        Ok(())
    }
}

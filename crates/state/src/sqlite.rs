use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use crate::{StateKey, StateStore, StorageError};

/// SQLite-backed blob store. One row per `(room_id, instance_id)`.
pub struct SqliteStateStore {
    db: Mutex<Connection>,
}

impl SqliteStateStore {
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            // Surfaced by Connection::open if it matters.
            let _ = std::fs::create_dir_all(parent);
        }
        Self::new(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::new(Connection::open_in_memory()?)
    }

    pub fn new(db: Connection) -> Result<Self, StorageError> {
        db.execute_batch(
            "CREATE TABLE IF NOT EXISTS agent_state (
                room_id TEXT NOT NULL,
                instance_id TEXT NOT NULL,
                blob BLOB NOT NULL,
                updated_at INTEGER NOT NULL DEFAULT (strftime('%s','now')),
                PRIMARY KEY (room_id, instance_id)
            );",
        )?;
        Ok(Self { db: Mutex::new(db) })
    }
}

impl StateStore for SqliteStateStore {
    fn get(&self, key: &StateKey) -> Result<Option<Vec<u8>>, StorageError> {
        let db = self.db.lock().map_err(|_| StorageError::Poisoned)?;
        let blob = db
            .query_row(
                "SELECT blob FROM agent_state WHERE room_id = ?1 AND instance_id = ?2",
                params![key.room_id, key.instance_id],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(blob)
    }

    fn put(&self, key: &StateKey, blob: &[u8]) -> Result<(), StorageError> {
        let db = self.db.lock().map_err(|_| StorageError::Poisoned)?;
        db.execute(
            "INSERT INTO agent_state (room_id, instance_id, blob) VALUES (?1, ?2, ?3)
             ON CONFLICT (room_id, instance_id)
             DO UPDATE SET blob = excluded.blob, updated_at = strftime('%s','now')",
            params![key.room_id, key.instance_id, blob],
        )?;
        Ok(())
    }

    fn delete(&self, key: &StateKey) -> Result<(), StorageError> {
        let db = self.db.lock().map_err(|_| StorageError::Poisoned)?;
        db.execute(
            "DELETE FROM agent_state WHERE room_id = ?1 AND instance_id = ?2",
            params![key.room_id, key.instance_id],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_overwrite() {
        let store = SqliteStateStore::open_in_memory().unwrap();
        let key = StateKey::new("room", "agent");
        store.put(&key, b"v1").unwrap();
        store.put(&key, b"v2").unwrap();
        assert_eq!(store.get(&key).unwrap().unwrap(), b"v2");
    }

    #[test]
    fn test_keys_are_independent() {
        let store = SqliteStateStore::open_in_memory().unwrap();
        store.put(&StateKey::new("room-a", "agent"), b"a").unwrap();
        store.put(&StateKey::new("room-b", "agent"), b"b").unwrap();
        assert_eq!(store.get(&StateKey::new("room-a", "agent")).unwrap().unwrap(), b"a");
        assert_eq!(store.get(&StateKey::new("room-b", "agent")).unwrap().unwrap(), b"b");
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("agents.sqlite");
        let key = StateKey::new("room", "agent");
        {
            let store = SqliteStateStore::open(&path).unwrap();
            store.put(&key, &[1, 2, 3]).unwrap();
        }
        let store = SqliteStateStore::open(&path).unwrap();
        assert_eq!(store.get(&key).unwrap().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_delete() {
        let store = SqliteStateStore::open_in_memory().unwrap();
        let key = StateKey::new("room", "agent");
        store.put(&key, b"x").unwrap();
        store.delete(&key).unwrap();
        assert!(store.get(&key).unwrap().is_none());
    }
}

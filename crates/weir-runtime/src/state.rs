//! Operator state persistence.
//!
//! The runtime persists operator state under well-known keys and restores it
//! on start. Two backends implement the same [`StateStore`] trait: an
//! in-memory map for rules that run at-most-once, and a durable redb store
//! for at-least-once and exactly-once rules. The runtime never selects a
//! backend itself; it is handed one during context composition.

use crate::tuple::Tuple;
use redb::{Database, TableDefinition};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};
use weir_core::Qos;

/// Window operator state: buffered inputs.
pub const WINDOW_INPUTS_KEY: &str = "$$windowInputs";
/// Window operator state: last trigger time in milliseconds.
pub const TRIGGER_TIME_KEY: &str = "$$triggerTime";
/// Window operator state: tuples seen since the last count emission.
pub const MSG_COUNT_KEY: &str = "$$msgCount";
/// Coordinator state: ids of completed checkpoints.
pub const CHECKPOINT_LIST_KEY: &str = "checkpoints";

const STATE_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("weir_state");

/// Error type for state store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// A persisted value. Opaque to the store, typed to the runtime: each
/// well-known key maps to exactly one variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StateValue {
    /// Buffered window inputs.
    Tuples(Vec<Tuple>),
    /// A millisecond timestamp or other signed scalar.
    Int(i64),
    /// A message counter.
    Count(u64),
    /// Completed checkpoint ids.
    IntList(Vec<i64>),
    /// Opaque operator-local state.
    Bytes(Vec<u8>),
}

/// Trait for state storage backends.
pub trait StateStore: Send + Sync {
    fn put(&self, key: &str, value: StateValue) -> Result<(), StoreError>;

    fn get(&self, key: &str) -> Result<Option<StateValue>, StoreError>;

    fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Flush pending writes to durable media. No-op for volatile backends.
    fn flush(&self) -> Result<(), StoreError>;
}

/// In-memory state store. Lost on restart, so only suitable for
/// at-most-once rules and tests.
#[derive(Default)]
pub struct MemoryStore {
    data: RwLock<HashMap<String, StateValue>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStore {
    fn put(&self, key: &str, value: StateValue) -> Result<(), StoreError> {
        let mut data = self
            .data
            .write()
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        data.insert(key.to_string(), value);
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<StateValue>, StoreError> {
        let data = self
            .data
            .read()
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        Ok(data.get(key).cloned())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut data = self
            .data
            .write()
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        data.remove(key);
        Ok(())
    }

    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Durable state store backed by redb, one database file per rule.
/// Values are bincode-encoded [`StateValue`]s in a single table.
pub struct RedbStore {
    db: Database,
}

impl RedbStore {
    /// Open or create the store at the given path, eagerly creating the
    /// state table so reads never observe a missing table.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = Database::create(path).map_err(|e| StoreError::Storage(e.to_string()))?;
        let txn = db
            .begin_write()
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        txn.open_table(STATE_TABLE)
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        txn.commit().map_err(|e| StoreError::Storage(e.to_string()))?;
        info!("opened redb state store");
        Ok(Self { db })
    }
}

impl StateStore for RedbStore {
    fn put(&self, key: &str, value: StateValue) -> Result<(), StoreError> {
        let bytes =
            bincode::serialize(&value).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let txn = self
            .db
            .begin_write()
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        {
            let mut table = txn
                .open_table(STATE_TABLE)
                .map_err(|e| StoreError::Storage(e.to_string()))?;
            table
                .insert(key, bytes.as_slice())
                .map_err(|e| StoreError::Storage(e.to_string()))?;
        }
        txn.commit().map_err(|e| StoreError::Storage(e.to_string()))?;
        debug!(key, len = bytes.len(), "persisted state");
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<StateValue>, StoreError> {
        let txn = self
            .db
            .begin_read()
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        let table = txn
            .open_table(STATE_TABLE)
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        match table
            .get(key)
            .map_err(|e| StoreError::Storage(e.to_string()))?
        {
            Some(guard) => {
                let value = bincode::deserialize(guard.value())
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        let txn = self
            .db
            .begin_write()
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        {
            let mut table = txn
                .open_table(STATE_TABLE)
                .map_err(|e| StoreError::Storage(e.to_string()))?;
            table
                .remove(key)
                .map_err(|e| StoreError::Storage(e.to_string()))?;
        }
        txn.commit().map_err(|e| StoreError::Storage(e.to_string()))
    }

    fn flush(&self) -> Result<(), StoreError> {
        // redb commits are durable; nothing further to flush.
        Ok(())
    }
}

/// Create the state store for a rule: volatile below at-least-once,
/// durable otherwise.
pub fn create_store(
    rule_id: &str,
    qos: Qos,
    dir: &Path,
) -> Result<Arc<dyn StateStore>, StoreError> {
    if qos >= Qos::AtLeastOnce {
        std::fs::create_dir_all(dir).map_err(|e| StoreError::Storage(e.to_string()))?;
        let path = dir.join(format!("{rule_id}.redb"));
        Ok(Arc::new(RedbStore::open(path)?))
    } else {
        Ok(Arc::new(MemoryStore::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tuples() -> Vec<Tuple> {
        vec![
            Tuple::new_at("demo", 1).with_field("a", 1i64),
            Tuple::new_at("demo", 3).with_field("a", 2i64),
        ]
    }

    #[test]
    fn test_memory_store_round_trip() {
        let store = MemoryStore::new();
        store
            .put(TRIGGER_TIME_KEY, StateValue::Int(1_000))
            .unwrap();
        store.put(MSG_COUNT_KEY, StateValue::Count(3)).unwrap();

        assert_eq!(
            store.get(TRIGGER_TIME_KEY).unwrap(),
            Some(StateValue::Int(1_000))
        );
        assert_eq!(store.get(MSG_COUNT_KEY).unwrap(), Some(StateValue::Count(3)));
        assert_eq!(store.get("missing").unwrap(), None);

        store.delete(MSG_COUNT_KEY).unwrap();
        assert_eq!(store.get(MSG_COUNT_KEY).unwrap(), None);
    }

    #[test]
    fn test_state_value_bincode_identity() {
        let value = StateValue::Tuples(sample_tuples());
        let bytes = bincode::serialize(&value).unwrap();
        let restored: StateValue = bincode::deserialize(&bytes).unwrap();
        assert_eq!(restored, value);
    }

    #[test]
    fn test_redb_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.redb");
        let store = RedbStore::open(&path).unwrap();

        store
            .put(WINDOW_INPUTS_KEY, StateValue::Tuples(sample_tuples()))
            .unwrap();
        assert_eq!(
            store.get(WINDOW_INPUTS_KEY).unwrap(),
            Some(StateValue::Tuples(sample_tuples()))
        );

        store.delete(WINDOW_INPUTS_KEY).unwrap();
        assert_eq!(store.get(WINDOW_INPUTS_KEY).unwrap(), None);
    }

    #[test]
    fn test_redb_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.redb");
        {
            let store = RedbStore::open(&path).unwrap();
            store
                .put(CHECKPOINT_LIST_KEY, StateValue::IntList(vec![1, 2, 3]))
                .unwrap();
        }
        let store = RedbStore::open(&path).unwrap();
        assert_eq!(
            store.get(CHECKPOINT_LIST_KEY).unwrap(),
            Some(StateValue::IntList(vec![1, 2, 3]))
        );
    }

    #[test]
    fn test_create_store_selects_backend() {
        let dir = tempfile::tempdir().unwrap();
        // At-most-once gets a memory store: state does not survive the Arc.
        let store = create_store("r1", Qos::AtMostOnce, dir.path()).unwrap();
        store.put("k", StateValue::Int(1)).unwrap();
        assert!(!dir.path().join("r1.redb").exists());

        let store = create_store("r2", Qos::ExactlyOnce, dir.path()).unwrap();
        store.put("k", StateValue::Int(1)).unwrap();
        assert!(dir.path().join("r2.redb").exists());
    }
}

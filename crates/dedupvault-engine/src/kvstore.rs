//! Embedded key-value store backing the record store.
//!
//! `MemoryKvStore` keeps everything in a BTreeMap; `PersistentKvStore`
//! (see `persistent`) adds a write-ahead log and checkpoints on top of the
//! same layout.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

/// Key type for the KV store.
pub type Key = Vec<u8>;
/// Value type for the KV store.
pub type Value = Vec<u8>;
/// A key-value pair.
pub type KvPair = (Key, Value);

/// Errors raised by a KV backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Underlying file I/O failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// A value could not be encoded or decoded.
    #[error("encoding error: {0}")]
    Encoding(String),
    /// Persisted state is inconsistent.
    #[error("corrupt store: {0}")]
    Corrupt(String),
}

impl From<bincode::Error> for StoreError {
    fn from(e: bincode::Error) -> Self {
        StoreError::Encoding(e.to_string())
    }
}

/// Key-value store trait for record persistence.
///
/// Implementations must apply `write_batch` atomically: readers and crash
/// recovery observe either every operation of a batch or none of them.
pub trait KvStore: Send + Sync {
    /// Get a value by key. Returns None if the key doesn't exist.
    fn get(&self, key: &[u8]) -> Result<Option<Value>, StoreError>;

    /// Put a key-value pair. Overwrites any existing value.
    fn put(&self, key: Key, value: Value) -> Result<(), StoreError> {
        self.write_batch(vec![BatchOp::Put { key, value }])
    }

    /// Delete a key. Returns Ok(()) even if the key didn't exist.
    fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        self.write_batch(vec![BatchOp::Delete { key: key.to_vec() }])
    }

    /// Scan all keys with the given prefix, returning (key, value) pairs in sorted order.
    ///
    /// The scan observes a single consistent state of the store.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<KvPair>, StoreError>;

    /// Returns true if the key exists.
    fn contains_key(&self, key: &[u8]) -> Result<bool, StoreError> {
        Ok(self.get(key)?.is_some())
    }

    /// Atomically write a batch of operations (puts and deletes).
    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), StoreError>;

    /// Compact durable state. No-op for volatile backends.
    fn checkpoint(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// A single operation in a write batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    /// Put a key-value pair.
    Put {
        /// The key to insert or update.
        key: Vec<u8>,
        /// The value to store.
        value: Vec<u8>,
    },
    /// Delete a key.
    Delete {
        /// The key to delete.
        key: Vec<u8>,
    },
}

pub(crate) fn apply_ops(data: &mut BTreeMap<Vec<u8>, Vec<u8>>, ops: Vec<BatchOp>) {
    for op in ops {
        match op {
            BatchOp::Put { key, value } => {
                data.insert(key, value);
            }
            BatchOp::Delete { key } => {
                data.remove(&key);
            }
        }
    }
}

pub(crate) fn scan(data: &BTreeMap<Vec<u8>, Vec<u8>>, prefix: &[u8]) -> Vec<KvPair> {
    data.range::<Vec<u8>, _>(prefix.to_vec()..)
        .take_while(|(k, _)| k.starts_with(prefix))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// In-memory KV store backed by a BTreeMap. Thread-safe via RwLock.
///
/// Does not persist data across restarts.
#[derive(Clone, Default)]
pub struct MemoryKvStore {
    data: Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryKvStore {
    /// Creates a new empty in-memory KV store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently stored.
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// True if no keys are stored.
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &[u8]) -> Result<Option<Value>, StoreError> {
        Ok(self.data.read().get(key).cloned())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<KvPair>, StoreError> {
        Ok(scan(&self.data.read(), prefix))
    }

    fn contains_key(&self, key: &[u8]) -> Result<bool, StoreError> {
        Ok(self.data.read().contains_key(key))
    }

    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), StoreError> {
        apply_ops(&mut self.data.write(), ops);
        Ok(())
    }
}

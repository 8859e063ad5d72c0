//! Key-value store abstraction backing the dedup index.

use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::error::{DedupError, Result};

/// Key type for the KV store.
pub type Key = Vec<u8>;
/// Value type for the KV store.
pub type Value = Vec<u8>;
/// A key-value pair.
pub type KvPair = (Key, Value);

/// Key-value store trait.
///
/// The dedup index lays its namespaces out as key prefixes on top of this,
/// so a backend only needs ordered keys and prefix scans.
pub trait KvStore: Send + Sync {
    /// Get a value by key. Returns None if the key doesn't exist.
    fn get(&self, key: &[u8]) -> Result<Option<Value>>;

    /// Put a key-value pair. Overwrites any existing value.
    fn put(&self, key: Key, value: Value) -> Result<()>;

    /// Delete a key. Returns Ok(()) even if the key didn't exist.
    fn delete(&self, key: &[u8]) -> Result<()>;

    /// Scan all keys with the given prefix, in sorted order.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<KvPair>>;

    /// Returns true if the key exists.
    fn contains_key(&self, key: &[u8]) -> Result<bool>;

    /// Apply a batch of puts and deletes.
    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<()>;

    /// Count keys with the given prefix.
    fn count_prefix(&self, prefix: &[u8]) -> Result<u64> {
        Ok(self.scan_prefix(prefix)?.len() as u64)
    }

    /// Delete every key with the given prefix, returning how many went.
    fn delete_prefix(&self, prefix: &[u8]) -> Result<u64> {
        let ops: Vec<BatchOp> = self
            .scan_prefix(prefix)?
            .into_iter()
            .map(|(key, _)| BatchOp::Delete { key })
            .collect();
        let n = ops.len() as u64;
        if n > 0 {
            self.write_batch(ops)?;
        }
        Ok(n)
    }

    /// Check the backend is still reachable.
    fn ping(&self) -> Result<()> {
        Ok(())
    }

    /// Make all writes so far durable.
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// A single operation in a write batch.
#[derive(Debug, Clone)]
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

pub(crate) fn lock_err<E: std::fmt::Display>(e: E) -> DedupError {
    DedupError::Store(e.to_string())
}

pub(crate) fn prefix_range<'a>(
    data: &'a BTreeMap<Vec<u8>, Vec<u8>>,
    prefix: &'a [u8],
) -> impl Iterator<Item = (&'a Vec<u8>, &'a Vec<u8>)> + 'a {
    data.range::<Vec<u8>, _>(prefix.to_vec()..)
        .take_while(move |(k, _)| k.starts_with(prefix))
}

/// In-memory KV store backed by a BTreeMap. Nothing survives a disconnect.
#[derive(Default)]
pub struct MemoryKvStore {
    data: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryKvStore {
    /// Creates a new empty in-memory KV store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &[u8]) -> Result<Option<Value>> {
        let data = self.data.read().map_err(lock_err)?;
        Ok(data.get(key).cloned())
    }

    fn put(&self, key: Key, value: Value) -> Result<()> {
        let mut data = self.data.write().map_err(lock_err)?;
        data.insert(key, value);
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        let mut data = self.data.write().map_err(lock_err)?;
        data.remove(key);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<KvPair>> {
        let data = self.data.read().map_err(lock_err)?;
        let pairs = prefix_range(&data, prefix)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(pairs)
    }

    fn contains_key(&self, key: &[u8]) -> Result<bool> {
        let data = self.data.read().map_err(lock_err)?;
        Ok(data.contains_key(key))
    }

    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<()> {
        let mut data = self.data.write().map_err(lock_err)?;
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
        Ok(())
    }

    fn count_prefix(&self, prefix: &[u8]) -> Result<u64> {
        let data = self.data.read().map_err(lock_err)?;
        let n = prefix_range(&data, prefix).count();
        Ok(n as u64)
    }
}

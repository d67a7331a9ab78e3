//! Ordered key-value backend for the changelog.
//!
//! The changelog never reaches below this trait; production deployments can
//! slot in a durable store while tests use the in-memory implementation.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, RwLock};

use crate::error::ChangelogError;

/// Key type for the log store.
pub type Key = Vec<u8>;
/// Value type for the log store.
pub type Value = Vec<u8>;
/// A key-value pair.
pub type KvPair = (Key, Value);

/// Storage backend trait for one changelog.
///
/// Keys are returned in byte order, which for changelog entries equals CSN
/// order because entry keys are fixed-width hex CSN strings.
pub trait LogStore: Send + Sync {
    /// Get a value by key. Returns None if the key doesn't exist.
    fn get(&self, key: &[u8]) -> Result<Option<Value>, ChangelogError>;

    /// Put a key-value pair. Overwrites any existing value.
    fn put(&self, key: Key, value: Value) -> Result<(), ChangelogError>;

    /// Delete a key. Returns Ok(()) even if the key didn't exist.
    fn delete(&self, key: &[u8]) -> Result<(), ChangelogError>;

    /// Scan all keys with the given prefix in sorted order.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<KvPair>, ChangelogError>;

    /// Scan a range of keys [start, end) in sorted order.
    fn scan_range(&self, start: &[u8], end: &[u8]) -> Result<Vec<KvPair>, ChangelogError>;

    /// Returns true if the key exists.
    fn contains_key(&self, key: &[u8]) -> Result<bool, ChangelogError>;

    /// Atomically apply a batch of puts and deletes.
    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), ChangelogError>;
}

/// A single operation in a write batch.
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

/// In-memory log store backed by a BTreeMap. Thread-safe via RwLock.
///
/// Does not persist across restarts; restart-resume behavior is exercised in
/// tests by handing the same store to a new changelog handle.
pub struct MemoryLogStore {
    data: Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryLogStore {
    /// Creates a new empty in-memory log store.
    pub fn new() -> Self {
        Self {
            data: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }
}

impl Default for MemoryLogStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LogStore for MemoryLogStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, ChangelogError> {
        let data = self
            .data
            .read()
            .map_err(|e| ChangelogError::DbError(e.to_string()))?;
        Ok(data.get(key).cloned())
    }

    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), ChangelogError> {
        let mut data = self
            .data
            .write()
            .map_err(|e| ChangelogError::DbError(e.to_string()))?;
        data.insert(key, value);
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), ChangelogError> {
        let mut data = self
            .data
            .write()
            .map_err(|e| ChangelogError::DbError(e.to_string()))?;
        data.remove(key);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<KvPair>, ChangelogError> {
        let data = self
            .data
            .read()
            .map_err(|e| ChangelogError::DbError(e.to_string()))?;
        let mut result = Vec::new();
        for (k, v) in data.range::<Vec<u8>, _>(prefix.to_vec()..) {
            if !k.starts_with(prefix) {
                break;
            }
            result.push((k.clone(), v.clone()));
        }
        Ok(result)
    }

    fn scan_range(&self, start: &[u8], end: &[u8]) -> Result<Vec<KvPair>, ChangelogError> {
        let data = self
            .data
            .read()
            .map_err(|e| ChangelogError::DbError(e.to_string()))?;
        let result: Vec<_> = data
            .range::<Vec<u8>, _>((
                Bound::Included(start.to_vec()),
                Bound::Excluded(end.to_vec()),
            ))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(result)
    }

    fn contains_key(&self, key: &[u8]) -> Result<bool, ChangelogError> {
        let data = self
            .data
            .read()
            .map_err(|e| ChangelogError::DbError(e.to_string()))?;
        Ok(data.contains_key(key))
    }

    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), ChangelogError> {
        let mut data = self
            .data
            .write()
            .map_err(|e| ChangelogError::DbError(e.to_string()))?;
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
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_delete() {
        let store = MemoryLogStore::new();
        store.put(b"k1".to_vec(), b"v1".to_vec()).unwrap();
        assert_eq!(store.get(b"k1").unwrap(), Some(b"v1".to_vec()));
        assert!(store.contains_key(b"k1").unwrap());
        store.delete(b"k1").unwrap();
        assert_eq!(store.get(b"k1").unwrap(), None);
    }

    #[test]
    fn test_scan_prefix_sorted() {
        let store = MemoryLogStore::new();
        store.put(b"a2".to_vec(), b"2".to_vec()).unwrap();
        store.put(b"a1".to_vec(), b"1".to_vec()).unwrap();
        store.put(b"b1".to_vec(), b"3".to_vec()).unwrap();

        let result = store.scan_prefix(b"a").unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].0, b"a1");
        assert_eq!(result[1].0, b"a2");
    }

    #[test]
    fn test_scan_range_excludes_end() {
        let store = MemoryLogStore::new();
        for k in [b"a", b"b", b"c", b"d"] {
            store.put(k.to_vec(), b"x".to_vec()).unwrap();
        }
        let result = store.scan_range(b"b", b"d").unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].0, b"b");
        assert_eq!(result[1].0, b"c");
    }

    #[test]
    fn test_write_batch() {
        let store = MemoryLogStore::new();
        store.put(b"gone".to_vec(), b"x".to_vec()).unwrap();
        store
            .write_batch(vec![
                BatchOp::Put {
                    key: b"new".to_vec(),
                    value: b"y".to_vec(),
                },
                BatchOp::Delete {
                    key: b"gone".to_vec(),
                },
            ])
            .unwrap();
        assert_eq!(store.get(b"new").unwrap(), Some(b"y".to_vec()));
        assert_eq!(store.get(b"gone").unwrap(), None);
    }
}

//! Local indexes of watched objects, keyed by identity key.
//!
//! Each index has exactly one [`IndexWriter`], owned by the watch loop of its
//! resource kind, and any number of [`IndexReader`]s used by the snapshot
//! builder. Iteration is ordered by key so rebuilds list objects in the same
//! order every time.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

/// Create an empty index and its writer/reader halves
pub fn resource_index<K>() -> (IndexWriter<K>, IndexReader<K>) {
    let inner = Arc::new(RwLock::new(BTreeMap::new()));
    (
        IndexWriter {
            inner: inner.clone(),
        },
        IndexReader { inner },
    )
}

/// Write half of a resource index. Not cloneable.
pub struct IndexWriter<K> {
    inner: Arc<RwLock<BTreeMap<String, K>>>,
}

impl<K> IndexWriter<K> {
    /// Store `obj` under `key`, returning the value it replaced
    pub fn insert(&mut self, key: String, obj: K) -> Option<K> {
        self.inner.write().insert(key, obj)
    }

    /// Remove the object stored under `key`
    pub fn remove(&mut self, key: &str) -> Option<K> {
        self.inner.write().remove(key)
    }
}

/// Read half of a resource index.
pub struct IndexReader<K> {
    inner: Arc<RwLock<BTreeMap<String, K>>>,
}

impl<K> Clone for IndexReader<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K: Clone> IndexReader<K> {
    /// Every indexed object paired with its key, in key order
    pub fn list(&self) -> Vec<(String, K)> {
        self.inner
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// The object stored under `key`
    pub fn get(&self, key: &str) -> Option<K> {
        self.inner.read().get(key).cloned()
    }
}

impl<K> IndexReader<K> {
    /// Number of indexed objects
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// Whether the index is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

//! Content-addressed result cache.
//!
//! Maps node [`Fingerprint`]s to computed tensors for the lifetime of a merge
//! session. The cache is shared between worker threads: lookups take a read
//! lock, inserts a write lock, and an insert for a fingerprint that is already
//! present keeps the existing entry. Two threads racing on the same miss both
//! compute, but every caller ends up holding the first stored value.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::debug;

use crate::{Fingerprint, Tensor};

/// Snapshot of cache usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Stored entries.
    pub entries: usize,
    /// Bytes held by stored tensors.
    pub bytes: usize,
    /// Successful lookups since creation or the last clear.
    pub hits: u64,
    /// Failed lookups since creation or the last clear.
    pub misses: u64,
}

/// Session-wide store of evaluated tensors keyed by fingerprint.
#[derive(Debug, Default)]
pub struct ResultCache {
    entries: RwLock<HashMap<Fingerprint, Tensor>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResultCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a computed tensor.
    pub fn lookup(&self, fingerprint: &Fingerprint) -> Option<Tensor> {
        let found = self.entries.read().get(fingerprint).cloned();
        let counter = if found.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    /// Store a computed tensor and return the value now held for `fingerprint`.
    ///
    /// Existing entries are never replaced.
    pub fn insert(&self, fingerprint: Fingerprint, tensor: Tensor) -> Tensor {
        self.entries
            .write()
            .entry(fingerprint)
            .or_insert(tensor)
            .clone()
    }

    /// Whether a fingerprint is stored.
    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.entries.read().contains_key(fingerprint)
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the cache holds nothing.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Drop every entry and reset counters, ending the session.
    pub fn clear(&self) {
        let mut entries = self.entries.write();
        debug!("Clearing result cache ({} entries)", entries.len());
        entries.clear();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }

    /// Current usage.
    pub fn stats(&self) -> CacheStats {
        let entries = self.entries.read();
        CacheStats {
            entries: entries.len(),
            bytes: entries.values().map(Tensor::size_in_bytes).sum(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MergeGraph;
    use std::sync::Arc;

    fn prints(n: usize) -> Vec<Fingerprint> {
        let mut graph = MergeGraph::new();
        (0..n)
            .map(|i| {
                let id = graph.load(format!("w{}", i), "a").unwrap();
                graph.fingerprint(id).unwrap()
            })
            .collect()
    }

    #[test]
    fn test_lookup_and_insert() {
        let cache = ResultCache::new();
        let key = prints(1)[0];

        assert!(cache.lookup(&key).is_none());
        cache.insert(key, Tensor::from_values(&[1.0, 2.0]));
        assert_eq!(cache.lookup(&key).unwrap().to_vec(), vec![1.0, 2.0]);

        let stats = cache.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.bytes, 8);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_insert_never_overwrites() {
        let cache = ResultCache::new();
        let key = prints(1)[0];

        let first = cache.insert(key, Tensor::from_values(&[1.0]));
        let second = cache.insert(key, Tensor::from_values(&[9.0]));

        assert_eq!(first.to_vec(), vec![1.0]);
        assert_eq!(second.to_vec(), vec![1.0]);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_clear() {
        let cache = ResultCache::new();
        for key in prints(3) {
            cache.insert(key, Tensor::from_values(&[0.0]));
        }
        assert_eq!(cache.len(), 3);

        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.stats(), CacheStats::default());
    }

    #[test]
    fn test_concurrent_inserts() {
        let cache = Arc::new(ResultCache::new());
        let keys = prints(16);

        std::thread::scope(|scope| {
            for worker in 0..4 {
                let cache = Arc::clone(&cache);
                let keys = &keys;
                scope.spawn(move || {
                    for key in keys {
                        if cache.lookup(key).is_none() {
                            cache.insert(*key, Tensor::from_values(&[worker as f32]));
                        }
                    }
                });
            }
        });

        assert_eq!(cache.len(), 16);
        for key in &keys {
            assert!(cache.contains(key));
            assert_eq!(cache.lookup(key).unwrap().len(), 1);
        }
    }
}

//! Memoisation of enrollment-photo embeddings.
//!
//! Keys are photo store identifiers. An entry stays valid until the photo is
//! deleted or replaced, at which point the owner must call
//! [`EmbeddingCache::evict`]. There is no TTL.

use crate::types::Embedding;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

/// Concurrent photo-identifier → embedding cache with single-flight misses.
///
/// Readers share an `RwLock`. A miss takes a per-key guard so concurrent
/// misses on the same key run the loader once; misses on different keys run
/// in parallel. No lock on the entry map is held while the loader runs.
#[derive(Default)]
pub struct EmbeddingCache {
    entries: RwLock<HashMap<String, Arc<Embedding>>>,
    inflight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Bumped on every eviction; a compute that straddles an eviction is not stored.
    epoch: AtomicU64,
}

impl EmbeddingCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached embedding for `key`, if any.
    pub fn get(&self, key: &str) -> Option<Arc<Embedding>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Return the cached embedding, or run `loader` and cache its result.
    ///
    /// `Ok(None)` (no face found) and errors are returned without caching,
    /// so a later call retries.
    pub fn get_or_compute<F, E>(&self, key: &str, loader: F) -> Result<Option<Arc<Embedding>>, E>
    where
        F: FnOnce() -> Result<Option<Embedding>, E>,
    {
        if let Some(hit) = self.get(key) {
            return Ok(Some(hit));
        }

        let key_guard = self.key_guard(key);
        let result = self.compute_guarded(key, &key_guard, loader);
        self.release_key_guard(key, &key_guard);
        result
    }

    fn compute_guarded<F, E>(
        &self,
        key: &str,
        key_guard: &Mutex<()>,
        loader: F,
    ) -> Result<Option<Arc<Embedding>>, E>
    where
        F: FnOnce() -> Result<Option<Embedding>, E>,
    {
        let _held = key_guard.lock().unwrap_or_else(PoisonError::into_inner);

        // Another thread may have filled the entry while we waited.
        if let Some(hit) = self.get(key) {
            return Ok(Some(hit));
        }

        let epoch = self.epoch.load(Ordering::Acquire);
        tracing::debug!(photo_ref = key, "embedding cache miss");

        match loader()? {
            Some(embedding) => {
                let embedding = Arc::new(embedding);
                let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
                if self.epoch.load(Ordering::Acquire) == epoch {
                    entries.insert(key.to_string(), Arc::clone(&embedding));
                } else {
                    tracing::debug!(photo_ref = key, "eviction during compute, result not cached");
                }
                Ok(Some(embedding))
            }
            None => Ok(None),
        }
    }

    /// Invalidate the entry for `key`. Returns whether an entry was present.
    pub fn evict(&self, key: &str) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        self.epoch.fetch_add(1, Ordering::AcqRel);
        let removed = entries.remove(key).is_some();
        if removed {
            tracing::debug!(photo_ref = key, "embedding cache entry evicted");
        }
        removed
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn key_guard(&self, key: &str) -> Arc<Mutex<()>> {
        let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(inflight.entry(key.to_string()).or_default())
    }

    fn release_key_guard(&self, key: &str, guard: &Arc<Mutex<()>>) {
        let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
        // Only the map and this caller hold it: nobody else is waiting.
        if Arc::strong_count(guard) == 2 {
            inflight.remove(key);
        }
    }
}

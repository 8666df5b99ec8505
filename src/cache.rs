//! Cache store boundary
//!
//! The coordinator only ever talks to the cache through [`CacheStore`];
//! storage format, eviction policy, and file layout belong to the
//! implementation. [`MemoryCacheStore`] is the built-in reference
//! implementation backing the shared manager and the test suite.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use crate::types::CacheSource;

/// A cache hit: the stored payload plus which tier served it
#[derive(Clone, Debug)]
pub struct CachedImage {
    /// The cached payload
    pub data: Bytes,
    /// Which cache tier the payload came from
    pub source: CacheSource,
}

/// Pluggable cache backend consumed by [`ImageManager`](crate::manager::ImageManager)
///
/// Lookups and stores may be asynchronous but must never block the calling
/// context indefinitely. The existence checks are synchronous; the manager
/// wraps them in async variants whose callbacks run on the delivery context.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Look up a payload by cache key.
    async fn lookup(&self, key: &str) -> Option<CachedImage>;

    /// Store a payload under a cache key.
    ///
    /// When `memory_only` is set the implementation must skip any disk tier.
    async fn store(&self, key: &str, data: Bytes, memory_only: bool);

    /// Whether any tier holds an entry for the key.
    fn contains(&self, key: &str) -> bool;

    /// Whether the disk tier holds an entry for the key.
    fn contains_on_disk(&self, key: &str) -> bool;
}

/// In-memory cache store
///
/// Holds payloads in a plain map for the process lifetime; eviction is the
/// embedding application's concern. Has no disk tier, so `memory_only` is a
/// no-op and [`contains_on_disk`](CacheStore::contains_on_disk) is always
/// false.
#[derive(Default)]
pub struct MemoryCacheStore {
    entries: Mutex<HashMap<String, Bytes>>,
}

impl MemoryCacheStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drop every cached entry.
    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Bytes>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn lookup(&self, key: &str) -> Option<CachedImage> {
        self.lock().get(key).map(|data| CachedImage {
            data: data.clone(),
            source: CacheSource::Memory,
        })
    }

    async fn store(&self, key: &str, data: Bytes, _memory_only: bool) {
        self.lock().insert(key.to_string(), data);
    }

    fn contains(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    fn contains_on_disk(&self, _key: &str) -> bool {
        false
    }
}

//! Typed, single-flight access to a [`CacheStore`].
//!
//! Each key admits at most one concurrent computation. A second caller asking
//! for a key that is being computed waits on the per-key lock, then reads the
//! value the first caller stored. Store failures degrade to cache misses; they
//! never fail the caller.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

use crate::fingerprint::Fingerprint;
use crate::store::{CacheEntry, CacheStore, InMemoryStore};

/// Outcome of a computation passed to [`ResultCache::get_or_compute`].
#[derive(Debug, Clone)]
pub enum Computed<T> {
    /// Store the value under the key.
    Store(T),
    /// Return the value without caching it (degraded or partial results).
    Transient(T),
}

impl<T> Computed<T> {
    pub fn into_inner(self) -> T {
        match self {
            Self::Store(v) | Self::Transient(v) => v,
        }
    }
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Computations actually executed.
    pub computations: u64,
    /// Callers that waited on another caller's in-flight computation.
    pub coalesced: u64,
    pub evictions: u64,
    pub entries: usize,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    computations: AtomicU64,
    coalesced: AtomicU64,
}

type InflightMap = Mutex<HashMap<Fingerprint, Arc<tokio::sync::Mutex<()>>>>;

pub struct ResultCache {
    store: Arc<dyn CacheStore>,
    default_ttl: Duration,
    inflight: InflightMap,
    counters: Counters,
}

/// Holds one participant's reference to a per-key lock and removes the map
/// entry when the last participant leaves, including on cancellation.
struct InflightTicket<'a> {
    map: &'a InflightMap,
    key: Fingerprint,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl Drop for InflightTicket<'_> {
    fn drop(&mut self) {
        let Ok(mut map) = self.map.lock() else {
            return;
        };
        let is_last = map
            .get(&self.key)
            .is_some_and(|l| Arc::ptr_eq(l, &self.lock) && Arc::strong_count(l) <= 2);
        if is_last {
            map.remove(&self.key);
        }
    }
}

impl ResultCache {
    pub fn new(store: Arc<dyn CacheStore>, default_ttl: Duration) -> Self {
        Self {
            store,
            default_ttl,
            inflight: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    /// An in-memory cache with the given capacity and default TTL.
    pub fn in_memory(capacity: usize, default_ttl: Duration) -> Self {
        Self::new(Arc::new(InMemoryStore::new(capacity)), default_ttl)
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Read and decode a live entry.
    pub async fn get<T: DeserializeOwned>(&self, key: &Fingerprint) -> Option<T> {
        let value = self.lookup(key).await;
        if value.is_some() {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
        }
        value
    }

    /// Whether a live entry exists, without touching the counters.
    pub async fn contains(&self, key: &Fingerprint) -> bool {
        matches!(self.store.get(key).await, Ok(Some(_)))
    }

    /// Store a value, replacing any previous entry.
    pub async fn put<T: Serialize>(&self, key: &Fingerprint, value: &T, ttl: Duration) {
        let payload = match serde_json::to_value(value) {
            Ok(v) => v,
            Err(e) => {
                warn!(key = %key, error = %e, "Cache payload encoding failed");
                return;
            }
        };
        if let Err(e) = self.store.put(CacheEntry::new(key.clone(), payload, ttl)).await {
            warn!(key = %key, error = %e, "Cache write failed");
        }
    }

    /// Return the cached value for `key`, or run `compute` exactly once across
    /// all concurrent callers and share its result.
    ///
    /// If the computation fails, nothing is stored and the next waiter (if
    /// any) runs its own computation.
    pub async fn get_or_compute<T, E, F, Fut>(
        &self,
        key: &Fingerprint,
        ttl: Duration,
        compute: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Computed<T>, E>>,
    {
        if let Some(hit) = self.lookup(key).await {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "Cache hit");
            return Ok(hit);
        }

        let ticket = self.ticket(key);
        let _guard = match ticket.lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                self.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, "Waiting on in-flight computation");
                ticket.lock.lock().await
            }
        };

        // Another caller may have finished while we waited.
        if let Some(hit) = self.lookup(key).await {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(hit);
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        self.counters.computations.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, "Cache miss, computing");

        match compute().await? {
            Computed::Store(value) => {
                self.put(key, &value, ttl).await;
                Ok(value)
            }
            Computed::Transient(value) => Ok(value),
        }
    }

    pub async fn invalidate(&self, key: &Fingerprint) -> bool {
        self.store.remove(key).await.unwrap_or_else(|e| {
            warn!(key = %key, error = %e, "Cache invalidation failed");
            false
        })
    }

    pub async fn invalidate_namespace(&self, namespace: &str) -> usize {
        match self.store.remove_namespace(namespace).await {
            Ok(n) => {
                debug!(namespace, removed = n, "Invalidated cache namespace");
                n
            }
            Err(e) => {
                warn!(namespace, error = %e, "Cache namespace invalidation failed");
                0
            }
        }
    }

    pub async fn clear(&self) {
        if let Err(e) = self.store.clear().await {
            warn!(error = %e, "Cache clear failed");
        }
    }

    pub async fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            computations: self.counters.computations.load(Ordering::Relaxed),
            coalesced: self.counters.coalesced.load(Ordering::Relaxed),
            evictions: self.store.evictions(),
            entries: self.store.len().await.unwrap_or(0),
        }
    }

    /// Number of keys with a computation in flight.
    pub fn inflight(&self) -> usize {
        self.inflight.lock().map(|m| m.len()).unwrap_or(0)
    }

    fn ticket(&self, key: &Fingerprint) -> InflightTicket<'_> {
        let lock = match self.inflight.lock() {
            Ok(mut map) => map.entry(key.clone()).or_default().clone(),
            // A poisoned map only loses coalescing, not correctness.
            Err(_) => Arc::new(tokio::sync::Mutex::new(())),
        };
        InflightTicket {
            map: &self.inflight,
            key: key.clone(),
            lock,
        }
    }

    async fn lookup<T: DeserializeOwned>(&self, key: &Fingerprint) -> Option<T> {
        let entry = match self.store.get(key).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return None,
            Err(e) => {
                warn!(key = %key, error = %e, "Cache read failed, treating as miss");
                return None;
            }
        };
        match T::deserialize(entry.payload.as_ref()) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key = %key, error = %e, "Cached payload has unexpected shape, treating as miss");
                None
            }
        }
    }
}

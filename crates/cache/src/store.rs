//! Cache store abstraction and the bounded in-memory backend.
//!
//! Entries are immutable: a write always replaces the whole entry with a
//! fresh timestamp, and readers get a shared `Arc` to the payload.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

use crate::fingerprint::Fingerprint;

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub payload: Arc<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub ttl: Duration,
}

impl CacheEntry {
    pub fn new(fingerprint: Fingerprint, payload: serde_json::Value, ttl: Duration) -> Self {
        Self {
            fingerprint,
            payload: Arc::new(payload),
            created_at: Utc::now(),
            ttl,
        }
    }

    /// `None` when the TTL is too large to represent, i.e. the entry never expires.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let ttl = chrono::Duration::from_std(self.ttl).ok()?;
        self.created_at.checked_add_signed(ttl)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_some_and(|at| now >= at)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    #[error("Cache backend unavailable: {0}")]
    Unavailable(String),

    #[error("Cache payload could not be encoded: {0}")]
    Encoding(String),
}

/// A key/value store with TTL semantics.
#[async_trait]
pub trait CacheStore: Send + Sync {
    fn name(&self) -> &str;

    /// Fetch a live entry. Expired entries are never returned.
    async fn get(&self, key: &Fingerprint) -> Result<Option<CacheEntry>, CacheError>;

    /// Insert or replace an entry.
    async fn put(&self, entry: CacheEntry) -> Result<(), CacheError>;

    async fn remove(&self, key: &Fingerprint) -> Result<bool, CacheError>;

    /// Remove every entry in a namespace. Returns the number removed.
    async fn remove_namespace(&self, namespace: &str) -> Result<usize, CacheError>;

    async fn len(&self) -> Result<usize, CacheError>;

    async fn clear(&self) -> Result<(), CacheError>;

    /// Entries dropped for capacity or expiry since creation.
    fn evictions(&self) -> u64 {
        0
    }
}

/// A capacity-bounded in-memory store.
///
/// When full, expired entries are purged first; if that frees nothing, the
/// oldest fifth of the entries is dropped.
pub struct InMemoryStore {
    entries: RwLock<HashMap<Fingerprint, CacheEntry>>,
    capacity: usize,
    evictions: AtomicU64,
}

impl InMemoryStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            evictions: AtomicU64::new(0),
        }
    }

    fn make_room(&self, entries: &mut HashMap<Fingerprint, CacheEntry>) {
        let now = Utc::now();
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired_at(now));

        if entries.len() >= self.capacity {
            let to_remove = (self.capacity / 5).max(1);
            let mut by_age: Vec<(DateTime<Utc>, Fingerprint)> = entries
                .values()
                .map(|e| (e.created_at, e.fingerprint.clone()))
                .collect();
            by_age.sort();
            for (_, key) in by_age.into_iter().take(to_remove) {
                entries.remove(&key);
            }
        }

        let removed = before - entries.len();
        self.evictions.fetch_add(removed as u64, Ordering::Relaxed);
        debug!(removed, remaining = entries.len(), "Cache store evicted entries");
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[async_trait]
impl CacheStore for InMemoryStore {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn get(&self, key: &Fingerprint) -> Result<Option<CacheEntry>, CacheError> {
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                None => return Ok(None),
                Some(entry) if !entry.is_expired() => return Ok(Some(entry.clone())),
                Some(_) => {}
            }
        }

        let mut entries = self.entries.write().await;
        if entries.get(key).is_some_and(|e| e.is_expired()) {
            entries.remove(key);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        Ok(None)
    }

    async fn put(&self, entry: CacheEntry) -> Result<(), CacheError> {
        let mut entries = self.entries.write().await;
        if !entries.contains_key(&entry.fingerprint) && entries.len() >= self.capacity {
            self.make_room(&mut entries);
        }
        entries.insert(entry.fingerprint.clone(), entry);
        Ok(())
    }

    async fn remove(&self, key: &Fingerprint) -> Result<bool, CacheError> {
        Ok(self.entries.write().await.remove(key).is_some())
    }

    async fn remove_namespace(&self, namespace: &str) -> Result<usize, CacheError> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|k, _| k.namespace() != namespace);
        Ok(before - entries.len())
    }

    async fn len(&self) -> Result<usize, CacheError> {
        Ok(self.entries.read().await.len())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.entries.write().await.clear();
        Ok(())
    }

    fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }
}

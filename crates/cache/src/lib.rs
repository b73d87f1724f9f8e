//! Result cache for the coursegen pipeline.
//!
//! Memoizes the three most expensive cacheable steps (relevance verdicts,
//! page selections, template lookups) under content-derived fingerprints.
//!
//! - [`fingerprint`]: stable SHA-256 keys over normalized inputs
//! - [`store`]: the TTL key/value store abstraction and a bounded in-memory backend
//! - [`result_cache`]: typed access with at-most-one concurrent computation per key

pub mod fingerprint;
pub mod result_cache;
pub mod store;

pub use fingerprint::{Fingerprint, FingerprintBuilder, namespaces, normalize_text};
pub use result_cache::{CacheStats, Computed, ResultCache};
pub use store::{CacheEntry, CacheError, CacheStore, InMemoryStore};

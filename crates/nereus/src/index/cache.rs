//! Tiered cache in front of the index database.
//!
//! - L1: in-process LRU with per-entry expiry
//! - L2: a [`DistributedCache`] shared between processes, longer TTL
//!
//! Keys are `{tenant}:{repository or *}:{reference hash}`, with `:`, `*` and
//! `%` escaped inside the id segments. An L2 hit is
//! copied into L1. L2 failures never fail a lookup or a write: they are
//! logged and treated as misses.

use std::borrow::Cow;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

use super::types::{CacheStats, IndexEntry};
use crate::config::CacheConfig;
use crate::error::Error;
use crate::types::{RepositoryId, TenantId};

/// Entries cached for one key.
pub type CachedEntries = Arc<Vec<IndexEntry>>;

/// Failure of the distributed cache.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The cache cannot be reached
    #[error("distributed cache unavailable: {0}")]
    Unavailable(String),

    /// The cache refuses new keys
    #[error("distributed cache is full ({capacity} entries)")]
    Full {
        /// Configured maximum.
        capacity: usize,
    },

    /// A stored value could not be encoded or decoded
    #[error("cache value could not be decoded: {0}")]
    Codec(#[from] serde_json::Error),
}

impl From<CacheError> for Error {
    fn from(e: CacheError) -> Self {
        match e {
            CacheError::Unavailable(reason) => Self::CacheUnavailable(reason),
            CacheError::Full { capacity } => Self::CacheFull { capacity },
            CacheError::Codec(e) => Self::Serialization(e),
        }
    }
}

/// Key-value cache shared between engine instances (the L2 tier).
pub trait DistributedCache: Send + Sync {
    /// Value of a live key.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    /// Store a value for `ttl`.
    fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError>;

    /// Delete every key matching a glob pattern where `*` matches any run of
    /// characters. Returns the number of keys deleted.
    fn delete_pattern(&self, pattern: &str) -> Result<usize, CacheError>;
}

/// Whether `key` matches a glob `pattern` (`*` only).
pub(crate) fn glob_match(pattern: &str, key: &str) -> bool {
    let mut parts = pattern.split('*');
    let head = parts.next().unwrap_or_default();
    let Some(mut rest) = key.strip_prefix(head) else {
        return false;
    };
    let tail: Vec<&str> = parts.collect();
    let Some((last, middle)) = tail.split_last() else {
        return rest.is_empty();
    };
    for part in middle {
        match rest.find(part) {
            Some(at) => rest = &rest[at + part.len()..],
            None => return false,
        }
    }
    rest.ends_with(last)
}

/// In-process [`DistributedCache`] for single-node deployments and tests.
pub struct InMemoryDistributedCache {
    entries: DashMap<String, (Vec<u8>, Instant)>,
    max_entries: usize,
    available: AtomicBool,
}

impl InMemoryDistributedCache {
    /// Create a cache accepting at most `max_entries` live keys.
    #[must_use]
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries,
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: while unavailable every call fails.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
    }

    /// Live and expired keys currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` when no key is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn check_available(&self) -> Result<(), CacheError> {
        if self.available.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(CacheError::Unavailable("connection refused".to_string()))
        }
    }
}

impl DistributedCache for InMemoryDistributedCache {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        self.check_available()?;
        let now = Instant::now();
        let value = self
            .entries
            .get(key)
            .filter(|entry| entry.1 > now)
            .map(|entry| entry.0.clone());
        if value.is_none() {
            self.entries.remove_if(key, |_, (_, expires)| *expires <= now);
        }
        Ok(value)
    }

    fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        self.check_available()?;
        let now = Instant::now();
        if !self.entries.contains_key(key) && self.entries.len() >= self.max_entries {
            self.entries.retain(|_, (_, expires)| *expires > now);
            if self.entries.len() >= self.max_entries {
                return Err(CacheError::Full {
                    capacity: self.max_entries,
                });
            }
        }
        self.entries.insert(key.to_string(), (value, now + ttl));
        Ok(())
    }

    fn delete_pattern(&self, pattern: &str) -> Result<usize, CacheError> {
        self.check_available()?;
        let before = self.entries.len();
        self.entries.retain(|key, _| !glob_match(pattern, key));
        Ok(before - self.entries.len())
    }
}

/// Tier that served a cache hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTier {
    /// In-process LRU.
    L1,
    /// Distributed cache.
    L2,
}

struct L1Entry {
    entries: CachedEntries,
    expires_at: Instant,
}

/// L1 + L2 cache of hash lookups.
pub struct LookupCache {
    l1: Mutex<LruCache<String, L1Entry>>,
    l1_ttl: Duration,
    l2: Option<Arc<dyn DistributedCache>>,
    l2_ttl: Duration,
    stats: Mutex<CacheStats>,
}

impl LookupCache {
    /// Create a cache sized by `config`, optionally backed by an L2.
    #[must_use]
    pub fn new(config: &CacheConfig, l2: Option<Arc<dyn DistributedCache>>) -> Self {
        let capacity = NonZeroUsize::new(config.l1_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            l1: Mutex::new(LruCache::new(capacity)),
            l1_ttl: config.l1_ttl(),
            l2,
            l2_ttl: config.l2_ttl(),
            stats: Mutex::new(CacheStats::default()),
        }
    }

    /// Cache key of a hash lookup.
    #[must_use]
    pub fn key(
        tenant_id: &TenantId,
        repository_id: Option<&RepositoryId>,
        reference_hash: &str,
    ) -> String {
        let repository = repository_id.map_or(Cow::Borrowed("*"), RepositoryId::key_segment);
        format!("{}:{repository}:{reference_hash}", tenant_id.key_segment())
    }

    fn get_l1(&self, key: &str) -> Option<CachedEntries> {
        let mut l1 = self.l1.lock();
        let now = Instant::now();
        match l1.get(key) {
            Some(entry) if entry.expires_at > now => return Some(Arc::clone(&entry.entries)),
            Some(_) => {}
            None => return None,
        }
        l1.pop(key);
        None
    }

    fn put_l1(&self, key: &str, entries: CachedEntries) {
        let expires_at = Instant::now() + self.l1_ttl;
        self.l1
            .lock()
            .put(key.to_string(), L1Entry { entries, expires_at });
    }

    fn get_l2(&self, key: &str) -> Option<CachedEntries> {
        let l2 = self.l2.as_ref()?;
        let bytes = match l2.get(key) {
            Ok(bytes) => bytes?,
            Err(e) => {
                warn!(key, error = %e, "L2 cache read failed");
                return None;
            }
        };
        match serde_json::from_slice::<Vec<IndexEntry>>(&bytes) {
            Ok(entries) => Some(Arc::new(entries)),
            Err(e) => {
                warn!(key, error = %e, "Discarding undecodable L2 cache value");
                None
            }
        }
    }

    /// Look a key up in L1, then L2. Counts the hit or miss.
    pub fn get(&self, key: &str) -> Option<(CachedEntries, CacheTier)> {
        if let Some(entries) = self.get_l1(key) {
            self.stats.lock().l1_hits += 1;
            debug!(key, "L1 cache hit");
            return Some((entries, CacheTier::L1));
        }
        if let Some(entries) = self.get_l2(key) {
            self.put_l1(key, Arc::clone(&entries));
            self.stats.lock().l2_hits += 1;
            debug!(key, "L2 cache hit");
            return Some((entries, CacheTier::L2));
        }
        self.stats.lock().misses += 1;
        None
    }

    /// Write a value to L1, then L2 (best effort).
    pub fn put(&self, key: &str, entries: CachedEntries) {
        self.put_l1(key, Arc::clone(&entries));
        let Some(l2) = &self.l2 else {
            return;
        };
        let written = serde_json::to_vec(entries.as_slice())
            .map_err(CacheError::from)
            .and_then(|bytes| l2.set(key, bytes, self.l2_ttl));
        if let Err(e) = written {
            warn!(key, error = %e, "L2 cache write failed");
        }
    }

    /// Drop every key of a tenant from both tiers. Returns the L1 keys dropped.
    pub fn invalidate_tenant(&self, tenant_id: &TenantId) -> usize {
        let prefix = format!("{}:", tenant_id.key_segment());
        let dropped = {
            let mut l1 = self.l1.lock();
            let doomed: Vec<String> = l1
                .iter()
                .filter(|(key, _)| key.starts_with(&prefix))
                .map(|(key, _)| key.clone())
                .collect();
            for key in &doomed {
                l1.pop(key);
            }
            doomed.len()
        };
        if let Some(l2) = &self.l2 {
            match l2.delete_pattern(&format!("{prefix}*")) {
                Ok(deleted) => debug!(tenant_id = %tenant_id, deleted, "Invalidated L2 keys"),
                Err(e) => warn!(tenant_id = %tenant_id, error = %e, "L2 invalidation failed"),
            }
        }
        debug!(tenant_id = %tenant_id, dropped, "Invalidated L1 keys");
        dropped
    }

    /// Hit counters and L1 size.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let mut stats = *self.stats.lock();
        stats.l1_entries = self.l1.lock().len();
        stats
    }
}

//! In-memory cache of computed diffs.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::DiffResult;
use crate::types::TenantId;

/// Bookkeeping of one cached diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheInfo {
    /// When the result was stored.
    pub cached_at: DateTime<Utc>,
    /// When the result stops being served.
    pub expires_at: DateTime<Utc>,
    /// Times the result was served from the cache.
    pub access_count: u64,
}

struct Entry {
    result: Arc<DiffResult>,
    info: CacheInfo,
}

/// LRU of diff results keyed by tenant and diff id, with a time to live.
pub struct DiffCache {
    entries: Mutex<LruCache<String, Entry>>,
    ttl: chrono::Duration,
}

impl DiffCache {
    /// Create a cache holding at most `capacity` results for `ttl` each.
    #[must_use]
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl: chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX),
        }
    }

    fn key(tenant_id: &TenantId, diff_id: &str) -> String {
        format!("{}:{diff_id}", tenant_id.key_segment())
    }

    /// Serve a cached result, counting the access.
    pub fn get(&self, tenant_id: &TenantId, diff_id: &str) -> Option<(Arc<DiffResult>, CacheInfo)> {
        let key = Self::key(tenant_id, diff_id);
        let mut entries = self.entries.lock();
        let expired = match entries.get_mut(&key) {
            None => return None,
            Some(entry) if entry.info.expires_at <= Utc::now() => true,
            Some(entry) => {
                entry.info.access_count += 1;
                return Some((Arc::clone(&entry.result), entry.info));
            }
        };
        if expired {
            entries.pop(&key);
            debug!(diff_id, "Dropped expired diff");
        }
        None
    }

    /// Store a result, replacing any earlier entry for the same diff.
    pub fn insert(&self, tenant_id: &TenantId, result: Arc<DiffResult>) -> CacheInfo {
        let cached_at = Utc::now();
        let info = CacheInfo {
            cached_at,
            expires_at: cached_at.checked_add_signed(self.ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
            access_count: 0,
        };
        let key = Self::key(tenant_id, &result.diff_id);
        self.entries.lock().put(key, Entry { result, info });
        info
    }

    /// Drop one cached diff.
    pub fn remove(&self, tenant_id: &TenantId, diff_id: &str) -> bool {
        self.entries
            .lock()
            .pop(&Self::key(tenant_id, diff_id))
            .is_some()
    }

    /// Drop every cached diff of a tenant.
    pub fn invalidate_tenant(&self, tenant_id: &TenantId) -> usize {
        let prefix = format!("{}:", tenant_id.key_segment());
        let mut entries = self.entries.lock();
        let doomed: Vec<String> = entries
            .iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            entries.pop(key);
        }
        doomed.len()
    }

    /// Number of cached results, expired ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// `true` when nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

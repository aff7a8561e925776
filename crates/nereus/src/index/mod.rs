//! External object index.
//!
//! Maps identifiers of objects that live outside the graphs (cloud ARNs,
//! resource ids, Kubernetes and GCP/Azure resource names) to the graph
//! nodes that reference them, across every repository of a tenant.
//!
//! ## Layers
//!
//! - [`extract`]: finds and normalizes references on nodes
//! - [`IndexRepository`]: `SQLite` tables and queries
//! - [`LookupCache`]: L1 LRU and optional L2 in front of hash lookups
//! - [`BuildManager`]: batch (re)indexing of scans
//! - [`IndexService`]: the API the rest of the crate and the CLI call
//!
//! ```text
//! lookup(externalId) -> normalize -> reference hash -> L1 -> L2 -> SQLite
//! ```

mod build;
mod cache;
pub mod extract;
mod repository;
mod types;

pub use build::BuildManager;
pub use cache::{
    CacheError, CacheTier, CachedEntries, DistributedCache, InMemoryDistributedCache, LookupCache,
};
pub use extract::{
    ExtractedReference, ParsedReference, ReferenceType, extract_references, normalize,
    parse_reference, reference_hash,
};
pub use repository::{DEFAULT_BATCH_SIZE, IndexRepository, NodeReferenceFilter, NodeReferencePage};
pub use types::{
    BatchLookupResult, BuildError, BuildRecord, BuildRequest, BuildResult, BuildStatus,
    CacheStats, EntryPage, ExternalObjectRef, ExternalReference, HealthReport, HealthStatus,
    IndexEntry, IndexStats, InsertStats, LookupRequest, LookupResult, Pagination,
    PartialProgress, ReverseLookupRequest, ReverseLookupResult, SortField, SortOrder,
    UpsertStats,
};

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::{CacheConfig, IndexConfig};
use crate::db::Database;
use crate::error::{Error, LimitType, Result};
use crate::limiter::ExecutionLimiter;
use crate::store::GraphStore;
use crate::types::{RepositoryId, ScanId, TenantId};
use crate::validation::{ValidationCode, ValidationIssue};

/// Cache hit ratio below which the index reports itself degraded.
const HEALTHY_HIT_RATIO: f64 = 0.5;
/// Average lookup time above which the index reports itself degraded.
const HEALTHY_AVERAGE_LOOKUP_MS: f64 = 500.0;

#[derive(Debug, Default)]
struct LookupTimings {
    count: u64,
    total_ms: f64,
}

impl LookupTimings {
    #[allow(clippy::cast_precision_loss)]
    fn average_ms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total_ms / self.count as f64
        }
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

#[allow(clippy::cast_precision_loss)]
fn over_threshold(elapsed_ms: f64, threshold_ms: u64) -> bool {
    elapsed_ms > threshold_ms as f64
}

/// Aggregate the junction rows of one identifier.
fn summarize(external_id: &str, entries: &[IndexEntry]) -> LookupResult {
    let mut result = LookupResult {
        external_id: external_id.to_string(),
        found: !entries.is_empty(),
        reference_count: entries.len(),
        ..LookupResult::default()
    };
    let mut scans = BTreeSet::new();
    let mut repositories = BTreeSet::new();
    for entry in entries {
        if !result.node_ids.contains(&entry.node_id) {
            result.node_ids.push(entry.node_id.clone());
        }
        if scans.insert(entry.scan_id.clone()) {
            result.scan_ids.push(entry.scan_id.clone());
        }
        if repositories.insert(entry.repository_id.clone()) {
            result.repository_ids.push(entry.repository_id.clone());
        }
    }
    result.first_seen = entries.iter().map(|e| e.created_at).min();
    result.last_updated = entries.iter().map(|e| e.created_at).max();
    result
}

/// Lookups, reverse lookups, writes and builds of the external object index.
///
/// Every operation is scoped by tenant; identifiers indexed for one tenant
/// are invisible to every other.
pub struct IndexService {
    store: Arc<dyn GraphStore>,
    repository: Arc<IndexRepository>,
    cache: Arc<LookupCache>,
    builds: BuildManager,
    config: IndexConfig,
    timings: Mutex<LookupTimings>,
}

impl std::fmt::Debug for IndexService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexService")
            .field("config", &self.config)
            .field("builds", &self.builds)
            .finish_non_exhaustive()
    }
}

impl IndexService {
    /// Create the service on top of a shared database.
    ///
    /// `l2` is the distributed cache tier; without one, lookups fall
    /// through from L1 straight to `SQLite`.
    #[must_use]
    pub fn new(
        store: Arc<dyn GraphStore>,
        db: Arc<Database>,
        cache_config: &CacheConfig,
        config: IndexConfig,
        l2: Option<Arc<dyn DistributedCache>>,
        limiter: ExecutionLimiter,
    ) -> Self {
        let repository = Arc::new(IndexRepository::new(db, config.batch_size));
        let cache = Arc::new(LookupCache::new(cache_config, l2));
        let builds = BuildManager::new(
            Arc::clone(&store),
            Arc::clone(&repository),
            Arc::clone(&cache),
            config.clone(),
            limiter,
        );
        Self {
            store,
            repository,
            cache,
            builds,
            config,
            timings: Mutex::new(LookupTimings::default()),
        }
    }

    /// The underlying repository.
    #[must_use]
    pub fn repository(&self) -> &IndexRepository {
        &self.repository
    }

    /// The build manager.
    #[must_use]
    pub fn builds(&self) -> &BuildManager {
        &self.builds
    }

    /// Junction rows of a hash, through L1, L2, then `SQLite`.
    ///
    /// Database results are written back to both tiers. Empty results are
    /// not cached.
    fn entries_for_hash(
        &self,
        tenant_id: &TenantId,
        repository_id: Option<&RepositoryId>,
        reference_hash: &str,
    ) -> Result<CachedEntries> {
        let key = LookupCache::key(tenant_id, repository_id, reference_hash);
        if let Some((entries, tier)) = self.cache.get(&key) {
            debug!(key = %key, ?tier, rows = entries.len(), "Lookup served from cache");
            return Ok(entries);
        }
        let entries = Arc::new(self.repository.find_all_by_reference_hash(
            tenant_id,
            repository_id,
            reference_hash,
        )?);
        if !entries.is_empty() {
            self.cache.put(&key, Arc::clone(&entries));
        }
        Ok(entries)
    }

    /// First junction row of a reference hash.
    pub fn find_by_reference_hash(
        &self,
        tenant_id: &TenantId,
        repository_id: Option<&RepositoryId>,
        reference_hash: &str,
    ) -> Result<Option<IndexEntry>> {
        Ok(self
            .entries_for_hash(tenant_id, repository_id, reference_hash)?
            .first()
            .cloned())
    }

    /// Nodes referencing an identifier.
    ///
    /// The identifier is normalized the same way extraction normalizes it,
    /// so `ARN:AWS:S3:::logs` and `arn:aws:s3:::logs` find the same nodes.
    pub fn lookup(&self, tenant_id: &TenantId, request: &LookupRequest) -> Result<LookupResult> {
        let started = Instant::now();
        let normalized = parse_reference(&request.external_id)
            .filter(|parsed| parsed.reference_type == request.external_type)
            .map_or_else(|| normalize(&request.external_id), |parsed| parsed.normalized_id);
        let hash = reference_hash(request.external_type, &normalized);

        let entries = self.entries_for_hash(tenant_id, request.repository_id.as_ref(), &hash)?;
        let mut result = summarize(&request.external_id, &entries);

        if request.include_node_details {
            let mut nodes = Vec::with_capacity(entries.len());
            let mut seen = BTreeSet::new();
            for entry in entries.iter() {
                if !seen.insert((&entry.scan_id, &entry.node_id)) {
                    continue;
                }
                let node = self
                    .store
                    .get_node(tenant_id, &entry.scan_id, &entry.node_id)?;
                nodes.extend(node);
            }
            result.nodes = Some(nodes);
        }

        let elapsed = elapsed_ms(started);
        {
            let mut timings = self.timings.lock();
            timings.count += 1;
            timings.total_ms += elapsed;
        }
        if over_threshold(elapsed, self.config.lookup_warn_ms) {
            warn!(
                tenant_id = %tenant_id,
                external_id = %request.external_id,
                elapsed_ms = elapsed,
                threshold_ms = self.config.lookup_warn_ms,
                "Slow external object lookup"
            );
        }
        Ok(result)
    }

    /// Look up several identifiers at once.
    ///
    /// # Errors
    ///
    /// `LimitExceeded{batch_items}` above `max-batch-lookup` items.
    pub fn batch_lookup(
        &self,
        tenant_id: &TenantId,
        requests: &[LookupRequest],
    ) -> Result<BatchLookupResult> {
        if requests.is_empty() {
            return Err(Error::Validation(vec![ValidationIssue::new(
                ValidationCode::EmptyBatch,
                "lookups",
                "a batch lookup needs at least one item",
            )]));
        }
        if requests.len() > self.config.max_batch_lookup {
            return Err(Error::LimitExceeded {
                limit_type: LimitType::BatchItems,
                current: requests.len(),
                maximum: self.config.max_batch_lookup,
            });
        }

        let started = Instant::now();
        let results = requests
            .iter()
            .map(|request| self.lookup(tenant_id, request))
            .collect::<Result<Vec<_>>>()?;
        let found = results.iter().filter(|r| r.found).count();
        Ok(BatchLookupResult {
            not_found: results.len() - found,
            found,
            results,
            processing_time_ms: elapsed_ms(started),
        })
    }

    /// External objects referenced by one node.
    pub fn reverse_lookup(
        &self,
        tenant_id: &TenantId,
        request: &ReverseLookupRequest,
    ) -> Result<ReverseLookupResult> {
        let started = Instant::now();
        let filter = NodeReferenceFilter {
            types: request.types.clone(),
            min_confidence: request.min_confidence,
        };
        let page = self.repository.find_references_for_node(
            tenant_id,
            &request.scan_id,
            &request.node_id,
            &filter,
            &request.pagination,
        )?;

        let elapsed = elapsed_ms(started);
        if over_threshold(elapsed, self.config.reverse_lookup_warn_ms) {
            warn!(
                tenant_id = %tenant_id,
                node_id = %request.node_id,
                elapsed_ms = elapsed,
                threshold_ms = self.config.reverse_lookup_warn_ms,
                "Slow reverse lookup"
            );
        }

        Ok(ReverseLookupResult {
            node_id: request.node_id.clone(),
            scan_id: request.scan_id.clone(),
            external_objects: page
                .entries
                .into_iter()
                .map(|entry| ExternalObjectRef {
                    external_object_id: entry.external_object_id,
                    ref_type: entry.ref_type,
                    confidence: entry.confidence,
                    context: entry.context,
                    reference_hash: entry.reference_hash,
                })
                .collect(),
            total_count: page.total,
            count_by_type: page.count_by_type,
        })
    }

    /// Nodes referencing a normalized identifier, one page at a time.
    pub fn find_nodes_by_external_object(
        &self,
        tenant_id: &TenantId,
        external_object_id: &str,
        pagination: &Pagination,
    ) -> Result<EntryPage> {
        let started = Instant::now();
        let page =
            self.repository
                .find_nodes_by_external_object(tenant_id, external_object_id, pagination)?;
        let elapsed = elapsed_ms(started);
        if over_threshold(elapsed, self.config.reverse_lookup_warn_ms) {
            warn!(
                tenant_id = %tenant_id,
                external_object_id,
                elapsed_ms = elapsed,
                "Slow external object page"
            );
        }
        Ok(page)
    }

    /// Insert junction rows, write-through.
    ///
    /// Rows go to `SQLite` first. The affected tenants are then invalidated
    /// in both cache tiers and the touched keys reloaded into them.
    pub fn bulk_insert_junction(&self, entries: &[IndexEntry]) -> Result<InsertStats> {
        let stats = self.repository.bulk_insert_junction(entries)?;
        if stats.inserted == 0 {
            return Ok(stats);
        }

        let tenants: BTreeSet<&TenantId> = entries.iter().map(|e| &e.tenant_id).collect();
        for tenant_id in tenants {
            self.cache.invalidate_tenant(tenant_id);
        }

        let keys: BTreeSet<(&TenantId, &RepositoryId, &str)> = entries
            .iter()
            .map(|e| (&e.tenant_id, &e.repository_id, e.reference_hash.as_str()))
            .collect();
        for (tenant_id, repository_id, hash) in keys {
            self.entries_for_hash(tenant_id, Some(repository_id), hash)?;
            self.entries_for_hash(tenant_id, None, hash)?;
        }
        Ok(stats)
    }

    /// Remove every index row of a scan.
    pub fn delete_for_scan(
        &self,
        tenant_id: &TenantId,
        repository_id: &RepositoryId,
        scan_id: &ScanId,
    ) -> Result<usize> {
        let deleted = self
            .repository
            .delete_for_scan(tenant_id, repository_id, scan_id)?;
        self.cache.invalidate_tenant(tenant_id);
        Ok(deleted)
    }

    /// Start an index build. See [`BuildManager::start`].
    pub fn build(&self, tenant_id: &TenantId, request: BuildRequest) -> Result<BuildResult> {
        self.builds.start(tenant_id, request)
    }

    /// State of a build.
    pub fn get_build(&self, tenant_id: &TenantId, build_id: &str) -> Result<BuildRecord> {
        self.builds.get_build(tenant_id, build_id)
    }

    /// Request cancellation of a build.
    pub fn cancel_build(&self, tenant_id: &TenantId, build_id: &str) -> Result<BuildRecord> {
        self.builds.cancel(tenant_id, build_id)
    }

    /// Block until a build finishes.
    pub fn wait_for_build(
        &self,
        tenant_id: &TenantId,
        build_id: &str,
        timeout: Duration,
    ) -> Result<BuildRecord> {
        self.builds.wait(tenant_id, build_id, timeout)
    }

    /// Counters of a tenant's index.
    pub fn stats(&self, tenant_id: &TenantId) -> Result<IndexStats> {
        let counts_by_type = self.repository.counts_by_type(tenant_id)?;
        let cache = self.cache.stats();
        Ok(IndexStats {
            total_entries: counts_by_type.values().sum(),
            unique_objects: self.repository.count_unique_objects(tenant_id)?,
            counts_by_type,
            cache_hit_ratio: cache.hit_rate(),
            cache,
            average_lookup_ms: self.timings.lock().average_ms(),
            last_build: self.builds.last_build(tenant_id)?,
        })
    }

    /// Health verdict of a tenant's index.
    ///
    /// Degraded when the cache hit ratio is below 0.5 (once lookups have
    /// happened), when no build ever finished, or when the average lookup
    /// takes longer than 500ms.
    pub fn health(&self, tenant_id: &TenantId) -> Result<HealthReport> {
        let stats = self.stats(tenant_id)?;
        let mut issues = Vec::new();

        let lookups = stats.cache.l1_hits + stats.cache.l2_hits + stats.cache.misses;
        if lookups > 0 && stats.cache_hit_ratio < HEALTHY_HIT_RATIO {
            issues.push(format!(
                "cache hit ratio {:.2} is below {HEALTHY_HIT_RATIO}",
                stats.cache_hit_ratio
            ));
        }
        if stats.last_build.is_none() {
            issues.push("no index build has completed".to_string());
        }
        if stats.average_lookup_ms > HEALTHY_AVERAGE_LOOKUP_MS {
            issues.push(format!(
                "average lookup time {:.1}ms exceeds {HEALTHY_AVERAGE_LOOKUP_MS}ms",
                stats.average_lookup_ms
            ));
        }

        Ok(HealthReport {
            status: if issues.is_empty() {
                HealthStatus::Healthy
            } else {
                HealthStatus::Degraded
            },
            issues,
            cache_hit_ratio: stats.cache_hit_ratio,
            average_lookup_ms: stats.average_lookup_ms,
            last_build_at: stats.last_build.and_then(|build| build.completed_at),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryGraphStore;
    use crate::types::{GraphNode, GraphSnapshot};
    use chrono::Utc;
    use serde_json::json;

    fn service_with(
        l2: Option<Arc<dyn DistributedCache>>,
    ) -> (Arc<MemoryGraphStore>, IndexService) {
        let store = Arc::new(MemoryGraphStore::new());
        let service = IndexService::new(
            Arc::clone(&store) as Arc<dyn GraphStore>,
            Arc::new(Database::open_in_memory().unwrap()),
            &CacheConfig::default(),
            IndexConfig::default(),
            l2,
            ExecutionLimiter::new(5),
        );
        (store, service)
    }

    fn indexed_service() -> IndexService {
        let (store, service) = service_with(None);
        store.insert_snapshot(
            GraphSnapshot::new("acme", "infra", "scan-infra")
                .with_node(
                    GraphNode::new("infra-logs", "aws_s3_bucket", "logs", "", "")
                        .with_attribute("arn", json!("arn:aws:s3:::logs-bucket")),
                )
                .with_node(
                    GraphNode::new("infra-vpc", "aws_vpc", "main", "", "")
                        .with_attribute("id", json!("vpc-0a1b2c3d")),
                ),
        );
        store.insert_snapshot(
            GraphSnapshot::new("acme", "apps", "scan-apps").with_node(
                GraphNode::new("apps-writer", "helm_release", "writer", "", "")
                    .with_attribute("values", json!({"bucket": "arn:aws:s3:::logs-bucket"})),
            ),
        );
        service
            .build(
                &"acme".into(),
                BuildRequest::for_repositories(vec!["infra".into(), "apps".into()]),
            )
            .unwrap();
        service
    }

    #[test]
    fn lookup_finds_nodes_across_repositories() {
        let service = indexed_service();

        let result = service
            .lookup(
                &"acme".into(),
                &LookupRequest::new("ARN:AWS:S3:::logs-bucket", ReferenceType::Arn)
                    .with_node_details(),
            )
            .unwrap();

        assert!(result.found);
        assert_eq!(result.reference_count, 2);
        assert_eq!(result.repository_ids.len(), 2);
        assert_eq!(result.nodes.map(|n| n.len()), Some(2));
        assert!(result.first_seen <= result.last_updated);
    }

    #[test]
    fn lookup_is_tenant_scoped() {
        let service = indexed_service();

        let result = service
            .lookup(
                &"globex".into(),
                &LookupRequest::new("arn:aws:s3:::logs-bucket", ReferenceType::Arn),
            )
            .unwrap();

        assert!(!result.found);
        assert!(result.node_ids.is_empty());
    }

    #[test]
    fn repeated_lookup_hits_l1() {
        let service = indexed_service();
        let request = LookupRequest::new("vpc-0a1b2c3d", ReferenceType::ResourceId);

        service.lookup(&"acme".into(), &request).unwrap();
        service.lookup(&"acme".into(), &request).unwrap();

        let stats = service.stats(&"acme".into()).unwrap();
        assert_eq!(stats.cache.misses, 1);
        assert_eq!(stats.cache.l1_hits, 1);
    }

    #[test]
    fn l2_serves_after_l1_is_lost() {
        let l2: Arc<dyn DistributedCache> = Arc::new(InMemoryDistributedCache::new(100));
        let (store, first) = service_with(Some(Arc::clone(&l2)));
        store.insert_snapshot(
            GraphSnapshot::new("acme", "infra", "scan-1").with_node(
                GraphNode::new("n1", "aws_s3_bucket", "logs", "", "")
                    .with_attribute("arn", json!("arn:aws:s3:::logs")),
            ),
        );
        first
            .build(&"acme".into(), BuildRequest::for_scans(vec!["scan-1".into()]))
            .unwrap();
        let request = LookupRequest::new("arn:aws:s3:::logs", ReferenceType::Arn);
        first.lookup(&"acme".into(), &request).unwrap();

        // a second process sharing the L2 but not the database
        let (_, second) = service_with(Some(l2));
        let result = second.lookup(&"acme".into(), &request).unwrap();

        assert!(result.found);
        assert_eq!(second.stats(&"acme".into()).unwrap().cache.l2_hits, 1);
    }

    #[test]
    fn batch_lookup_counts_and_limits() {
        let service = indexed_service();
        let requests = vec![
            LookupRequest::new("arn:aws:s3:::logs-bucket", ReferenceType::Arn),
            LookupRequest::new("arn:aws:s3:::missing", ReferenceType::Arn),
        ];

        let batch = service.batch_lookup(&"acme".into(), &requests).unwrap();
        assert_eq!(batch.found, 1);
        assert_eq!(batch.not_found, 1);
        assert_eq!(batch.results.len(), 2);

        let too_many = vec![requests[0].clone(); 101];
        let err = service.batch_lookup(&"acme".into(), &too_many).unwrap_err();
        assert!(matches!(
            err,
            Error::LimitExceeded {
                limit_type: LimitType::BatchItems,
                current: 101,
                maximum: 100
            }
        ));
    }

    #[test]
    fn reverse_lookup_counts_by_type() {
        let service = indexed_service();

        let result = service
            .reverse_lookup(&"acme".into(), &ReverseLookupRequest::new("scan-infra", "infra-vpc"))
            .unwrap();

        assert_eq!(result.total_count, 1);
        assert_eq!(result.count_by_type[&ReferenceType::ResourceId], 1);
        assert_eq!(result.external_objects[0].external_object_id, "vpc-0a1b2c3d");
    }

    #[test]
    fn bulk_insert_refreshes_cached_lookups() {
        let service = indexed_service();
        let tenant = TenantId::from("acme");
        let request = LookupRequest::new("arn:aws:s3:::logs-bucket", ReferenceType::Arn);
        let before = service.lookup(&tenant, &request).unwrap();

        let entry = IndexEntry {
            tenant_id: tenant.clone(),
            node_id: "extra".into(),
            external_object_id: "arn:aws:s3:::logs-bucket".to_string(),
            scan_id: "scan-extra".into(),
            repository_id: "data".into(),
            reference_hash: reference_hash(ReferenceType::Arn, "arn:aws:s3:::logs-bucket"),
            ref_type: ReferenceType::Arn,
            confidence: 1.0,
            context: None,
            created_at: Utc::now(),
        };
        let stats = service.bulk_insert_junction(&[entry]).unwrap();
        let after = service.lookup(&tenant, &request).unwrap();

        assert_eq!(stats.inserted, 1);
        assert_eq!(after.reference_count, before.reference_count + 1);
    }

    #[test]
    fn delete_for_scan_invalidates_cache() {
        let service = indexed_service();
        let tenant = TenantId::from("acme");
        let request = LookupRequest::new("vpc-0a1b2c3d", ReferenceType::ResourceId);
        assert!(service.lookup(&tenant, &request).unwrap().found);

        let deleted = service
            .delete_for_scan(&tenant, &"infra".into(), &"scan-infra".into())
            .unwrap();

        assert_eq!(deleted, 2);
        assert!(!service.lookup(&tenant, &request).unwrap().found);
    }

    #[test]
    fn health_requires_a_finished_build() {
        let (_, empty) = service_with(None);
        let report = empty.health(&"acme".into()).unwrap();
        assert_eq!(report.status, HealthStatus::Degraded);
        assert_eq!(report.issues.len(), 1);

        let service = indexed_service();
        let report = service.health(&"acme".into()).unwrap();
        assert_eq!(report.status, HealthStatus::Healthy);
        assert!(report.last_build_at.is_some());

        let stats = service.stats(&"acme".into()).unwrap();
        assert_eq!(stats.total_entries, 3);
        assert_eq!(stats.unique_objects, 2);
    }
}

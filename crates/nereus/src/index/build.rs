//! Index builds: extraction of external references from stored scans.
//!
//! A build resolves its scans up front, plans the junction entries of every
//! scan, then writes each scan as delete-then-insert in batches of
//! `batch-size` entries (one transaction per batch). Cancellation and the
//! build timeout are checked between batches; batches already committed are
//! kept. Only one build runs per tenant at a time.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::cache::LookupCache;
use super::extract::extract_references;
use super::repository::IndexRepository;
use super::types::{
    BuildError, BuildRecord, BuildRequest, BuildResult, BuildStatus, ExternalReference,
    IndexEntry, PartialProgress,
};
use crate::config::IndexConfig;
use crate::error::{Error, Result};
use crate::limiter::{ExecutionLimiter, ExecutionPermit};
use crate::store::{GraphStore, require_scan};
use crate::types::{ScanInfo, TenantId};
use crate::validation::{ValidationCode, ValidationIssue};

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A build known to this process.
#[derive(Debug)]
struct BuildHandle {
    record: Mutex<BuildRecord>,
    cancel: AtomicBool,
}

impl BuildHandle {
    fn snapshot(&self) -> BuildRecord {
        self.record.lock().clone()
    }

    fn set_progress(&self, progress: PartialProgress) {
        self.record.lock().partial_progress = progress;
    }
}

/// Junction entries of one scan, ready to write.
struct ScanPlan {
    scan: ScanInfo,
    references: Vec<ExternalReference>,
    entries: Vec<IndexEntry>,
}

struct Inner {
    store: Arc<dyn GraphStore>,
    repository: Arc<IndexRepository>,
    cache: Arc<LookupCache>,
    config: IndexConfig,
    limiter: ExecutionLimiter,
    builds: DashMap<String, Arc<BuildHandle>>,
    running: DashMap<TenantId, String>,
    sequence: AtomicU64,
}

/// Releases the tenant's running-build slot when dropped.
struct RunningSlot {
    inner: Arc<Inner>,
    tenant_id: TenantId,
    build_id: String,
}

impl Drop for RunningSlot {
    fn drop(&mut self) {
        self.inner
            .running
            .remove_if(&self.tenant_id, |_, id| *id == self.build_id);
        self.inner.builds.remove(&self.build_id);
    }
}

/// Starts, tracks and cancels index builds.
#[derive(Clone)]
pub struct BuildManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for BuildManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildManager")
            .field("running", &self.inner.running.len())
            .field("batch_size", &self.inner.config.batch_size)
            .finish_non_exhaustive()
    }
}

impl BuildManager {
    /// Create a manager writing through `repository` and invalidating `cache`.
    #[must_use]
    pub fn new(
        store: Arc<dyn GraphStore>,
        repository: Arc<IndexRepository>,
        cache: Arc<LookupCache>,
        config: IndexConfig,
        limiter: ExecutionLimiter,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                repository,
                cache,
                config,
                limiter,
                builds: DashMap::new(),
                running: DashMap::new(),
                sequence: AtomicU64::new(0),
            }),
        }
    }

    /// Start a build.
    ///
    /// Synchronous requests return the final result. Asynchronous requests
    /// return a `running` result carrying the build id to poll with
    /// [`get_build`](Self::get_build).
    ///
    /// # Errors
    ///
    /// - `Validation` when the request names no scans and no repositories
    /// - `NotFound` for scans or repositories the tenant does not own
    /// - `BuildAlreadyRunning` while another build of the tenant runs
    /// - `LimitExceeded` when the tenant is at its execution ceiling
    pub fn start(&self, tenant_id: &TenantId, request: BuildRequest) -> Result<BuildResult> {
        let scans = self.resolve_scans(tenant_id, &request)?;
        let build_id = self.next_build_id();

        match self.inner.running.entry(tenant_id.clone()) {
            Entry::Occupied(running) => {
                return Err(Error::BuildAlreadyRunning {
                    build_id: running.get().clone(),
                });
            }
            Entry::Vacant(slot) => {
                slot.insert(build_id.clone());
            }
        }
        let slot = RunningSlot {
            inner: Arc::clone(&self.inner),
            tenant_id: tenant_id.clone(),
            build_id: build_id.clone(),
        };
        let permit = self.inner.limiter.acquire(tenant_id)?;

        let run_async = request.run_async;
        let record = BuildRecord {
            build_id: build_id.clone(),
            tenant_id: tenant_id.clone(),
            status: BuildStatus::Running,
            request,
            result: None,
            partial_progress: PartialProgress::default(),
            started_at: Utc::now(),
            completed_at: None,
        };
        self.inner.repository.save_build(&record)?;
        let handle = Arc::new(BuildHandle {
            record: Mutex::new(record),
            cancel: AtomicBool::new(false),
        });
        self.inner
            .builds
            .insert(build_id.clone(), Arc::clone(&handle));
        info!(
            tenant_id = %tenant_id,
            build_id = %build_id,
            scans = scans.len(),
            run_async,
            "Index build started"
        );

        if !run_async {
            return Ok(finish(&self.inner, &handle, &scans, permit, slot));
        }

        let inner = Arc::clone(&self.inner);
        let thread_handle = Arc::clone(&handle);
        let spawned = thread::Builder::new()
            .name(build_id.clone())
            .spawn(move || {
                finish(&inner, &thread_handle, &scans, permit, slot);
            });
        if let Err(e) = spawned {
            let mut record = handle.snapshot();
            record.status = BuildStatus::Failed;
            record.completed_at = Some(Utc::now());
            if let Err(save) = self.inner.repository.save_build(&record) {
                error!(build_id = %build_id, error = %save, "Failed to record build failure");
            }
            return Err(Error::Io(e));
        }

        Ok(BuildResult::new(build_id, BuildStatus::Running))
    }

    /// Current state of a build.
    ///
    /// Builds of other tenants are `NotFound`.
    pub fn get_build(&self, tenant_id: &TenantId, build_id: &str) -> Result<BuildRecord> {
        if let Some(handle) = self.handle(tenant_id, build_id) {
            return Ok(handle.snapshot());
        }
        self.inner
            .repository
            .get_build(tenant_id, build_id)?
            .ok_or_else(|| Error::not_found("build", build_id))
    }

    /// Ask a running build to stop after its current batch.
    ///
    /// Cancelling a finished build is a no-op returning its record.
    pub fn cancel(&self, tenant_id: &TenantId, build_id: &str) -> Result<BuildRecord> {
        if let Some(handle) = self.handle(tenant_id, build_id) {
            handle.cancel.store(true, Ordering::SeqCst);
            info!(
                tenant_id = %tenant_id,
                build_id = %build_id,
                "Index build cancellation requested"
            );
            return Ok(handle.snapshot());
        }
        self.get_build(tenant_id, build_id)
    }

    /// Block until a build reaches a terminal state.
    ///
    /// # Errors
    ///
    /// `Timeout` when the build is still running after `timeout`.
    pub fn wait(
        &self,
        tenant_id: &TenantId,
        build_id: &str,
        timeout: Duration,
    ) -> Result<BuildRecord> {
        let deadline = Instant::now() + timeout;
        loop {
            let record = self.get_build(tenant_id, build_id)?;
            if record.status.is_terminal() {
                return Ok(record);
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout {
                    operation: "index build wait",
                    budget_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                });
            }
            thread::sleep(WAIT_POLL_INTERVAL);
        }
    }

    /// Id of the tenant's running build, if any.
    #[must_use]
    pub fn running_build(&self, tenant_id: &TenantId) -> Option<String> {
        self.inner
            .running
            .get(tenant_id)
            .map(|id| id.value().clone())
    }

    /// Most recently finished build of a tenant.
    pub fn last_build(&self, tenant_id: &TenantId) -> Result<Option<BuildRecord>> {
        self.inner.repository.last_build(tenant_id)
    }

    fn handle(&self, tenant_id: &TenantId, build_id: &str) -> Option<Arc<BuildHandle>> {
        let handle = self.inner.builds.get(build_id)?;
        let owned = handle.record.lock().tenant_id == *tenant_id;
        owned.then(|| Arc::clone(handle.value()))
    }

    fn next_build_id(&self) -> String {
        let seq = self.inner.sequence.fetch_add(1, Ordering::Relaxed);
        format!("build-{}-{seq}", Utc::now().timestamp_millis())
    }

    fn resolve_scans(&self, tenant_id: &TenantId, request: &BuildRequest) -> Result<Vec<ScanInfo>> {
        let scan_ids = request.scan_ids.as_deref().unwrap_or_default();
        let repository_ids = request.repository_ids.as_deref().unwrap_or_default();
        if scan_ids.is_empty() && repository_ids.is_empty() {
            return Err(Error::Validation(vec![ValidationIssue::new(
                ValidationCode::NoBuildTargets,
                "scanIds",
                "a build needs at least one scan or repository",
            )]));
        }

        let store = self.inner.store.as_ref();
        let mut scans = Vec::with_capacity(scan_ids.len() + repository_ids.len());
        for scan_id in scan_ids {
            scans.push(require_scan(store, tenant_id, scan_id)?);
        }
        for repository_id in repository_ids {
            let scan = store
                .latest_scan(tenant_id, repository_id)?
                .ok_or_else(|| Error::not_found("repository", repository_id.as_str()))?;
            scans.push(scan);
        }

        let mut seen = HashSet::new();
        scans.retain(|scan| seen.insert(scan.scan_id.clone()));
        Ok(scans)
    }
}

/// Run a build to completion and record the outcome.
fn finish(
    inner: &Inner,
    handle: &BuildHandle,
    scans: &[ScanInfo],
    _permit: ExecutionPermit,
    _slot: RunningSlot,
) -> BuildResult {
    let result = execute(inner, handle, scans);

    let mut record = handle.record.lock();
    record.status = result.status;
    record.partial_progress = result.partial_progress;
    record.result = Some(result.clone());
    record.completed_at = Some(Utc::now());
    if let Err(e) = inner.repository.save_build(&record) {
        error!(build_id = %record.build_id, error = %e, "Failed to persist build result");
    }
    info!(
        tenant_id = %record.tenant_id,
        build_id = %record.build_id,
        status = result.status.as_str(),
        scans_processed = result.scans_processed,
        entries_created = result.entries_created,
        duration_ms = result.duration_ms,
        "Index build finished"
    );
    result
}

fn execute(inner: &Inner, handle: &BuildHandle, scans: &[ScanInfo]) -> BuildResult {
    let started = Instant::now();
    let (build_id, tenant_id, request) = {
        let record = handle.record.lock();
        (
            record.build_id.clone(),
            record.tenant_id.clone(),
            record.request.clone(),
        )
    };
    let mut result = BuildResult::new(&build_id, BuildStatus::Running);

    let mut plans = Vec::with_capacity(scans.len());
    for scan in scans {
        match plan_scan(inner, &tenant_id, scan, &request, &mut result) {
            Ok(Some(plan)) => plans.push(plan),
            Ok(None) => {}
            Err(e) => {
                warn!(
                    build_id = %build_id,
                    scan_id = %scan.scan_id,
                    error = %e,
                    "Failed to read scan"
                );
                result.errors.push(BuildError::new(Some(&scan.scan_id), &e));
            }
        }
    }

    let total = plans.iter().map(|plan| plan.entries.len()).sum();
    let mut progress = PartialProgress { processed: 0, total };
    handle.set_progress(progress);
    let budget = inner.config.build_timeout(total);
    let deadline = started + budget;
    let batch_size = inner.repository.batch_size();
    let mut unique_objects: HashSet<&str> = HashSet::new();
    let mut touched = false;
    let mut cancelled = false;

    'scans: for plan in &plans {
        let scan_id = &plan.scan.scan_id;
        match inner
            .repository
            .delete_for_scan(&tenant_id, &plan.scan.repository_id, scan_id)
        {
            Ok(deleted) => {
                touched = true;
                debug!(
                    build_id = %build_id,
                    scan_id = %scan_id,
                    deleted,
                    "Cleared previous index rows"
                );
            }
            Err(e) => {
                result.errors.push(BuildError::new(Some(scan_id), &e));
                continue;
            }
        }

        let batches = plan
            .references
            .chunks(batch_size)
            .zip(plan.entries.chunks(batch_size));
        for (references, entries) in batches {
            if handle.cancel.load(Ordering::SeqCst) {
                cancelled = true;
                break 'scans;
            }
            if Instant::now() >= deadline {
                let timeout = Error::Timeout {
                    operation: "index build",
                    budget_ms: u64::try_from(budget.as_millis()).unwrap_or(u64::MAX),
                };
                warn!(
                    build_id = %build_id,
                    processed = progress.processed,
                    total,
                    "Index build timed out"
                );
                result.errors.push(BuildError::new(Some(scan_id), &timeout));
                break 'scans;
            }
            match inner.repository.write_batch(references, entries) {
                Ok((upserted, inserted)) => {
                    result.entries_created += inserted.inserted;
                    result.entries_updated += upserted.updated;
                    progress.processed += entries.len();
                    handle.set_progress(progress);
                    unique_objects.extend(entries.iter().map(|e| e.external_object_id.as_str()));
                }
                Err(e) => {
                    warn!(
                        build_id = %build_id,
                        scan_id = %scan_id,
                        error = %e,
                        "Index batch failed"
                    );
                    result.errors.push(BuildError::new(Some(scan_id), &e));
                    continue 'scans;
                }
            }
        }

        match inner.repository.mark_scan_indexed(
            &tenant_id,
            &plan.scan.repository_id,
            scan_id,
            plan.entries.len(),
        ) {
            Ok(()) => result.scans_processed += 1,
            Err(e) => result.errors.push(BuildError::new(Some(scan_id), &e)),
        }
    }

    if touched {
        inner.cache.invalidate_tenant(&tenant_id);
    }

    result.unique_objects_indexed = unique_objects.len();
    result.partial_progress = progress;
    result.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    result.status = if cancelled {
        result.warnings.push(format!(
            "cancelled after {} of {total} entries",
            progress.processed
        ));
        BuildStatus::Cancelled
    } else if result.errors.is_empty() {
        BuildStatus::Completed
    } else {
        BuildStatus::Failed
    };
    result
}

/// Extract the entries of one scan, or `None` when it is already indexed.
fn plan_scan(
    inner: &Inner,
    tenant_id: &TenantId,
    scan: &ScanInfo,
    request: &BuildRequest,
    result: &mut BuildResult,
) -> Result<Option<ScanPlan>> {
    if !request.force_full_rebuild && inner.repository.is_scan_indexed(tenant_id, &scan.scan_id)? {
        result
            .warnings
            .push(format!("scan {} already indexed, skipped", scan.scan_id));
        return Ok(None);
    }

    let nodes = inner.store.get_nodes_for_scan(tenant_id, &scan.scan_id)?;
    let now = Utc::now();
    let mut references = Vec::new();
    let mut entries = Vec::new();
    for node in &nodes {
        let extracted = extract_references(node);
        result.references_extracted += extracted.len();
        for reference in extracted {
            let parsed = reference.parsed;
            if !request.accepts(parsed.reference_type, reference.confidence) {
                continue;
            }
            entries.push(IndexEntry {
                tenant_id: tenant_id.clone(),
                node_id: node.id.clone(),
                external_object_id: parsed.normalized_id.clone(),
                scan_id: scan.scan_id.clone(),
                repository_id: scan.repository_id.clone(),
                reference_hash: parsed.reference_hash(),
                ref_type: parsed.reference_type,
                confidence: reference.confidence,
                context: Some(reference.context),
                created_at: now,
            });
            references.push(ExternalReference {
                external_id: reference.external_id,
                reference_type: parsed.reference_type,
                normalized_id: parsed.normalized_id,
                tenant_id: tenant_id.clone(),
                repository_id: scan.repository_id.clone(),
                scan_id: scan.scan_id.clone(),
                node_id: node.id.clone(),
                components: parsed.components,
                indexed_at: now,
            });
        }
    }
    result.nodes_processed += nodes.len();
    debug!(
        scan_id = %scan.scan_id,
        nodes = nodes.len(),
        entries = entries.len(),
        "Planned scan"
    );

    Ok(Some(ScanPlan {
        scan: scan.clone(),
        references,
        entries,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::db::Database;
    use crate::index::ReferenceType;
    use crate::store::MemoryGraphStore;
    use crate::types::{GraphNode, GraphSnapshot};
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    struct Fixture {
        store: Arc<MemoryGraphStore>,
        repository: Arc<IndexRepository>,
        manager: BuildManager,
    }

    fn fixture_with(config: IndexConfig, max_executions: usize) -> Fixture {
        let store = Arc::new(MemoryGraphStore::new());
        let db = Arc::new(Database::open_in_memory().unwrap());
        let repository = Arc::new(IndexRepository::new(db, 2));
        let cache = Arc::new(LookupCache::new(&CacheConfig::default(), None));
        let manager = BuildManager::new(
            Arc::clone(&store) as Arc<dyn GraphStore>,
            Arc::clone(&repository),
            cache,
            config,
            ExecutionLimiter::new(max_executions),
        );
        Fixture {
            store,
            repository,
            manager,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(IndexConfig::default(), 5)
    }

    fn bucket(id: &str, name: &str) -> GraphNode {
        GraphNode::new(id, "aws_s3_bucket", name, "", "")
            .with_attribute("arn", json!(format!("arn:aws:s3:::{name}")))
            .with_attribute("vpc", json!("vpc-0a1b2c3d"))
    }

    fn seed(store: &MemoryGraphStore) {
        store.insert_snapshot_at(
            GraphSnapshot::new("acme", "infra", "scan-1")
                .with_node(bucket("n1", "logs"))
                .with_node(bucket("n2", "assets"))
                .with_node(GraphNode::new("n3", "aws_iam_role", "deployer", "", "")),
            Utc::now() - ChronoDuration::minutes(5),
        );
        store.insert_snapshot(
            GraphSnapshot::new("acme", "infra", "scan-2").with_node(bucket("n4", "logs")),
        );
    }

    #[test]
    fn synchronous_build_indexes_scans() {
        let f = fixture();
        seed(&f.store);

        let result = f
            .manager
            .start(&"acme".into(), BuildRequest::for_scans(vec!["scan-1".into()]))
            .unwrap();

        assert_eq!(result.status, BuildStatus::Completed);
        assert_eq!(result.nodes_processed, 3);
        assert_eq!(result.references_extracted, 4);
        assert_eq!(result.entries_created, 4);
        assert_eq!(result.unique_objects_indexed, 3);
        assert_eq!(result.scans_processed, 1);
        assert_eq!(result.partial_progress, PartialProgress { processed: 4, total: 4 });
        assert!(f.repository.is_scan_indexed(&"acme".into(), &"scan-1".into()).unwrap());
        assert!(f.manager.running_build(&"acme".into()).is_none());
    }

    #[test]
    fn repositories_resolve_to_latest_scan() {
        let f = fixture();
        seed(&f.store);

        let result = f
            .manager
            .start(&"acme".into(), BuildRequest::for_repositories(vec!["infra".into()]))
            .unwrap();

        assert_eq!(result.scans_processed, 1);
        assert!(f.repository.is_scan_indexed(&"acme".into(), &"scan-2".into()).unwrap());
        assert!(!f.repository.is_scan_indexed(&"acme".into(), &"scan-1".into()).unwrap());
    }

    #[test]
    fn indexed_scans_are_skipped_unless_forced() {
        let f = fixture();
        seed(&f.store);
        let tenant = TenantId::from("acme");
        let request = BuildRequest::for_scans(vec!["scan-1".into()]);
        f.manager.start(&tenant, request.clone()).unwrap();

        let skipped = f.manager.start(&tenant, request.clone()).unwrap();
        assert_eq!(skipped.scans_processed, 0);
        assert_eq!(skipped.warnings.len(), 1);

        let forced = f
            .manager
            .start(
                &tenant,
                BuildRequest {
                    force_full_rebuild: true,
                    ..request
                },
            )
            .unwrap();
        assert_eq!(forced.scans_processed, 1);
        assert_eq!(forced.entries_created, 4);
        assert_eq!(forced.entries_updated, 0);
    }

    #[test]
    fn type_and_confidence_filters_apply() {
        let f = fixture();
        seed(&f.store);

        let result = f
            .manager
            .start(
                &"acme".into(),
                BuildRequest {
                    include_types: Some(vec![ReferenceType::Arn]),
                    ..BuildRequest::for_scans(vec!["scan-1".into()])
                },
            )
            .unwrap();
        assert_eq!(result.entries_created, 2);

        let strict = f
            .manager
            .start(
                &"acme".into(),
                BuildRequest {
                    min_confidence: 0.9,
                    force_full_rebuild: true,
                    ..BuildRequest::for_scans(vec!["scan-1".into()])
                },
            )
            .unwrap();
        // the vpc attribute is not a well-known key
        assert_eq!(strict.entries_created, 2);
    }

    #[test]
    fn other_tenants_scans_are_not_found() {
        let f = fixture();
        seed(&f.store);

        let err = f
            .manager
            .start(&"globex".into(), BuildRequest::for_scans(vec!["scan-1".into()]))
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { resource: "scan", .. }));

        let err = f
            .manager
            .start(&"globex".into(), BuildRequest::for_repositories(vec!["infra".into()]))
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { resource: "repository", .. }));
    }

    #[test]
    fn empty_request_is_rejected() {
        let f = fixture();
        let err = f
            .manager
            .start(&"acme".into(), BuildRequest::default())
            .unwrap_err();
        let Error::Validation(issues) = err else {
            panic!("expected validation error");
        };
        assert_eq!(issues[0].code, ValidationCode::NoBuildTargets);
    }

    #[test]
    fn one_running_build_per_tenant() {
        let f = fixture();
        seed(&f.store);
        let tenant = TenantId::from("acme");
        f.manager
            .inner
            .running
            .insert(tenant.clone(), "build-busy".to_string());

        let err = f
            .manager
            .start(&tenant, BuildRequest::for_scans(vec!["scan-1".into()]))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::BuildAlreadyRunning { ref build_id } if build_id == "build-busy"
        ));
    }

    #[test]
    fn execution_limit_releases_running_slot() {
        let f = fixture_with(IndexConfig::default(), 0);
        seed(&f.store);
        let tenant = TenantId::from("acme");

        let err = f
            .manager
            .start(&tenant, BuildRequest::for_scans(vec!["scan-1".into()]))
            .unwrap_err();

        assert!(matches!(err, Error::LimitExceeded { .. }));
        assert!(f.manager.running_build(&tenant).is_none());
    }

    #[test]
    fn async_build_can_be_polled() {
        let f = fixture();
        seed(&f.store);
        let tenant = TenantId::from("acme");

        let started = f
            .manager
            .start(
                &tenant,
                BuildRequest {
                    run_async: true,
                    ..BuildRequest::for_scans(vec!["scan-1".into(), "scan-2".into()])
                },
            )
            .unwrap();
        assert_eq!(started.status, BuildStatus::Running);

        let record = f
            .manager
            .wait(&tenant, &started.build_id, Duration::from_secs(10))
            .unwrap();
        assert_eq!(record.status, BuildStatus::Completed);
        assert_eq!(record.result.unwrap().scans_processed, 2);
        assert!(f.manager.get_build(&"globex".into(), &started.build_id).is_err());
        assert_eq!(
            f.manager.last_build(&tenant).unwrap().unwrap().build_id,
            started.build_id
        );
    }

    #[test]
    fn cancelled_build_keeps_committed_batches() {
        let f = fixture();
        seed(&f.store);
        let tenant = TenantId::from("acme");
        let scans = vec![require_scan(f.store.as_ref(), &tenant, &"scan-1".into()).unwrap()];
        let handle = BuildHandle {
            record: Mutex::new(BuildRecord {
                build_id: "build-x".to_string(),
                tenant_id: tenant.clone(),
                status: BuildStatus::Running,
                request: BuildRequest::for_scans(vec!["scan-1".into()]),
                result: None,
                partial_progress: PartialProgress::default(),
                started_at: Utc::now(),
                completed_at: None,
            }),
            cancel: AtomicBool::new(true),
        };

        let result = execute(&f.manager.inner, &handle, &scans);

        assert_eq!(result.status, BuildStatus::Cancelled);
        assert_eq!(result.partial_progress, PartialProgress { processed: 0, total: 4 });
        assert!(!f.repository.is_scan_indexed(&tenant, &"scan-1".into()).unwrap());
    }

    #[test]
    fn build_timeout_fails_between_batches() {
        let config = IndexConfig {
            build_timeout_secs: Some(0),
            ..IndexConfig::default()
        };
        let f = fixture_with(config, 5);
        seed(&f.store);

        let result = f
            .manager
            .start(&"acme".into(), BuildRequest::for_scans(vec!["scan-1".into()]))
            .unwrap();

        assert_eq!(result.status, BuildStatus::Failed);
        assert_eq!(result.errors[0].code, "TIMEOUT");
        assert_eq!(result.partial_progress.total, 4);
    }

    #[test]
    fn finished_builds_survive_the_registry() {
        let f = fixture();
        seed(&f.store);
        let tenant = TenantId::from("acme");
        let result = f
            .manager
            .start(&tenant, BuildRequest::for_scans(vec!["scan-1".into()]))
            .unwrap();

        let record = f.manager.get_build(&tenant, &result.build_id).unwrap();
        let cancelled = f.manager.cancel(&tenant, &result.build_id).unwrap();

        assert_eq!(record.status, BuildStatus::Completed);
        assert_eq!(cancelled.status, BuildStatus::Completed);
        assert!(matches!(
            f.manager.get_build(&tenant, "build-missing"),
            Err(Error::NotFound { resource: "build", .. })
        ));
    }
}

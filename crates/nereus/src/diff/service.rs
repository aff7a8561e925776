//! Tenant-scoped diff orchestration over the graph store.

use std::sync::Arc;
use std::thread;
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use super::{
    CacheInfo, CostEstimate, DiffCache, DiffOptions, DiffResult, GraphDiffEngine, SnapshotSize,
    diff_id,
};
use crate::error::{Error, ErrorPayload, Result};
use crate::limiter::ExecutionLimiter;
use crate::store::{GraphStore, require_scan, require_snapshot};
use crate::types::{GraphSnapshot, RepositoryId, ScanId, TenantId};

/// A diff request between two scans of one tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffRequest {
    /// Scan the diff starts from.
    pub base_scan_id: ScanId,
    /// Scan the diff ends at.
    pub compare_scan_id: ScanId,
    /// Both scans must belong to this repository.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository_id: Option<RepositoryId>,
    /// Options; engine defaults when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<DiffOptions>,
    /// Ignore and replace any cached result.
    #[serde(default)]
    pub force_recompute: bool,
    /// Return immediately and compute in the background.
    #[serde(default, rename = "async")]
    pub run_async: bool,
}

impl DiffRequest {
    /// Synchronous diff with default options.
    pub fn new(base_scan_id: impl Into<ScanId>, compare_scan_id: impl Into<ScanId>) -> Self {
        Self {
            base_scan_id: base_scan_id.into(),
            compare_scan_id: compare_scan_id.into(),
            repository_id: None,
            options: None,
            force_recompute: false,
            run_async: false,
        }
    }

    /// Require both scans to belong to `repository_id`.
    #[must_use]
    pub fn with_repository(mut self, repository_id: impl Into<RepositoryId>) -> Self {
        self.repository_id = Some(repository_id.into());
        self
    }

    /// Use explicit options.
    #[must_use]
    pub fn with_options(mut self, options: DiffOptions) -> Self {
        self.options = Some(options);
        self
    }

    /// Bypass the cache.
    #[must_use]
    pub fn force_recompute(mut self) -> Self {
        self.force_recompute = true;
        self
    }

    /// Compute in the background.
    #[must_use]
    pub fn asynchronous(mut self) -> Self {
        self.run_async = true;
        self
    }
}

/// What a diff request produced.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DiffOutcome {
    /// The result is available now.
    #[serde(rename_all = "camelCase")]
    Completed {
        /// The diff.
        result: Arc<DiffResult>,
        /// Served from the cache rather than computed.
        from_cache: bool,
        /// Cache bookkeeping of the served or freshly stored result.
        cache_info: CacheInfo,
    },
    /// The diff is being computed; poll with [`DiffService::get_diff`].
    #[serde(rename_all = "camelCase")]
    Pending {
        /// Id to poll.
        diff_id: String,
        /// Predicted computation time.
        estimated_time_ms: u64,
    },
}

impl DiffOutcome {
    /// The result, when completed.
    #[must_use]
    pub fn result(&self) -> Option<&DiffResult> {
        match self {
            Self::Completed { result, .. } => Some(result),
            Self::Pending { .. } => None,
        }
    }
}

/// State of a diff job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffJobStatus {
    /// Still computing.
    Pending,
    /// Result available.
    Completed,
    /// Computation failed.
    Failed,
}

/// Answer to a poll for a diff.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffStatus {
    /// Diff being polled.
    pub diff_id: String,
    /// Job state.
    pub status: DiffJobStatus,
    /// Result once completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Arc<DiffResult>>,
    /// Failure once failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
    /// When the background job started, while it runs or after it failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
enum Job {
    Pending { started_at: DateTime<Utc> },
    Failed { started_at: DateTime<Utc>, error: ErrorPayload },
}

/// Loads snapshots, serves cached diffs and computes fresh ones.
pub struct DiffService {
    store: Arc<dyn GraphStore>,
    engine: GraphDiffEngine,
    cache: Arc<DiffCache>,
    jobs: Arc<DashMap<String, Job>>,
    limiter: ExecutionLimiter,
}

impl DiffService {
    /// Create a service over `store`.
    pub fn new(
        store: Arc<dyn GraphStore>,
        engine: GraphDiffEngine,
        cache: Arc<DiffCache>,
        limiter: ExecutionLimiter,
    ) -> Self {
        Self {
            store,
            engine,
            cache,
            jobs: Arc::new(DashMap::new()),
            limiter,
        }
    }

    /// The underlying engine.
    #[must_use]
    pub fn engine(&self) -> &GraphDiffEngine {
        &self.engine
    }

    fn job_key(tenant_id: &TenantId, diff_id: &str) -> String {
        format!("{}:{diff_id}", tenant_id.key_segment())
    }

    fn load_pair(
        &self,
        tenant_id: &TenantId,
        request: &DiffRequest,
    ) -> Result<(GraphSnapshot, GraphSnapshot)> {
        let base = require_snapshot(self.store.as_ref(), tenant_id, &request.base_scan_id)?;
        let target = require_snapshot(self.store.as_ref(), tenant_id, &request.compare_scan_id)?;
        if let Some(repository_id) = &request.repository_id {
            for snapshot in [&base, &target] {
                if snapshot.repository_id != *repository_id {
                    return Err(Error::not_found("scan", snapshot.scan_id.as_str()));
                }
            }
        }
        Ok((base, target))
    }

    /// Run a diff request.
    pub fn diff(&self, tenant_id: &TenantId, request: &DiffRequest) -> Result<DiffOutcome> {
        let (base, target) = self.load_pair(tenant_id, request)?;
        let options = request
            .options
            .clone()
            .unwrap_or_else(|| self.engine.default_options());
        let id = diff_id(&base.scan_id, &target.scan_id, &options);

        if request.force_recompute {
            self.cache.remove(tenant_id, &id);
        } else if let Some((result, cache_info)) = self.cache.get(tenant_id, &id) {
            debug!(tenant_id = %tenant_id, diff_id = %id, "Diff served from cache");
            return Ok(DiffOutcome::Completed {
                result,
                from_cache: true,
                cache_info,
            });
        }

        let key = Self::job_key(tenant_id, &id);
        let estimate = self.engine.estimate_cost(
            SnapshotSize {
                nodes: base.nodes.len(),
                edges: base.edges.len(),
            },
            SnapshotSize {
                nodes: target.nodes.len(),
                edges: target.edges.len(),
            },
            &options,
        );
        let already_pending = matches!(self.jobs.get(&key).as_deref(), Some(Job::Pending { .. }));
        if request.run_async && already_pending {
            return Ok(DiffOutcome::Pending {
                diff_id: id,
                estimated_time_ms: estimate.estimated_time_ms,
            });
        }

        let permit = self.limiter.acquire(tenant_id)?;

        if !request.run_async {
            let start = Instant::now();
            let result = Arc::new(self.engine.compute_diff(&base, &target, &options)?);
            drop(permit);
            let cache_info = self.cache.insert(tenant_id, Arc::clone(&result));
            self.jobs.remove(&key);
            info!(
                tenant_id = %tenant_id,
                diff_id = %id,
                changes = result.summary.nodes.changes() + result.summary.edges.changes(),
                elapsed_ms = start.elapsed().as_millis(),
                "Computed diff"
            );
            return Ok(DiffOutcome::Completed {
                result,
                from_cache: false,
                cache_info,
            });
        }

        let started_at = Utc::now();
        self.jobs.insert(key.clone(), Job::Pending { started_at });
        let engine = self.engine.clone();
        let cache = Arc::clone(&self.cache);
        let jobs = Arc::clone(&self.jobs);
        let tenant = tenant_id.clone();
        let job_diff_id = id.clone();
        let spawned = thread::Builder::new()
            .name(id.clone())
            .spawn(move || {
                let _permit = permit;
                match engine.compute_diff(&base, &target, &options) {
                    Ok(result) => {
                        cache.insert(&tenant, Arc::new(result));
                        jobs.remove(&key);
                        info!(
                            tenant_id = %tenant,
                            diff_id = %job_diff_id,
                            "Background diff completed"
                        );
                    }
                    Err(e) => {
                        error!(
                            tenant_id = %tenant,
                            diff_id = %job_diff_id,
                            error = %e,
                            "Background diff failed"
                        );
                        jobs.insert(
                            key,
                            Job::Failed {
                                started_at,
                                error: e.to_payload(),
                            },
                        );
                    }
                }
            });
        if let Err(e) = spawned {
            self.jobs.remove(&Self::job_key(tenant_id, &id));
            return Err(Error::Io(e));
        }

        Ok(DiffOutcome::Pending {
            diff_id: id,
            estimated_time_ms: estimate.estimated_time_ms,
        })
    }

    /// Poll a diff by id.
    ///
    /// Diffs of other tenants, unknown ids and expired results are `NotFound`.
    pub fn get_diff(&self, tenant_id: &TenantId, diff_id: &str) -> Result<DiffStatus> {
        let job = self
            .jobs
            .get(&Self::job_key(tenant_id, diff_id))
            .map(|job| job.value().clone());
        if let Some(job) = job {
            let (status, started_at, error) = match job {
                Job::Pending { started_at } => (DiffJobStatus::Pending, started_at, None),
                Job::Failed { started_at, error } => {
                    (DiffJobStatus::Failed, started_at, Some(error))
                }
            };
            return Ok(DiffStatus {
                diff_id: diff_id.to_string(),
                status,
                result: None,
                error,
                started_at: Some(started_at),
            });
        }
        match self.cache.get(tenant_id, diff_id) {
            Some((result, _)) => Ok(DiffStatus {
                diff_id: diff_id.to_string(),
                status: DiffJobStatus::Completed,
                result: Some(result),
                error: None,
                started_at: None,
            }),
            None => Err(Error::not_found("diff", diff_id)),
        }
    }

    /// Predict the cost of diffing two scans from the store's counts.
    pub fn estimate_cost(
        &self,
        tenant_id: &TenantId,
        base_scan_id: &ScanId,
        compare_scan_id: &ScanId,
        options: Option<&DiffOptions>,
    ) -> Result<CostEstimate> {
        let store = self.store.as_ref();
        require_scan(store, tenant_id, base_scan_id)?;
        require_scan(store, tenant_id, compare_scan_id)?;
        let size = |scan_id: &ScanId| -> Result<SnapshotSize> {
            Ok(SnapshotSize {
                nodes: store.count_nodes(tenant_id, scan_id, None)?,
                edges: store.count_edges(tenant_id, scan_id, None)?,
            })
        };
        let defaults;
        let options = match options {
            Some(options) => options,
            None => {
                defaults = self.engine.default_options();
                &defaults
            }
        };
        Ok(self
            .engine
            .estimate_cost(size(base_scan_id)?, size(compare_scan_id)?, options))
    }
}

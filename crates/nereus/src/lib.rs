//! # Nereus: Cross-Repository Infrastructure Graph Engine
//!
//! Nereus takes the per-repository dependency graphs produced by an
//! infrastructure scanner (Terraform, Helm, Kubernetes, CI pipelines, Argo CD)
//! and answers questions that span repositories:
//!
//! - **Rollups**: match the same real resource across repositories and merge
//!   the graphs into one ([`matcher`], [`merge`], [`rollup`])
//! - **Diffs**: what changed between two scans of a repository ([`diff`])
//! - **External object index**: which nodes, in which repositories, refer to
//!   a given ARN or resource id ([`index`])
//! - **Blast radius**: what is impacted when a node changes ([`blast`])
//!
//! ## Design Philosophy
//!
//! - **Read-only over graphs** - scans are imported once; every engine reads
//!   them through the [`GraphStore`] seam
//! - **Tenant isolation** - every operation takes a [`TenantId`]; resources
//!   of another tenant are indistinguishable from absent ones
//! - **Embeddable** - library first, CLI second
//!
//! ## Quick Start
//!
//! ```no_run
//! use nereus::{DiffRequest, Nereus, NereusConfig, TenantId};
//! use std::path::Path;
//!
//! let nereus = Nereus::open(Path::new(".nereus"), NereusConfig::default())?;
//! let tenant = TenantId::from("acme");
//!
//! let outcome = nereus.diffs().diff(&tenant, &DiffRequest::new("scan-1", "scan-2"))?;
//! if let Some(result) = outcome.result() {
//!     println!("{} nodes added", result.summary.nodes.added);
//! }
//! # Ok::<(), nereus::Error>(())
//! ```

pub mod blast;
pub mod config;
mod db;
pub mod diff;
mod error;
pub mod identity;
pub mod index;
mod limiter;
pub mod matcher;
pub mod merge;
pub mod rollup;
pub mod store;
mod types;
pub mod validation;

pub use blast::{BlastRadius, BlastRadiusOptions, DependencyGraph, Tool, calculate_blast_radius};
pub use config::NereusConfig;
pub use db::Database;
pub use diff::{DiffOutcome, DiffRequest, DiffResult, DiffService, GraphDiffEngine};
pub use error::{Error, ErrorPayload, LimitType, Result};
pub use index::IndexService;
pub use limiter::{ExecutionLimiter, ExecutionPermit};
pub use rollup::{RollupExecution, RollupInput, RollupService};
pub use store::{GraphStore, ImportStats, MemoryGraphStore, SqliteGraphStore};
pub use types::{
    Attributes, EdgeId, ExecutionId, GraphEdge, GraphNode, GraphSnapshot, NodeId, RepositoryId,
    RollupId, ScanId, ScanInfo, TenantId,
};
pub use validation::{ValidationCode, ValidationIssue, ValidationResult};

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;

use config::DATABASE_FILE_NAME;
use diff::DiffCache;
use index::{DistributedCache, InMemoryDistributedCache};
use rollup::RollupRepository;

/// Every Nereus service wired to one database.
///
/// The graph store, the external object index and the rollup tables share a
/// single `SQLite` file. One [`ExecutionLimiter`] caps concurrent rollup
/// executions, diffs and index builds per tenant across all services.
pub struct Nereus {
    config: NereusConfig,
    db: Arc<Database>,
    store: Arc<SqliteGraphStore>,
    limiter: ExecutionLimiter,
    index: IndexService,
    diffs: DiffService,
    rollups: RollupService,
}

impl std::fmt::Debug for Nereus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Nereus")
            .field("db", &self.db.path())
            .field("limiter", &self.limiter)
            .finish_non_exhaustive()
    }
}

impl Nereus {
    /// Open (or create) the database in `data_dir`.
    pub fn open(data_dir: &Path, config: NereusConfig) -> Result<Self> {
        let db = Database::open(&data_dir.join(DATABASE_FILE_NAME))?;
        info!(data_dir = %data_dir.display(), "Opened Nereus database");
        Self::with_database(Arc::new(db), config)
    }

    /// Run entirely in memory.
    pub fn open_in_memory(config: NereusConfig) -> Result<Self> {
        Self::with_database(Arc::new(Database::open_in_memory()?), config)
    }

    /// Wire every service to an already opened database.
    pub fn with_database(db: Arc<Database>, config: NereusConfig) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(SqliteGraphStore::new(Arc::clone(&db)));
        let graphs = Arc::clone(&store) as Arc<dyn GraphStore>;
        let limiter = ExecutionLimiter::new(config.limits.max_concurrent_executions);

        let l2: Arc<dyn DistributedCache> =
            Arc::new(InMemoryDistributedCache::new(config.cache.l2_max_entries));
        let index = IndexService::new(
            Arc::clone(&graphs),
            Arc::clone(&db),
            &config.cache,
            config.index.clone(),
            Some(l2),
            limiter.clone(),
        );
        let diffs = DiffService::new(
            Arc::clone(&graphs),
            GraphDiffEngine::new(config.diff.clone()),
            Arc::new(DiffCache::new(
                config.diff.cache_capacity,
                std::time::Duration::from_secs(config.diff.cache_ttl_secs),
            )),
            limiter.clone(),
        );
        let rollups = RollupService::new(
            graphs,
            RollupRepository::new(Arc::clone(&db)),
            config.limits.clone(),
            limiter.clone(),
        );

        Ok(Self {
            config,
            db,
            store,
            limiter,
            index,
            diffs,
            rollups,
        })
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &NereusConfig {
        &self.config
    }

    /// The shared database.
    #[must_use]
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// The graph store.
    #[must_use]
    pub fn store(&self) -> &SqliteGraphStore {
        &self.store
    }

    /// The shared per-tenant execution limiter.
    #[must_use]
    pub fn limiter(&self) -> &ExecutionLimiter {
        &self.limiter
    }

    /// External object index.
    #[must_use]
    pub fn index(&self) -> &IndexService {
        &self.index
    }

    /// Diff service.
    #[must_use]
    pub fn diffs(&self) -> &DiffService {
        &self.diffs
    }

    /// Rollup service.
    #[must_use]
    pub fn rollups(&self) -> &RollupService {
        &self.rollups
    }

    /// Store a scan export, replacing an earlier import of the same scan.
    ///
    /// Index entries of a replaced scan are dropped; rebuild the index for
    /// the scan to pick up its new references.
    pub fn import_snapshot(
        &self,
        snapshot: &GraphSnapshot,
        created_at: Option<DateTime<Utc>>,
    ) -> Result<ImportStats> {
        let stats = self.store.import_snapshot(snapshot, created_at)?;
        if stats.replaced {
            self.index.delete_for_scan(
                &snapshot.tenant_id,
                &snapshot.repository_id,
                &snapshot.scan_id,
            )?;
        }
        Ok(stats)
    }

    /// Blast radius of `source` within one scan of the tenant.
    pub fn blast_radius(
        &self,
        tenant_id: &TenantId,
        scan_id: &ScanId,
        source: &NodeId,
        options: &BlastRadiusOptions,
    ) -> Result<BlastRadius> {
        let snapshot = store::require_snapshot(self.store.as_ref(), tenant_id, scan_id)?;
        calculate_blast_radius(&snapshot, source, options)
    }
}

//! Index records, pagination and API results.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::extract::ReferenceType;
use crate::error::Error;
use crate::types::{GraphNode, NodeId, RepositoryId, ScanId, TenantId};

/// One external identifier referenced by one node of one scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalReference {
    /// Identifier as written on the node.
    pub external_id: String,
    /// Kind of identifier.
    pub reference_type: ReferenceType,
    /// Canonical identifier.
    pub normalized_id: String,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Repository of the node.
    pub repository_id: RepositoryId,
    /// Scan of the node.
    pub scan_id: ScanId,
    /// Referencing node.
    pub node_id: NodeId,
    /// Named parts of the identifier.
    pub components: BTreeMap<String, String>,
    /// When the reference was (re)indexed.
    pub indexed_at: DateTime<Utc>,
}

/// Junction row between a node and an external object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexEntry {
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Referencing node.
    pub node_id: NodeId,
    /// Normalized external identifier.
    pub external_object_id: String,
    /// Scan of the node.
    pub scan_id: ScanId,
    /// Repository of the node.
    pub repository_id: RepositoryId,
    /// Hash of the reference type and the normalized identifier.
    pub reference_hash: String,
    /// Kind of identifier.
    pub ref_type: ReferenceType,
    /// Extraction confidence, 0.0..=1.0.
    pub confidence: f64,
    /// Attribute path the identifier was found at.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// When the row was written.
    pub created_at: DateTime<Utc>,
}

/// Outcome of a bulk junction insert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertStats {
    /// Rows written.
    pub inserted: usize,
    /// Rows that already existed.
    pub skipped: usize,
}

/// Outcome of a reference upsert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertStats {
    /// New references.
    pub created: usize,
    /// References that existed and were refreshed.
    pub updated: usize,
}

/// Allow-listed sort columns of paginated index queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    /// Insertion time.
    #[default]
    CreatedAt,
    /// Extraction confidence.
    Confidence,
    /// Reference type.
    RefType,
}

impl SortField {
    pub(crate) fn column(self) -> &'static str {
        match self {
            Self::CreatedAt => "created_at",
            Self::Confidence => "confidence",
            Self::RefType => "ref_type",
        }
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    /// Smallest first.
    Asc,
    /// Largest first.
    #[default]
    Desc,
}

impl SortOrder {
    pub(crate) fn keyword(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// Page selection for index queries. Pages are 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Pagination {
    /// Page number, starting at 1.
    pub page: usize,
    /// Rows per page.
    pub page_size: usize,
    /// Sort column.
    pub sort: SortField,
    /// Sort direction.
    pub order: SortOrder,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: Self::DEFAULT_PAGE_SIZE,
            sort: SortField::default(),
            order: SortOrder::default(),
        }
    }
}

impl Pagination {
    /// Rows per page when unspecified.
    pub const DEFAULT_PAGE_SIZE: usize = 50;

    /// Largest page a caller may ask for.
    pub const MAX_PAGE_SIZE: usize = 1_000;

    /// Page `page` of `page_size` rows, default sort.
    #[must_use]
    pub fn new(page: usize, page_size: usize) -> Self {
        Self {
            page,
            page_size,
            ..Self::default()
        }
    }

    /// Sort by `sort` in `order`.
    #[must_use]
    pub fn sorted_by(mut self, sort: SortField, order: SortOrder) -> Self {
        self.sort = sort;
        self.order = order;
        self
    }

    pub(crate) fn limit(&self) -> usize {
        self.page_size.clamp(1, Self::MAX_PAGE_SIZE)
    }

    pub(crate) fn offset(&self) -> usize {
        self.page.max(1).saturating_sub(1).saturating_mul(self.limit())
    }
}

/// One page of index entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryPage {
    /// Entries on this page.
    pub entries: Vec<IndexEntry>,
    /// Matching entries across all pages.
    pub total: usize,
}

/// Forward lookup of one external identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LookupRequest {
    /// Identifier to look up, in any case.
    pub external_id: String,
    /// Its kind.
    pub external_type: ReferenceType,
    /// Restrict to one repository.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository_id: Option<RepositoryId>,
    /// Load the referencing nodes from the graph store.
    #[serde(default)]
    pub include_node_details: bool,
}

impl LookupRequest {
    /// Look up `external_id` of kind `external_type`.
    pub fn new(external_id: impl Into<String>, external_type: ReferenceType) -> Self {
        Self {
            external_id: external_id.into(),
            external_type,
            repository_id: None,
            include_node_details: false,
        }
    }

    /// Also return the referencing nodes.
    #[must_use]
    pub fn with_node_details(mut self) -> Self {
        self.include_node_details = true;
        self
    }

    /// Restrict to one repository.
    #[must_use]
    pub fn in_repository(mut self, repository_id: impl Into<RepositoryId>) -> Self {
        self.repository_id = Some(repository_id.into());
        self
    }
}

/// Nodes referencing an external identifier.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LookupResult {
    /// Identifier that was looked up.
    pub external_id: String,
    /// At least one node references it.
    pub found: bool,
    /// Referencing nodes.
    pub node_ids: Vec<NodeId>,
    /// Scans of the referencing nodes.
    pub scan_ids: Vec<ScanId>,
    /// Repositories of the referencing nodes.
    pub repository_ids: Vec<RepositoryId>,
    /// Number of junction rows.
    pub reference_count: usize,
    /// Earliest junction row.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_seen: Option<DateTime<Utc>>,
    /// Latest junction row.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
    /// Referencing nodes, when requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes: Option<Vec<GraphNode>>,
}

/// Answer to a batch lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchLookupResult {
    /// One result per request, in request order.
    pub results: Vec<LookupResult>,
    /// Requests with at least one node.
    pub found: usize,
    /// Requests without nodes.
    pub not_found: usize,
    /// Wall time of the batch.
    pub processing_time_ms: f64,
}

/// Reverse lookup: external objects referenced by one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReverseLookupRequest {
    /// Scan of the node.
    pub scan_id: ScanId,
    /// The node.
    pub node_id: NodeId,
    /// Only these reference types.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub types: Option<Vec<ReferenceType>>,
    /// Only references at least this confident.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_confidence: Option<f64>,
    /// Page selection.
    #[serde(default)]
    pub pagination: Pagination,
}

impl ReverseLookupRequest {
    /// First page of every reference of `node_id`.
    pub fn new(scan_id: impl Into<ScanId>, node_id: impl Into<NodeId>) -> Self {
        Self {
            scan_id: scan_id.into(),
            node_id: node_id.into(),
            types: None,
            min_confidence: None,
            pagination: Pagination::default(),
        }
    }
}

/// An external object referenced by a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalObjectRef {
    /// Normalized identifier.
    pub external_object_id: String,
    /// Kind of identifier.
    pub ref_type: ReferenceType,
    /// Extraction confidence.
    pub confidence: f64,
    /// Attribute path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// Lookup key.
    pub reference_hash: String,
}

/// Answer to a reverse lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReverseLookupResult {
    /// The node.
    pub node_id: NodeId,
    /// Its scan.
    pub scan_id: ScanId,
    /// Referenced objects on this page.
    pub external_objects: Vec<ExternalObjectRef>,
    /// Matching objects across all pages.
    pub total_count: usize,
    /// Matching objects per reference type, across all pages.
    pub count_by_type: BTreeMap<ReferenceType, usize>,
}

/// Build lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    /// Accepted, not started.
    Pending,
    /// In progress.
    Running,
    /// Finished.
    Completed,
    /// Stopped by an error or the timeout.
    Failed,
    /// Stopped on request.
    Cancelled,
}

impl BuildStatus {
    /// Stored representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// No further progress will happen.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// What to index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BuildRequest {
    /// Explicit scans to index.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scan_ids: Option<Vec<ScanId>>,
    /// Index the latest scan of each repository.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository_ids: Option<Vec<RepositoryId>>,
    /// Re-index scans that are already indexed.
    pub force_full_rebuild: bool,
    /// Only these reference types.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub include_types: Option<Vec<ReferenceType>>,
    /// Never these reference types.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exclude_types: Option<Vec<ReferenceType>>,
    /// Drop references below this confidence.
    pub min_confidence: f64,
    /// Run on a background thread.
    #[serde(rename = "async")]
    pub run_async: bool,
}

impl Default for BuildRequest {
    fn default() -> Self {
        Self {
            scan_ids: None,
            repository_ids: None,
            force_full_rebuild: false,
            include_types: None,
            exclude_types: None,
            min_confidence: 0.5,
            run_async: true,
        }
    }
}

impl BuildRequest {
    /// Synchronously index the given scans.
    #[must_use]
    pub fn for_scans(scan_ids: Vec<ScanId>) -> Self {
        Self {
            scan_ids: Some(scan_ids),
            run_async: false,
            ..Self::default()
        }
    }

    /// Synchronously index the latest scan of each repository.
    #[must_use]
    pub fn for_repositories(repository_ids: Vec<RepositoryId>) -> Self {
        Self {
            repository_ids: Some(repository_ids),
            run_async: false,
            ..Self::default()
        }
    }

    pub(crate) fn accepts(&self, reference_type: ReferenceType, confidence: f64) -> bool {
        self.include_types
            .as_ref()
            .is_none_or(|types| types.contains(&reference_type))
            && !self
                .exclude_types
                .as_ref()
                .is_some_and(|types| types.contains(&reference_type))
            && confidence >= self.min_confidence
    }
}

/// Work done so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialProgress {
    /// Junction entries written or skipped.
    pub processed: usize,
    /// Junction entries planned.
    pub total: usize,
}

/// A failure recorded by a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildError {
    /// Scan being indexed, if the failure is scoped to one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scan_id: Option<ScanId>,
    /// Stable error code.
    pub code: String,
    /// Caller-safe message.
    pub message: String,
}

impl BuildError {
    pub(crate) fn new(scan_id: Option<&ScanId>, error: &Error) -> Self {
        let payload = error.to_payload();
        Self {
            scan_id: scan_id.cloned(),
            code: payload.code.to_string(),
            message: payload.message,
        }
    }
}

/// Outcome of an index build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildResult {
    /// Build identifier.
    pub build_id: String,
    /// Final or current state.
    pub status: BuildStatus,
    /// Nodes examined.
    pub nodes_processed: usize,
    /// References extracted before filtering duplicates.
    pub references_extracted: usize,
    /// Distinct external objects written.
    pub unique_objects_indexed: usize,
    /// Scans indexed (skipped scans excluded).
    pub scans_processed: usize,
    /// Junction rows created.
    pub entries_created: usize,
    /// External references refreshed rather than created.
    pub entries_updated: usize,
    /// Wall time.
    pub duration_ms: u64,
    /// Failures, one per affected scan.
    #[serde(default)]
    pub errors: Vec<BuildError>,
    /// Non-fatal notes such as skipped scans.
    #[serde(default)]
    pub warnings: Vec<String>,
    /// Progress, meaningful when the build stopped early.
    pub partial_progress: PartialProgress,
}

impl BuildResult {
    pub(crate) fn new(build_id: impl Into<String>, status: BuildStatus) -> Self {
        Self {
            build_id: build_id.into(),
            status,
            nodes_processed: 0,
            references_extracted: 0,
            unique_objects_indexed: 0,
            scans_processed: 0,
            entries_created: 0,
            entries_updated: 0,
            duration_ms: 0,
            errors: Vec::new(),
            warnings: Vec::new(),
            partial_progress: PartialProgress::default(),
        }
    }
}

/// Registry view of a build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildRecord {
    /// Build identifier.
    pub build_id: String,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Current state.
    pub status: BuildStatus,
    /// What was asked for.
    pub request: BuildRequest,
    /// Outcome once terminal, progress so far otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<BuildResult>,
    /// Entries processed so far.
    pub partial_progress: PartialProgress,
    /// When the build started.
    pub started_at: DateTime<Utc>,
    /// When the build stopped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Cache hit counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    /// Served from the in-process LRU.
    pub l1_hits: u64,
    /// Served from the distributed cache.
    pub l2_hits: u64,
    /// Served from the database.
    pub misses: u64,
    /// Entries in the in-process LRU.
    pub l1_entries: usize,
}

impl CacheStats {
    /// Share of lookups served by either cache tier.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        let total = self.l1_hits + self.l2_hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.l1_hits + self.l2_hits) as f64 / total as f64
        }
    }
}

/// Index statistics of a tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexStats {
    /// Junction rows.
    pub total_entries: usize,
    /// Distinct external objects.
    pub unique_objects: usize,
    /// Junction rows per reference type.
    pub counts_by_type: BTreeMap<ReferenceType, usize>,
    /// Cache counters.
    pub cache: CacheStats,
    /// Share of lookups served by a cache tier.
    pub cache_hit_ratio: f64,
    /// Average lookup time since start.
    pub average_lookup_ms: f64,
    /// Most recently finished build.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_build: Option<BuildRecord>,
}

/// Overall index health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Everything within thresholds.
    Healthy,
    /// Usable, with problems listed.
    Degraded,
}

/// Health report of a tenant's index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    /// Overall verdict.
    pub status: HealthStatus,
    /// Reasons for a degraded verdict.
    pub issues: Vec<String>,
    /// Share of lookups served by a cache tier.
    pub cache_hit_ratio: f64,
    /// Average lookup time since start.
    pub average_lookup_ms: f64,
    /// When the last build finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_build_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pagination_offsets_are_one_based() {
        assert_eq!(Pagination::new(1, 10).offset(), 0);
        assert_eq!(Pagination::new(3, 10).offset(), 20);
        assert_eq!(Pagination::new(0, 10).offset(), 0);
        assert_eq!(Pagination::new(1, 0).limit(), 1);
        assert_eq!(Pagination::new(1, 5_000).limit(), Pagination::MAX_PAGE_SIZE);
    }

    #[test]
    fn build_request_filters_types_and_confidence() {
        let request = BuildRequest {
            exclude_types: Some(vec![ReferenceType::ResourceId]),
            min_confidence: 0.9,
            ..BuildRequest::default()
        };

        assert!(request.accepts(ReferenceType::Arn, 1.0));
        assert!(!request.accepts(ReferenceType::Arn, 0.8));
        assert!(!request.accepts(ReferenceType::ResourceId, 1.0));
    }

    #[test]
    fn hit_rate_counts_both_tiers() {
        let stats = CacheStats {
            l1_hits: 2,
            l2_hits: 1,
            misses: 1,
            l1_entries: 0,
        };
        assert!((stats.hit_rate() - 0.75).abs() < f64::EPSILON);
        assert!(CacheStats::default().hit_rate().abs() < f64::EPSILON);
    }
}

//! Read access to per-scan dependency graphs.
//!
//! The scan pipeline owns graph data; every engine in this crate only reads
//! it. [`GraphStore`] is the seam between the two. Implementations:
//!
//! - [`SqliteGraphStore`]: persistent, shares the [`Database`](crate::db::Database)
//!   with the external object index and has an import path for scan exports
//! - [`MemoryGraphStore`]: in-process, for tests and benchmarks

mod memory;
mod sqlite;

pub use memory::MemoryGraphStore;
pub use sqlite::{ImportStats, SqliteGraphStore};

use crate::error::{Error, Result};
use crate::types::{
    GraphEdge, GraphNode, GraphSnapshot, NodeId, RepositoryId, ScanId, ScanInfo, TenantId,
};

/// Filter applied to edge queries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EdgeQuery {
    /// Only edges of these types. `None` means all types.
    pub edge_types: Option<Vec<String>>,
    /// Only edges with at least this confidence.
    pub min_confidence: Option<u8>,
}

impl EdgeQuery {
    /// `true` if `edge` passes the filter.
    #[must_use]
    pub fn accepts(&self, edge: &GraphEdge) -> bool {
        let type_ok = self
            .edge_types
            .as_ref()
            .is_none_or(|types| types.iter().any(|t| *t == edge.edge_type));
        let confidence_ok = self
            .min_confidence
            .is_none_or(|min| edge.confidence >= min);
        type_ok && confidence_ok
    }
}

/// Read-only view of the graph store.
///
/// Scans belong to one tenant and are addressed by `(tenant, scan id)`; the
/// same scan id under another tenant is a different scan. Node and edge ids
/// are unique within their scan. Nodes and edges come back in scan order.
pub trait GraphStore: Send + Sync {
    /// Metadata of one scan.
    fn get_scan(&self, tenant_id: &TenantId, scan_id: &ScanId) -> Result<Option<ScanInfo>>;

    /// Most recent scan of a repository owned by `tenant_id`.
    fn latest_scan(
        &self,
        tenant_id: &TenantId,
        repository_id: &RepositoryId,
    ) -> Result<Option<ScanInfo>>;

    /// A single node of a scan.
    fn get_node(
        &self,
        tenant_id: &TenantId,
        scan_id: &ScanId,
        id: &NodeId,
    ) -> Result<Option<GraphNode>>;

    /// Edges of a scan leaving `id`.
    fn get_edges_from_node(
        &self,
        tenant_id: &TenantId,
        scan_id: &ScanId,
        id: &NodeId,
        query: &EdgeQuery,
    ) -> Result<Vec<GraphEdge>>;

    /// Edges of a scan arriving at `id`.
    fn get_edges_to_node(
        &self,
        tenant_id: &TenantId,
        scan_id: &ScanId,
        id: &NodeId,
        query: &EdgeQuery,
    ) -> Result<Vec<GraphEdge>>;

    /// Nodes of one type within a scan.
    fn get_nodes_by_type(
        &self,
        tenant_id: &TenantId,
        scan_id: &ScanId,
        node_type: &str,
    ) -> Result<Vec<GraphNode>>;

    /// All nodes of a scan.
    fn get_nodes_for_scan(&self, tenant_id: &TenantId, scan_id: &ScanId) -> Result<Vec<GraphNode>>;

    /// All edges of a scan.
    fn get_edges_for_scan(&self, tenant_id: &TenantId, scan_id: &ScanId) -> Result<Vec<GraphEdge>>;

    /// Number of nodes in a scan, optionally restricted to one type.
    fn count_nodes(
        &self,
        tenant_id: &TenantId,
        scan_id: &ScanId,
        node_type: Option<&str>,
    ) -> Result<usize>;

    /// Number of edges in a scan, optionally restricted to one type.
    fn count_edges(
        &self,
        tenant_id: &TenantId,
        scan_id: &ScanId,
        edge_type: Option<&str>,
    ) -> Result<usize>;

    /// Load a whole scan as a snapshot.
    fn load_snapshot(
        &self,
        tenant_id: &TenantId,
        scan_id: &ScanId,
    ) -> Result<Option<GraphSnapshot>> {
        let Some(scan) = self.get_scan(tenant_id, scan_id)? else {
            return Ok(None);
        };
        Ok(Some(GraphSnapshot {
            nodes: self.get_nodes_for_scan(tenant_id, scan_id)?,
            edges: self.get_edges_for_scan(tenant_id, scan_id)?,
            scan_id: scan.scan_id,
            repository_id: scan.repository_id,
            tenant_id: scan.tenant_id,
        }))
    }
}

/// Fetch a tenant's scan, failing with `NotFound` when it has none by that id.
pub fn require_scan(
    store: &dyn GraphStore,
    tenant_id: &TenantId,
    scan_id: &ScanId,
) -> Result<ScanInfo> {
    store
        .get_scan(tenant_id, scan_id)?
        .ok_or_else(|| Error::not_found("scan", scan_id.as_str()))
}

/// Load a tenant's snapshot, failing with `NotFound` when it has none by that id.
pub fn require_snapshot(
    store: &dyn GraphStore,
    tenant_id: &TenantId,
    scan_id: &ScanId,
) -> Result<GraphSnapshot> {
    store
        .load_snapshot(tenant_id, scan_id)?
        .ok_or_else(|| Error::not_found("scan", scan_id.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edge_query_filters_type_and_confidence() {
        let edge = GraphEdge::new("e-1", "a", "b", "FEEDS_INTO", 85);

        assert!(EdgeQuery::default().accepts(&edge));
        assert!(
            EdgeQuery {
                edge_types: Some(vec!["FEEDS_INTO".into()]),
                min_confidence: Some(80),
            }
            .accepts(&edge)
        );
        assert!(
            !EdgeQuery {
                edge_types: None,
                min_confidence: Some(90),
            }
            .accepts(&edge)
        );
        assert!(
            !EdgeQuery {
                edge_types: Some(vec!["DEPENDS_ON".into()]),
                min_confidence: None,
            }
            .accepts(&edge)
        );
    }

    #[test]
    fn require_scan_hides_other_tenants() {
        let store = MemoryGraphStore::new();
        store.insert_snapshot(GraphSnapshot::new("tenant-a", "repo", "scan-1"));

        assert!(require_scan(&store, &"tenant-a".into(), &"scan-1".into()).is_ok());

        let err = require_scan(&store, &"tenant-b".into(), &"scan-1".into()).unwrap_err();
        let missing = require_scan(&store, &"tenant-b".into(), &"nope".into()).unwrap_err();
        assert_eq!(err.to_string(), "scan not found: scan-1");
        assert_eq!(err.code(), missing.code());
    }
}

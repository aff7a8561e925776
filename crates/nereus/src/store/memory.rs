//! In-process graph store.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::{EdgeQuery, GraphStore};
use crate::error::Result;
use crate::types::{
    GraphEdge, GraphNode, GraphSnapshot, NodeId, RepositoryId, ScanId, ScanInfo, TenantId,
};

type ScanKey = (TenantId, ScanId);

#[derive(Default)]
struct Inner {
    scans: HashMap<ScanKey, ScanInfo>,
    snapshots: HashMap<ScanKey, GraphSnapshot>,
}

fn key(tenant_id: &TenantId, scan_id: &ScanId) -> ScanKey {
    (tenant_id.clone(), scan_id.clone())
}

/// Graph store kept entirely in memory.
#[derive(Default)]
pub struct MemoryGraphStore {
    inner: RwLock<Inner>,
}

impl MemoryGraphStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) a scan, stamped with the current time.
    pub fn insert_snapshot(&self, snapshot: GraphSnapshot) {
        self.insert_snapshot_at(snapshot, Utc::now());
    }

    /// Add (or replace) a scan with an explicit completion time.
    pub fn insert_snapshot_at(&self, snapshot: GraphSnapshot, created_at: DateTime<Utc>) {
        let mut inner = self.inner.write();
        let scan = ScanInfo {
            scan_id: snapshot.scan_id.clone(),
            repository_id: snapshot.repository_id.clone(),
            tenant_id: snapshot.tenant_id.clone(),
            created_at,
        };
        let scan_key = key(&snapshot.tenant_id, &snapshot.scan_id);
        inner.scans.insert(scan_key.clone(), scan);
        inner.snapshots.insert(scan_key, snapshot);
    }

    fn with_snapshot<T>(
        &self,
        tenant_id: &TenantId,
        scan_id: &ScanId,
        f: impl FnOnce(&GraphSnapshot) -> T,
    ) -> Option<T> {
        self.inner.read().snapshots.get(&key(tenant_id, scan_id)).map(f)
    }

    fn edges_matching(
        &self,
        tenant_id: &TenantId,
        scan_id: &ScanId,
        id: &NodeId,
        query: &EdgeQuery,
        endpoint: fn(&GraphEdge) -> &NodeId,
    ) -> Vec<GraphEdge> {
        self.with_snapshot(tenant_id, scan_id, |snapshot| {
            snapshot
                .edges
                .iter()
                .filter(|edge| endpoint(edge) == id && query.accepts(edge))
                .cloned()
                .collect()
        })
        .unwrap_or_default()
    }
}

impl GraphStore for MemoryGraphStore {
    fn get_scan(&self, tenant_id: &TenantId, scan_id: &ScanId) -> Result<Option<ScanInfo>> {
        Ok(self.inner.read().scans.get(&key(tenant_id, scan_id)).cloned())
    }

    fn latest_scan(
        &self,
        tenant_id: &TenantId,
        repository_id: &RepositoryId,
    ) -> Result<Option<ScanInfo>> {
        Ok(self
            .inner
            .read()
            .scans
            .values()
            .filter(|s| s.tenant_id == *tenant_id && s.repository_id == *repository_id)
            .max_by(|a, b| {
                a.created_at
                    .cmp(&b.created_at)
                    .then_with(|| a.scan_id.cmp(&b.scan_id))
            })
            .cloned())
    }

    fn get_node(
        &self,
        tenant_id: &TenantId,
        scan_id: &ScanId,
        id: &NodeId,
    ) -> Result<Option<GraphNode>> {
        Ok(self
            .with_snapshot(tenant_id, scan_id, |s| s.node(id.as_str()).cloned())
            .flatten())
    }

    fn get_edges_from_node(
        &self,
        tenant_id: &TenantId,
        scan_id: &ScanId,
        id: &NodeId,
        query: &EdgeQuery,
    ) -> Result<Vec<GraphEdge>> {
        Ok(self.edges_matching(tenant_id, scan_id, id, query, |e| &e.source_id))
    }

    fn get_edges_to_node(
        &self,
        tenant_id: &TenantId,
        scan_id: &ScanId,
        id: &NodeId,
        query: &EdgeQuery,
    ) -> Result<Vec<GraphEdge>> {
        Ok(self.edges_matching(tenant_id, scan_id, id, query, |e| &e.target_id))
    }

    fn get_nodes_by_type(
        &self,
        tenant_id: &TenantId,
        scan_id: &ScanId,
        node_type: &str,
    ) -> Result<Vec<GraphNode>> {
        Ok(self
            .with_snapshot(tenant_id, scan_id, |s| {
                s.nodes
                    .iter()
                    .filter(|n| n.node_type == node_type)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn get_nodes_for_scan(&self, tenant_id: &TenantId, scan_id: &ScanId) -> Result<Vec<GraphNode>> {
        Ok(self
            .with_snapshot(tenant_id, scan_id, |s| s.nodes.clone())
            .unwrap_or_default())
    }

    fn get_edges_for_scan(&self, tenant_id: &TenantId, scan_id: &ScanId) -> Result<Vec<GraphEdge>> {
        Ok(self
            .with_snapshot(tenant_id, scan_id, |s| s.edges.clone())
            .unwrap_or_default())
    }

    fn count_nodes(
        &self,
        tenant_id: &TenantId,
        scan_id: &ScanId,
        node_type: Option<&str>,
    ) -> Result<usize> {
        Ok(self
            .with_snapshot(tenant_id, scan_id, |s| {
                s.nodes
                    .iter()
                    .filter(|n| node_type.is_none_or(|t| n.node_type == t))
                    .count()
            })
            .unwrap_or(0))
    }

    fn count_edges(
        &self,
        tenant_id: &TenantId,
        scan_id: &ScanId,
        edge_type: Option<&str>,
    ) -> Result<usize> {
        Ok(self
            .with_snapshot(tenant_id, scan_id, |s| {
                s.edges
                    .iter()
                    .filter(|e| edge_type.is_none_or(|t| e.edge_type == t))
                    .count()
            })
            .unwrap_or(0))
    }

    fn load_snapshot(
        &self,
        tenant_id: &TenantId,
        scan_id: &ScanId,
    ) -> Result<Option<GraphSnapshot>> {
        Ok(self.with_snapshot(tenant_id, scan_id, GraphSnapshot::clone))
    }
}

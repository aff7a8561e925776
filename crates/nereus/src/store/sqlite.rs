//! `SQLite`-backed graph store.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};
use serde::Serialize;
use tracing::{debug, info};

use super::{EdgeQuery, GraphStore};
use crate::db::{Database, count_to_usize, json_column, millis_to_datetime, usize_to_sql};
use crate::error::Result;
use crate::types::{
    GraphEdge, GraphNode, GraphSnapshot, NodeId, RepositoryId, ScanId, ScanInfo, TenantId,
};

/// SQL column list for the scans table.
///
/// Use with `row_to_scan` for consistent column ordering.
const SCAN_COLUMNS: &str = "scan_id, repository_id, tenant_id, created_at";

/// SQL column list for the `graph_nodes` table.
///
/// Use with `row_to_node` for consistent column ordering.
const NODE_COLUMNS: &str = "id, node_type, name, namespace, repository_id, scan_id, attributes";

/// SQL column list for the `graph_edges` table.
///
/// Use with `row_to_edge` for consistent column ordering.
const EDGE_COLUMNS: &str = "id, source_id, target_id, edge_type, confidence, attributes";

fn row_to_scan(row: &rusqlite::Row) -> rusqlite::Result<ScanInfo> {
    Ok(ScanInfo {
        scan_id: ScanId::new(row.get::<_, String>(0)?),
        repository_id: RepositoryId::new(row.get::<_, String>(1)?),
        tenant_id: TenantId::new(row.get::<_, String>(2)?),
        created_at: millis_to_datetime(row.get(3)?)?,
    })
}

fn row_to_node(row: &rusqlite::Row) -> rusqlite::Result<GraphNode> {
    Ok(GraphNode {
        id: NodeId::new(row.get::<_, String>(0)?),
        node_type: row.get(1)?,
        name: row.get(2)?,
        namespace: row.get(3)?,
        repository_id: RepositoryId::new(row.get::<_, String>(4)?),
        scan_id: ScanId::new(row.get::<_, String>(5)?),
        attributes: json_column(6, &row.get::<_, String>(6)?)?,
    })
}

fn row_to_edge(row: &rusqlite::Row) -> rusqlite::Result<GraphEdge> {
    Ok(GraphEdge {
        id: row.get::<_, String>(0)?.into(),
        source_id: NodeId::new(row.get::<_, String>(1)?),
        target_id: NodeId::new(row.get::<_, String>(2)?),
        edge_type: row.get(3)?,
        confidence: row.get(4)?,
        attributes: json_column(5, &row.get::<_, String>(5)?)?,
    })
}

/// Rows written by [`SqliteGraphStore::import_snapshot`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportStats {
    /// Nodes written.
    pub nodes: usize,
    /// Edges written.
    pub edges: usize,
    /// `true` when an earlier import of the same scan was replaced.
    pub replaced: bool,
}

/// Graph store persisted in the shared `SQLite` database.
pub struct SqliteGraphStore {
    db: Arc<Database>,
}

impl SqliteGraphStore {
    /// Wrap an open database.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Store a scan export, replacing the tenant's earlier import of the same
    /// scan. Scans of other tenants are never touched.
    ///
    /// Runs in one transaction: either the whole scan is visible or none of it.
    pub fn import_snapshot(
        &self,
        snapshot: &GraphSnapshot,
        created_at: Option<DateTime<Utc>>,
    ) -> Result<ImportStats> {
        let created_at = created_at.unwrap_or_else(Utc::now);
        let tenant_id = snapshot.tenant_id.as_str();
        let scan_id = snapshot.scan_id.as_str();
        let mut conn = self.db.connection()?;
        let tx = conn.transaction()?;

        let replaced = tx.execute(
            "DELETE FROM scans WHERE tenant_id = ?1 AND scan_id = ?2",
            [tenant_id, scan_id],
        )? > 0;

        tx.execute(
            "INSERT INTO scans (tenant_id, scan_id, repository_id, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                tenant_id,
                scan_id,
                snapshot.repository_id.as_str(),
                created_at.timestamp_millis()
            ],
        )?;

        {
            let mut insert_node = tx.prepare(
                "INSERT INTO graph_nodes
                 (tenant_id, scan_id, id, repository_id, node_type, name, namespace,
                  attributes, position)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            for (position, node) in snapshot.nodes.iter().enumerate() {
                insert_node.execute(params![
                    tenant_id,
                    scan_id,
                    node.id.as_str(),
                    snapshot.repository_id.as_str(),
                    node.node_type,
                    node.name,
                    node.namespace,
                    serde_json::to_string(&node.attributes)?,
                    usize_to_sql(position),
                ])?;
            }

            let mut insert_edge = tx.prepare(
                "INSERT INTO graph_edges
                 (tenant_id, scan_id, id, source_id, target_id, edge_type, confidence,
                  attributes, position)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            for (position, edge) in snapshot.edges.iter().enumerate() {
                insert_edge.execute(params![
                    tenant_id,
                    scan_id,
                    edge.id.as_str(),
                    edge.source_id.as_str(),
                    edge.target_id.as_str(),
                    edge.edge_type,
                    edge.confidence,
                    serde_json::to_string(&edge.attributes)?,
                    usize_to_sql(position),
                ])?;
            }
        }

        tx.commit()?;

        info!(
            tenant_id = %snapshot.tenant_id,
            repository_id = %snapshot.repository_id,
            scan_id = %snapshot.scan_id,
            nodes = snapshot.nodes.len(),
            edges = snapshot.edges.len(),
            replaced,
            "Imported scan"
        );

        Ok(ImportStats {
            nodes: snapshot.nodes.len(),
            edges: snapshot.edges.len(),
            replaced,
        })
    }

    /// Remove one of a tenant's scans and all its nodes and edges.
    pub fn delete_scan(&self, tenant_id: &TenantId, scan_id: &ScanId) -> Result<bool> {
        let conn = self.db.connection()?;
        let deleted = conn.execute(
            "DELETE FROM scans WHERE tenant_id = ?1 AND scan_id = ?2",
            [tenant_id.as_str(), scan_id.as_str()],
        )?;
        debug!(tenant_id = %tenant_id, scan_id = %scan_id, deleted, "Deleted scan");
        Ok(deleted > 0)
    }

    /// All scans of a tenant, newest first.
    pub fn list_scans(&self, tenant_id: &TenantId) -> Result<Vec<ScanInfo>> {
        let conn = self.db.connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SCAN_COLUMNS} FROM scans WHERE tenant_id = ?1
             ORDER BY created_at DESC, scan_id"
        ))?;
        let scans = stmt
            .query_map([tenant_id.as_str()], row_to_scan)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(scans)
    }

    fn edges_by_endpoint(
        &self,
        column: &'static str,
        tenant_id: &TenantId,
        scan_id: &ScanId,
        id: &NodeId,
        query: &EdgeQuery,
    ) -> Result<Vec<GraphEdge>> {
        let conn = self.db.connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {EDGE_COLUMNS} FROM graph_edges
             WHERE tenant_id = ?1 AND scan_id = ?2 AND {column} = ?3 AND confidence >= ?4
             ORDER BY position"
        ))?;
        let edges = stmt
            .query_map(
                params![
                    tenant_id.as_str(),
                    scan_id.as_str(),
                    id.as_str(),
                    query.min_confidence.unwrap_or(0)
                ],
                row_to_edge,
            )?
            .filter(|edge| edge.as_ref().map_or(true, |e| query.accepts(e)))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(edges)
    }
}

impl GraphStore for SqliteGraphStore {
    fn get_scan(&self, tenant_id: &TenantId, scan_id: &ScanId) -> Result<Option<ScanInfo>> {
        let conn = self.db.connection()?;
        let scan = conn
            .query_row(
                &format!("SELECT {SCAN_COLUMNS} FROM scans WHERE tenant_id = ?1 AND scan_id = ?2"),
                [tenant_id.as_str(), scan_id.as_str()],
                row_to_scan,
            )
            .optional()?;
        Ok(scan)
    }

    fn latest_scan(
        &self,
        tenant_id: &TenantId,
        repository_id: &RepositoryId,
    ) -> Result<Option<ScanInfo>> {
        let conn = self.db.connection()?;
        let scan = conn
            .query_row(
                &format!(
                    "SELECT {SCAN_COLUMNS} FROM scans
                     WHERE tenant_id = ?1 AND repository_id = ?2
                     ORDER BY created_at DESC, scan_id DESC
                     LIMIT 1"
                ),
                [tenant_id.as_str(), repository_id.as_str()],
                row_to_scan,
            )
            .optional()?;
        Ok(scan)
    }

    fn get_node(
        &self,
        tenant_id: &TenantId,
        scan_id: &ScanId,
        id: &NodeId,
    ) -> Result<Option<GraphNode>> {
        let conn = self.db.connection()?;
        let node = conn
            .query_row(
                &format!(
                    "SELECT {NODE_COLUMNS} FROM graph_nodes
                     WHERE tenant_id = ?1 AND scan_id = ?2 AND id = ?3"
                ),
                [tenant_id.as_str(), scan_id.as_str(), id.as_str()],
                row_to_node,
            )
            .optional()?;
        Ok(node)
    }

    fn get_edges_from_node(
        &self,
        tenant_id: &TenantId,
        scan_id: &ScanId,
        id: &NodeId,
        query: &EdgeQuery,
    ) -> Result<Vec<GraphEdge>> {
        self.edges_by_endpoint("source_id", tenant_id, scan_id, id, query)
    }

    fn get_edges_to_node(
        &self,
        tenant_id: &TenantId,
        scan_id: &ScanId,
        id: &NodeId,
        query: &EdgeQuery,
    ) -> Result<Vec<GraphEdge>> {
        self.edges_by_endpoint("target_id", tenant_id, scan_id, id, query)
    }

    fn get_nodes_by_type(
        &self,
        tenant_id: &TenantId,
        scan_id: &ScanId,
        node_type: &str,
    ) -> Result<Vec<GraphNode>> {
        let conn = self.db.connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {NODE_COLUMNS} FROM graph_nodes
             WHERE tenant_id = ?1 AND scan_id = ?2 AND node_type = ?3
             ORDER BY position"
        ))?;
        let nodes = stmt
            .query_map([tenant_id.as_str(), scan_id.as_str(), node_type], row_to_node)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(nodes)
    }

    fn get_nodes_for_scan(&self, tenant_id: &TenantId, scan_id: &ScanId) -> Result<Vec<GraphNode>> {
        let conn = self.db.connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {NODE_COLUMNS} FROM graph_nodes
             WHERE tenant_id = ?1 AND scan_id = ?2 ORDER BY position"
        ))?;
        let nodes = stmt
            .query_map([tenant_id.as_str(), scan_id.as_str()], row_to_node)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(nodes)
    }

    fn get_edges_for_scan(&self, tenant_id: &TenantId, scan_id: &ScanId) -> Result<Vec<GraphEdge>> {
        let conn = self.db.connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {EDGE_COLUMNS} FROM graph_edges
             WHERE tenant_id = ?1 AND scan_id = ?2 ORDER BY position"
        ))?;
        let edges = stmt
            .query_map([tenant_id.as_str(), scan_id.as_str()], row_to_edge)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(edges)
    }

    fn count_nodes(
        &self,
        tenant_id: &TenantId,
        scan_id: &ScanId,
        node_type: Option<&str>,
    ) -> Result<usize> {
        let conn = self.db.connection()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM graph_nodes
             WHERE tenant_id = ?1 AND scan_id = ?2 AND (?3 IS NULL OR node_type = ?3)",
            params![tenant_id.as_str(), scan_id.as_str(), node_type],
            |row| row.get(0),
        )?;
        Ok(count_to_usize(count))
    }

    fn count_edges(
        &self,
        tenant_id: &TenantId,
        scan_id: &ScanId,
        edge_type: Option<&str>,
    ) -> Result<usize> {
        let conn = self.db.connection()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM graph_edges
             WHERE tenant_id = ?1 AND scan_id = ?2 AND (?3 IS NULL OR edge_type = ?3)",
            params![tenant_id.as_str(), scan_id.as_str(), edge_type],
            |row| row.get(0),
        )?;
        Ok(count_to_usize(count))
    }
}

//! Stable identities for nodes and edges.
//!
//! Two scans of the same repository issue different node ids for the same
//! resource. Identities ignore store ids and describe the resource itself:
//!
//! - node: `type` + `namespace` + `name`
//! - edge: `type` + repository + source node identity + target node identity
//!
//! Two nodes (or edges) are the same resource iff their `identity_hash`
//! values are equal. Identities are recomputed per operation and never stored.

use std::collections::HashMap;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::types::{GraphEdge, GraphNode, RepositoryId};

/// Namespace used in keys when a node has none.
const DEFAULT_NAMESPACE: &str = "default";

/// Snapshots at least this large are processed with rayon.
const PARALLEL_THRESHOLD: usize = 4_096;

/// SHA-256 over length-delimited parts, hex encoded.
///
/// Each part is followed by a NUL byte so that `("a:b", "c")` and
/// `("a", "b:c")` never collide.
#[must_use]
pub fn hash_parts(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    format!("{:x}", hasher.finalize())
}

/// Identity of a node across scans.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeIdentity {
    /// Resource type.
    pub node_type: String,
    /// Resource name.
    pub name: String,
    /// Namespace, `None` when the node has none.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Readable key, `type:namespace:name`.
    pub key: String,
    /// Hash deciding equality.
    pub identity_hash: String,
}

impl NodeIdentity {
    /// Derive the identity of `node`.
    #[must_use]
    pub fn of(node: &GraphNode) -> Self {
        let namespace = node.namespace.as_deref().unwrap_or(DEFAULT_NAMESPACE);
        let key = format!("{}:{}:{}", node.node_type, namespace, node.name);
        let identity_hash = hash_parts(&["node", &node.node_type, namespace, &node.name]);
        Self {
            node_type: node.node_type.clone(),
            name: node.name.clone(),
            namespace: node.namespace.clone(),
            key,
            identity_hash,
        }
    }
}

/// Identity of an edge across scans.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeIdentity {
    /// Relationship type.
    pub edge_type: String,
    /// Key of the source endpoint.
    pub source_key: String,
    /// Key of the target endpoint.
    pub target_key: String,
    /// Readable key, `type|repository|source->target`.
    pub key: String,
    /// Hash deciding equality.
    pub identity_hash: String,
}

impl EdgeIdentity {
    /// Derive the identity of `edge`.
    ///
    /// Endpoints are described by their node identities. An endpoint missing
    /// from the snapshot (dangling edge) falls back to its raw node id.
    #[must_use]
    pub fn of(
        edge: &GraphEdge,
        repository_id: &RepositoryId,
        source: Option<&NodeIdentity>,
        target: Option<&NodeIdentity>,
    ) -> Self {
        let source_key = source.map_or_else(
            || format!("#{}", edge.source_id),
            |identity| identity.key.clone(),
        );
        let target_key = target.map_or_else(
            || format!("#{}", edge.target_id),
            |identity| identity.key.clone(),
        );
        let key = format!(
            "{}|{}|{}->{}",
            edge.edge_type, repository_id, source_key, target_key
        );
        let identity_hash = hash_parts(&[
            "edge",
            &edge.edge_type,
            repository_id.as_str(),
            &source_key,
            &target_key,
        ]);
        Self {
            edge_type: edge.edge_type.clone(),
            source_key,
            target_key,
            key,
            identity_hash,
        }
    }
}

/// Identities of every node in a snapshot, in input order.
#[must_use]
pub fn node_identities(nodes: &[&GraphNode]) -> Vec<NodeIdentity> {
    if nodes.len() >= PARALLEL_THRESHOLD {
        nodes.par_iter().map(|node| NodeIdentity::of(node)).collect()
    } else {
        nodes.iter().map(|node| NodeIdentity::of(node)).collect()
    }
}

/// Identities of every edge in a snapshot, in input order.
///
/// `by_node_id` maps store node ids to their identities so endpoints resolve
/// to resource identities rather than scan-specific ids.
#[must_use]
pub fn edge_identities(
    edges: &[&GraphEdge],
    repository_id: &RepositoryId,
    by_node_id: &HashMap<&str, &NodeIdentity>,
) -> Vec<EdgeIdentity> {
    let derive = |edge: &&GraphEdge| {
        EdgeIdentity::of(
            edge,
            repository_id,
            by_node_id.get(edge.source_id.as_str()).copied(),
            by_node_id.get(edge.target_id.as_str()).copied(),
        )
    };
    if edges.len() >= PARALLEL_THRESHOLD {
        edges.par_iter().map(derive).collect()
    } else {
        edges.iter().map(derive).collect()
    }
}

//! Domain types shared by every engine.
//!
//! These types represent the graph data Nereus consumes:
//! - **Identifiers**: `TenantId`, `RepositoryId`, `ScanId`, `NodeId`, `EdgeId`
//! - **Graph data**: `GraphNode`, `GraphEdge` (owned by the graph store, read-only here)
//! - **Containers**: `GraphSnapshot` (one scan of one repository), `ScanInfo`
//!
//! ## Design Decisions
//!
//! | Decision | Choice | Rationale |
//! |----------|--------|-----------|
//! | Identifiers | String newtypes | Scan pipelines issue opaque ids; newtypes stop tenant/scan mix-ups |
//! | Attributes | `serde_json::Map` | Scanners emit arbitrary nested provider attributes |
//! | Edge confidence | `u8` in 0..=100 | Matches the scanner's integer scale |

use std::borrow::{Borrow, Cow};
use std::fmt;

use chrono::{DateTime, Utc};
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Free-form node and edge attributes.
pub type Attributes = serde_json::Map<String, Value>;

// ============================================================================
// Strongly-typed ID wrappers
// ============================================================================

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap a raw identifier.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Borrow the raw identifier.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// The identifier as one segment of a `:`-separated cache key.
            #[must_use]
            pub fn key_segment(&self) -> Cow<'_, str> {
                escape_key_segment(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

/// Bytes escaped in cache key segments: the `:` separator, the `*` glob
/// wildcard and `%` itself.
const KEY_SEGMENT: &AsciiSet = &CONTROLS.add(b'%').add(b':').add(b'*');

fn escape_key_segment(raw: &str) -> Cow<'_, str> {
    utf8_percent_encode(raw, KEY_SEGMENT).into()
}

string_id!(
    /// Tenant that owns scans, index entries, rollups and builds.
    TenantId
);
string_id!(
    /// A scanned repository.
    RepositoryId
);
string_id!(
    /// One scan of one repository (a graph snapshot).
    ScanId
);
string_id!(
    /// A node issued by the graph store.
    NodeId
);
string_id!(
    /// An edge issued by the graph store.
    EdgeId
);
string_id!(
    /// A saved rollup definition.
    RollupId
);
string_id!(
    /// One run of a rollup.
    ExecutionId
);

// ============================================================================
// Graph data
// ============================================================================

/// A resource discovered by a scan (Terraform resource, Helm release, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphNode {
    /// Store-issued identifier.
    pub id: NodeId,
    /// Resource type, e.g. `aws_s3_bucket` or `helm_release`.
    #[serde(rename = "type")]
    pub node_type: String,
    /// Resource name as declared in source.
    pub name: String,
    /// Namespace (Kubernetes namespace, Terraform module path, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Repository the node was scanned from. Stamped on import when absent.
    #[serde(default)]
    pub repository_id: RepositoryId,
    /// Scan that produced the node. Stamped on import when absent.
    #[serde(default)]
    pub scan_id: ScanId,
    /// Provider attributes.
    #[serde(default)]
    pub attributes: Attributes,
}

impl GraphNode {
    /// Create a node without namespace or attributes.
    pub fn new(
        id: impl Into<NodeId>,
        node_type: impl Into<String>,
        name: impl Into<String>,
        repository_id: impl Into<RepositoryId>,
        scan_id: impl Into<ScanId>,
    ) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            name: name.into(),
            namespace: None,
            repository_id: repository_id.into(),
            scan_id: scan_id.into(),
            attributes: Attributes::new(),
        }
    }

    /// Set the namespace.
    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Set one attribute.
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    /// String value of a top-level attribute, if present and non-empty.
    #[must_use]
    pub fn attribute_str(&self, key: &str) -> Option<&str> {
        self.attributes
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }
}

/// A dependency between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphEdge {
    /// Store-issued identifier.
    pub id: EdgeId,
    /// Node the edge starts at.
    pub source_id: NodeId,
    /// Node the edge points to.
    pub target_id: NodeId,
    /// Relationship type, e.g. `DEPENDS_ON` or `FEEDS_INTO`.
    #[serde(rename = "type")]
    pub edge_type: String,
    /// Scanner confidence, 0..=100.
    pub confidence: u8,
    /// Extra edge attributes.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub attributes: Attributes,
}

impl GraphEdge {
    /// Create an edge without attributes.
    pub fn new(
        id: impl Into<EdgeId>,
        source_id: impl Into<NodeId>,
        target_id: impl Into<NodeId>,
        edge_type: impl Into<String>,
        confidence: u8,
    ) -> Self {
        Self {
            id: id.into(),
            source_id: source_id.into(),
            target_id: target_id.into(),
            edge_type: edge_type.into(),
            confidence: confidence.min(100),
            attributes: Attributes::new(),
        }
    }
}

/// Metadata about one scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanInfo {
    /// Scan identifier.
    pub scan_id: ScanId,
    /// Repository that was scanned.
    pub repository_id: RepositoryId,
    /// Tenant owning the repository.
    pub tenant_id: TenantId,
    /// When the scan completed.
    pub created_at: DateTime<Utc>,
}

/// All nodes and edges of one scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphSnapshot {
    /// Scan identifier (the snapshot id in diffs).
    pub scan_id: ScanId,
    /// Repository that was scanned.
    pub repository_id: RepositoryId,
    /// Tenant owning the repository.
    pub tenant_id: TenantId,
    /// Nodes in scan order.
    #[serde(default)]
    pub nodes: Vec<GraphNode>,
    /// Edges in scan order.
    #[serde(default)]
    pub edges: Vec<GraphEdge>,
}

impl GraphSnapshot {
    /// Create an empty snapshot.
    pub fn new(
        tenant_id: impl Into<TenantId>,
        repository_id: impl Into<RepositoryId>,
        scan_id: impl Into<ScanId>,
    ) -> Self {
        Self {
            scan_id: scan_id.into(),
            repository_id: repository_id.into(),
            tenant_id: tenant_id.into(),
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }

    /// Add a node, stamping it with this snapshot's repository and scan.
    #[must_use]
    pub fn with_node(mut self, mut node: GraphNode) -> Self {
        node.repository_id = self.repository_id.clone();
        node.scan_id = self.scan_id.clone();
        self.nodes.push(node);
        self
    }

    /// Add an edge.
    #[must_use]
    pub fn with_edge(mut self, edge: GraphEdge) -> Self {
        self.edges.push(edge);
        self
    }

    /// Find a node by id.
    #[must_use]
    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.iter().find(|n| n.id.as_str() == id)
    }
}

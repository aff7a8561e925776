//! Merge options and merge output types.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::matcher::MatchResult;
use crate::types::{Attributes, EdgeId, GraphNode, GraphSnapshot, NodeId, RepositoryId, ScanId};
use crate::validation::{ValidationCode, ValidationResult};

/// Default ceiling on the total number of input nodes.
pub const DEFAULT_MAX_NODES: usize = 100_000;

/// How attribute values that differ across matched nodes are resolved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    /// Union of keys; objects merged recursively, arrays unioned, first non-null scalar.
    #[default]
    Merge,
    /// Value from the earliest repository that has one.
    First,
    /// Value from the latest repository that has one.
    Last,
}

impl ConflictResolution {
    /// Wire representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Merge => "merge",
            Self::First => "first",
            Self::Last => "last",
        }
    }
}

impl fmt::Display for ConflictResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictResolution {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "merge" => Ok(Self::Merge),
            "first" => Ok(Self::First),
            "last" => Ok(Self::Last),
            other => Err(Error::InvalidConflictResolution(other.to_string())),
        }
    }
}

/// Merge options as supplied by a caller, before validation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeOptionsInput {
    /// `merge`, `first` or `last`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict_resolution: Option<String>,
    /// Record one location per source node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preserve_source_info: Option<bool>,
    /// Emit edges whose endpoints come from different repositories.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_cross_repo_edges: Option<bool>,
    /// Ceiling on total input nodes; must be positive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_nodes: Option<i64>,
}

impl MergeOptionsInput {
    /// Record every problem with these options.
    pub fn validate_into(&self, result: &mut ValidationResult) {
        if let Some(strategy) = &self.conflict_resolution {
            if strategy.parse::<ConflictResolution>().is_err() {
                result.error(
                    ValidationCode::InvalidConflictResolution,
                    "mergeOptions.conflictResolution",
                    format!("unknown strategy '{strategy}', expected merge, first or last"),
                );
            }
        }
        if let Some(max_nodes) = self.max_nodes {
            if max_nodes <= 0 {
                result.error(
                    ValidationCode::InvalidMaxNodes,
                    "mergeOptions.maxNodes",
                    format!("maxNodes must be positive, got {max_nodes}"),
                );
            }
        }
    }
}

/// Validated merge options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeOptions {
    /// Attribute conflict strategy.
    pub conflict_resolution: ConflictResolution,
    /// Record one location per source node.
    pub preserve_source_info: bool,
    /// Emit edges whose endpoints come from different repositories.
    pub create_cross_repo_edges: bool,
    /// Ceiling on total input nodes.
    pub max_nodes: usize,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            conflict_resolution: ConflictResolution::Merge,
            preserve_source_info: true,
            create_cross_repo_edges: true,
            max_nodes: DEFAULT_MAX_NODES,
        }
    }
}

impl TryFrom<&MergeOptionsInput> for MergeOptions {
    type Error = Error;

    fn try_from(input: &MergeOptionsInput) -> Result<Self> {
        let defaults = Self::default();
        let conflict_resolution = input
            .conflict_resolution
            .as_deref()
            .map(str::parse::<ConflictResolution>)
            .transpose()?
            .unwrap_or(defaults.conflict_resolution);
        let max_nodes = match input.max_nodes {
            None => defaults.max_nodes,
            Some(n) if n > 0 => usize::try_from(n).unwrap_or(usize::MAX),
            Some(n) => return Err(Error::InvalidMaxNodes(n)),
        };
        Ok(Self {
            conflict_resolution,
            preserve_source_info: input
                .preserve_source_info
                .unwrap_or(defaults.preserve_source_info),
            create_cross_repo_edges: input
                .create_cross_repo_edges
                .unwrap_or(defaults.create_cross_repo_edges),
            max_nodes,
        })
    }
}

/// Everything a merge consumes.
#[derive(Debug, Clone, Default)]
pub struct MergeInput {
    /// Graphs in priority order; "first" and "last" refer to this order.
    pub graphs: Vec<GraphSnapshot>,
    /// Pairwise matches, typically from [`crate::matcher::Matcher`].
    pub matches: Vec<MatchResult>,
    /// Validated options.
    pub options: MergeOptions,
}

/// Where one source node of a merged node was found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    /// Repository of the source node.
    pub repository_id: RepositoryId,
    /// Scan of the source node.
    pub scan_id: ScanId,
    /// The source node.
    pub node_id: NodeId,
    /// Declaring file, when the scanner recorded one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    /// Declaring line, when the scanner recorded one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

impl Location {
    /// Location of `node`.
    #[must_use]
    pub fn of(node: &GraphNode) -> Self {
        let file_path = ["file_path", "filePath", "file"]
            .iter()
            .find_map(|key| node.attribute_str(key))
            .map(str::to_string);
        let line = node
            .attributes
            .get("line")
            .and_then(Value::as_u64)
            .and_then(|l| u32::try_from(l).ok());
        Self {
            repository_id: node.repository_id.clone(),
            scan_id: node.scan_id.clone(),
            node_id: node.id.clone(),
            file_path,
            line,
        }
    }
}

/// An attribute key whose values differed across matched nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeConflict {
    /// Top-level attribute key.
    pub key: String,
    /// Distinct non-null values, in source order.
    pub values: Vec<Value>,
    /// Value kept after resolution.
    pub resolved: Value,
}

/// One node standing for a group of equivalent source nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergedNode {
    /// New identifier, disjoint from every source node id.
    pub id: NodeId,
    /// Resolved resource type.
    pub node_type: String,
    /// Resolved name (most common value).
    pub name: String,
    /// First namespace found among the sources.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Source nodes, unique, in input order.
    pub source_node_ids: Vec<NodeId>,
    /// Source repositories, unique, in input order.
    pub source_repo_ids: Vec<RepositoryId>,
    /// One entry per source node when source info is preserved.
    pub locations: Vec<Location>,
    /// Conflict-resolved attributes.
    pub metadata: Attributes,
    /// Keys that had more than one distinct value.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<AttributeConflict>,
}

/// An edge of the merged graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergedEdge {
    /// Edge identifier.
    pub id: EdgeId,
    /// Source node: a merged node id or an unmatched source node id.
    pub source_id: NodeId,
    /// Target node: a merged node id or an unmatched source node id.
    pub target_id: NodeId,
    /// Relationship type.
    #[serde(rename = "type")]
    pub edge_type: String,
    /// Highest confidence among the collapsed source edges.
    pub confidence: u8,
    /// Original endpoints lived in different repositories.
    pub is_cross_repo: bool,
    /// Source edges collapsed into this edge.
    pub source_edge_ids: Vec<EdgeId>,
}

/// Counters describing a merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeStatistics {
    /// Total input nodes.
    pub nodes_before_merge: usize,
    /// Merged plus unmatched nodes.
    pub nodes_after_merge: usize,
    /// Total input edges.
    pub edges_before_merge: usize,
    /// Edges after remapping, deduplication and filtering.
    pub edges_after_merge: usize,
    /// Attribute keys with conflicting values.
    pub conflicts: usize,
    /// Conflicts settled by the resolution strategy.
    pub conflicts_resolved: usize,
    /// Emitted edges whose original endpoints were in different repositories.
    pub cross_repo_edges: usize,
}

/// The unified multi-repository graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeOutput {
    /// One node per match group.
    pub merged_nodes: Vec<MergedNode>,
    /// Nodes no match touched, unchanged.
    pub unmatched_nodes: Vec<GraphNode>,
    /// Remapped edges.
    pub edges: Vec<MergedEdge>,
    /// Counters.
    pub statistics: MergeStatistics,
    /// Non-fatal problems (matches with unknown nodes, ...).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

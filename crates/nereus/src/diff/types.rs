//! Diff options and results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::DiffConfig;
use crate::identity::{EdgeIdentity, NodeIdentity, hash_parts};
use crate::types::{EdgeId, NodeId, ScanId};

/// Classification of a node or edge between two snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    /// Only in the target snapshot.
    Added,
    /// Only in the base snapshot.
    Removed,
    /// In both, with different attributes.
    Modified,
    /// In both, identical.
    Unchanged,
}

/// Classification of a single attribute path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeChangeType {
    /// Path only in the target.
    Added,
    /// Path only in the base.
    Removed,
    /// Path in both with different values.
    Modified,
}

/// A changed attribute path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeChange {
    /// Dotted path, e.g. `tags.env`.
    pub path: String,
    /// Value in the base snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_value: Option<Value>,
    /// Value in the target snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_value: Option<Value>,
    /// What happened to the path.
    pub change_type: AttributeChangeType,
}

/// Change of one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDiff {
    /// Classification.
    pub change_type: ChangeType,
    /// Identity shared by both sides.
    pub identity: NodeIdentity,
    /// Node id in the base snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_node_id: Option<NodeId>,
    /// Node id in the target snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_node_id: Option<NodeId>,
    /// Changed attributes of a modified node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute_changes: Option<Vec<AttributeChange>>,
}

/// Change of one edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeDiff {
    /// Classification.
    pub change_type: ChangeType,
    /// Identity shared by both sides.
    pub identity: EdgeIdentity,
    /// Edge id in the base snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_edge_id: Option<EdgeId>,
    /// Edge id in the target snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_edge_id: Option<EdgeId>,
    /// Changed attributes (and `confidence`) of a modified edge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute_changes: Option<Vec<AttributeChange>>,
}

/// Per-classification counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeCounts {
    /// Added.
    pub added: usize,
    /// Removed.
    pub removed: usize,
    /// Modified.
    pub modified: usize,
    /// Unchanged.
    pub unchanged: usize,
}

impl ChangeCounts {
    /// Added + removed + modified.
    #[must_use]
    pub fn changes(&self) -> usize {
        self.added + self.removed + self.modified
    }

    pub(crate) fn record(&mut self, change: ChangeType) {
        match change {
            ChangeType::Added => self.added += 1,
            ChangeType::Removed => self.removed += 1,
            ChangeType::Modified => self.modified += 1,
            ChangeType::Unchanged => self.unchanged += 1,
        }
    }
}

/// Aggregate view of a diff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffSummary {
    /// Nodes in the base snapshot after filtering.
    pub base_node_count: usize,
    /// Nodes in the target snapshot after filtering.
    pub target_node_count: usize,
    /// Edges in the base snapshot after filtering.
    pub base_edge_count: usize,
    /// Edges in the target snapshot after filtering.
    pub target_edge_count: usize,
    /// Node classification counts.
    pub nodes: ChangeCounts,
    /// Edge classification counts.
    pub edges: ChangeCounts,
    /// Node changes over base node count.
    pub node_change_ratio: f64,
    /// Edge changes over base edge count.
    pub edge_change_ratio: f64,
    /// All changes over base node plus edge count.
    pub overall_change_ratio: f64,
    /// Overall ratio is above the significance threshold.
    pub is_significant_change: bool,
}

/// Time spent in each diff phase, in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffTiming {
    /// Identity extraction of both snapshots.
    pub identity_extraction_ms: f64,
    /// Node partition and attribute comparison.
    pub node_comparison_ms: f64,
    /// Edge partition and attribute comparison.
    pub edge_comparison_ms: f64,
    /// Summary computation.
    pub summary_ms: f64,
    /// Whole diff.
    pub total_ms: f64,
}

/// Structural difference between two snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffResult {
    /// Stable id derived from both snapshots and the options.
    pub diff_id: String,
    /// Snapshot the diff starts from.
    pub base_snapshot_id: ScanId,
    /// Snapshot the diff ends at.
    pub target_snapshot_id: ScanId,
    /// Node changes: base order, then additions in target order.
    pub node_diffs: Vec<NodeDiff>,
    /// Edge changes: base order, then additions in target order.
    pub edge_diffs: Vec<EdgeDiff>,
    /// Counts and ratios.
    pub summary: DiffSummary,
    /// Phase timings.
    pub timing: DiffTiming,
    /// When the diff was computed.
    pub computed_at: DateTime<Utc>,
    /// Non-fatal anomalies such as duplicate identities.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// Options controlling a diff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DiffOptions {
    /// Report unchanged nodes and edges too.
    pub include_unchanged: bool,
    /// Report attribute-level changes of modified elements.
    pub include_attribute_changes: bool,
    /// Only diff nodes of these types.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub include_node_types: Option<Vec<String>>,
    /// Never diff nodes of these types.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub exclude_node_types: Vec<String>,
    /// Only diff edges of these types.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub include_edge_types: Option<Vec<String>>,
    /// Never diff edges of these types.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub exclude_edge_types: Vec<String>,
    /// Node cap per snapshot after filtering.
    pub max_nodes: usize,
    /// Edge cap per snapshot after filtering.
    pub max_edges: usize,
    /// Hard time budget.
    pub timeout_ms: u64,
    /// Overall change ratio above which a diff is significant.
    pub significant_change_threshold: f64,
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self::from_config(&DiffConfig::default())
    }
}

impl DiffOptions {
    /// Options with defaults taken from configuration.
    #[must_use]
    pub fn from_config(config: &DiffConfig) -> Self {
        Self {
            include_unchanged: false,
            include_attribute_changes: true,
            include_node_types: None,
            exclude_node_types: Vec::new(),
            include_edge_types: None,
            exclude_edge_types: Vec::new(),
            max_nodes: config.max_nodes,
            max_edges: config.max_edges,
            timeout_ms: config.timeout_ms,
            significant_change_threshold: config.significant_change_threshold,
        }
    }

    /// Hash of every option that affects the result, for cache keys.
    #[must_use]
    pub fn options_hash(&self) -> String {
        // serializing a plain struct of strings and numbers cannot fail
        let encoded = serde_json::to_string(self).unwrap_or_default();
        hash_parts(&["diff-options", &encoded])[..16].to_string()
    }

    pub(crate) fn accepts_node_type(&self, node_type: &str) -> bool {
        accepts(self.include_node_types.as_deref(), &self.exclude_node_types, node_type)
    }

    pub(crate) fn accepts_edge_type(&self, edge_type: &str) -> bool {
        accepts(self.include_edge_types.as_deref(), &self.exclude_edge_types, edge_type)
    }
}

fn accepts(include: Option<&[String]>, exclude: &[String], value: &str) -> bool {
    include.is_none_or(|types| types.iter().any(|t| t == value))
        && !exclude.iter().any(|t| t == value)
}

/// Size of one snapshot, as reported by the graph store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotSize {
    /// Node count.
    pub nodes: usize,
    /// Edge count.
    pub edges: usize,
}

/// Predicted cost of a diff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostEstimate {
    /// Predicted wall time.
    pub estimated_time_ms: u64,
    /// Predicted peak memory.
    pub estimated_memory_bytes: u64,
    /// Nodes across both snapshots.
    pub total_nodes: usize,
    /// Edges across both snapshots.
    pub total_edges: usize,
    /// The diff would pass the caps and the time budget.
    pub within_limits: bool,
    /// Caps or budgets the diff would come close to or exceed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

//! Graph diff engine.
//!
//! Compares two snapshots by *identity*, not by store id: a node that keeps
//! its type, namespace and name across scans is the same node even though the
//! scan pipeline issued it a new id.
//!
//! Pipeline, each phase timed:
//!
//! 1. Identity extraction for nodes and edges of both snapshots
//! 2. Node partition: base-only removed, target-only added, both compared
//! 3. Edge partition, same rules, confidence compared as well
//! 4. Summary counts and change ratios
//!
//! ## Module Structure
//!
//! - `types` - Options, results, summary and cost estimate
//! - `attributes` - Attribute-level comparison
//! - `cache` - In-memory diff result cache
//! - `service` - Tenant-scoped orchestration over the graph store

mod attributes;
mod cache;
mod service;
mod types;

pub use attributes::diff_attributes;
pub use cache::{CacheInfo, DiffCache};
pub use service::{DiffJobStatus, DiffOutcome, DiffRequest, DiffService, DiffStatus};
pub use types::{
    AttributeChange, AttributeChangeType, ChangeCounts, ChangeType, CostEstimate, DiffOptions,
    DiffResult, DiffSummary, DiffTiming, EdgeDiff, NodeDiff, SnapshotSize,
};

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::json;
use tracing::{debug, warn};

use crate::config::DiffConfig;
use crate::error::{Error, Result};
use crate::identity::{self, NodeIdentity, hash_parts};
use crate::types::{GraphEdge, GraphNode, GraphSnapshot, ScanId};

/// Iterations between two deadline checks inside a comparison loop.
const DEADLINE_CHECK_INTERVAL: usize = 1_024;

/// Estimated cost per node and per edge, in microseconds.
const NODE_COST_US: u64 = 12;
const EDGE_COST_US: u64 = 6;
/// Fixed overhead of any diff.
const BASE_COST_MS: u64 = 5;
/// Estimated resident bytes per node and per edge during a diff.
const NODE_MEMORY_BYTES: u64 = 1_024;
const EDGE_MEMORY_BYTES: u64 = 512;
/// Fraction of a cap at which the estimate starts warning.
const NEAR_LIMIT_RATIO: f64 = 0.8;

/// Derive the stable id of a diff.
#[must_use]
pub fn diff_id(base: &ScanId, target: &ScanId, options: &DiffOptions) -> String {
    let hash = hash_parts(&[
        "diff",
        base.as_str(),
        target.as_str(),
        &options.options_hash(),
    ]);
    format!("diff-{}", &hash[..16])
}

struct Deadline {
    start: Instant,
    budget: Duration,
    budget_ms: u64,
}

impl Deadline {
    fn new(budget_ms: u64) -> Self {
        Self {
            start: Instant::now(),
            budget: Duration::from_millis(budget_ms),
            budget_ms,
        }
    }

    fn check(&self) -> Result<()> {
        if self.start.elapsed() > self.budget {
            return Err(Error::Timeout {
                operation: "diff",
                budget_ms: self.budget_ms,
            });
        }
        Ok(())
    }

    fn check_every(&self, iteration: usize) -> Result<()> {
        if iteration % DEADLINE_CHECK_INTERVAL == 0 {
            self.check()
        } else {
            Ok(())
        }
    }
}

/// Snapshot contents that survived the type filters.
struct Filtered<'a> {
    nodes: Vec<&'a GraphNode>,
    edges: Vec<&'a GraphEdge>,
}

fn filter_snapshot<'a>(snapshot: &'a GraphSnapshot, options: &DiffOptions) -> Filtered<'a> {
    let mut excluded: HashSet<&str> = HashSet::new();
    let mut nodes = Vec::with_capacity(snapshot.nodes.len());
    for node in &snapshot.nodes {
        if options.accepts_node_type(&node.node_type) {
            nodes.push(node);
        } else {
            excluded.insert(node.id.as_str());
        }
    }
    let edges = snapshot
        .edges
        .iter()
        .filter(|e| {
            options.accepts_edge_type(&e.edge_type)
                && !excluded.contains(e.source_id.as_str())
                && !excluded.contains(e.target_id.as_str())
        })
        .collect();
    Filtered { nodes, edges }
}

/// Base and target positions matched by identity hash.
///
/// A hash that repeats within one side pairs its k-th base occurrence with
/// its k-th target occurrence, so every position lands in exactly one of
/// matched, removed (`None` partner) or added.
struct Pairing {
    /// Target partner of each base position, in base order.
    base: Vec<Option<usize>>,
    /// Target positions without a base partner, in target order.
    added: Vec<usize>,
}

fn pair_by_occurrence<'a>(
    base: impl Iterator<Item = (&'a str, &'a str)>,
    target: impl Iterator<Item = (&'a str, &'a str)>,
    kind: &str,
    warnings: &mut Vec<String>,
) -> Pairing {
    let mut queues: HashMap<&'a str, VecDeque<usize>> = HashMap::new();
    let mut target_len = 0;
    for (j, (hash, key)) in target.enumerate() {
        let queue = queues.entry(hash).or_default();
        if !queue.is_empty() {
            warnings.push(format!(
                "duplicate {kind} identity '{key}' in target snapshot; paired by occurrence"
            ));
        }
        queue.push_back(j);
        target_len = j + 1;
    }

    let mut seen = HashSet::new();
    let base = base
        .map(|(hash, key)| {
            if !seen.insert(hash) {
                warnings.push(format!(
                    "duplicate {kind} identity '{key}' in base snapshot; paired by occurrence"
                ));
            }
            queues.get_mut(hash).and_then(VecDeque::pop_front)
        })
        .collect();

    let mut matched = vec![true; target_len];
    for &j in queues.values().flatten() {
        matched[j] = false;
    }
    let added = (0..target_len).filter(|&j| !matched[j]).collect();
    Pairing { base, added }
}

/// Identity of each node id; the first node wins when ids repeat.
fn lookup_by_id<'a>(
    nodes: &[&'a GraphNode],
    identities: &'a [NodeIdentity],
) -> HashMap<&'a str, &'a NodeIdentity> {
    let mut lookup = HashMap::with_capacity(nodes.len());
    for (node, identity) in nodes.iter().zip(identities) {
        lookup.entry(node.id.as_str()).or_insert(identity);
    }
    lookup
}

#[allow(clippy::cast_precision_loss)]
fn ratio(changes: usize, total: usize) -> f64 {
    changes as f64 / total.max(1) as f64
}

fn elapsed_ms(since: Instant) -> f64 {
    since.elapsed().as_secs_f64() * 1_000.0
}

/// Computes diffs between snapshots.
#[derive(Debug, Clone, Default)]
pub struct GraphDiffEngine {
    config: DiffConfig,
}

impl GraphDiffEngine {
    /// Create an engine whose default options come from `config`.
    #[must_use]
    pub fn new(config: DiffConfig) -> Self {
        Self { config }
    }

    /// Default options for this engine.
    #[must_use]
    pub fn default_options(&self) -> DiffOptions {
        DiffOptions::from_config(&self.config)
    }

    /// Compute the diff from `base` to `target`.
    ///
    /// Fails without a partial result when a cap or the time budget is exceeded.
    pub fn compute_diff(
        &self,
        base: &GraphSnapshot,
        target: &GraphSnapshot,
        options: &DiffOptions,
    ) -> Result<DiffResult> {
        let deadline = Deadline::new(options.timeout_ms);
        let mut timing = DiffTiming::default();
        let mut warnings = Vec::new();

        let base_f = filter_snapshot(base, options);
        let target_f = filter_snapshot(target, options);

        let most_nodes = base_f.nodes.len().max(target_f.nodes.len());
        if most_nodes > options.max_nodes {
            return Err(Error::MaxNodesExceeded {
                actual: most_nodes,
                maximum: options.max_nodes,
            });
        }
        let most_edges = base_f.edges.len().max(target_f.edges.len());
        if most_edges > options.max_edges {
            return Err(Error::MaxEdgesExceeded {
                actual: most_edges,
                maximum: options.max_edges,
            });
        }

        // Phase 1: identities
        let phase = Instant::now();
        let base_nodes = identity::node_identities(&base_f.nodes);
        let target_nodes = identity::node_identities(&target_f.nodes);
        let base_lookup = lookup_by_id(&base_f.nodes, &base_nodes);
        let target_lookup = lookup_by_id(&target_f.nodes, &target_nodes);
        let base_edges =
            identity::edge_identities(&base_f.edges, &base.repository_id, &base_lookup);
        let target_edges =
            identity::edge_identities(&target_f.edges, &target.repository_id, &target_lookup);
        timing.identity_extraction_ms = elapsed_ms(phase);
        deadline.check()?;

        // Phase 2: nodes
        let phase = Instant::now();
        let mut node_counts = ChangeCounts::default();
        let mut node_diffs = Vec::new();
        let pairing = pair_by_occurrence(
            base_nodes.iter().map(|n| (n.identity_hash.as_str(), n.key.as_str())),
            target_nodes.iter().map(|n| (n.identity_hash.as_str(), n.key.as_str())),
            "node",
            &mut warnings,
        );

        for (i, &partner) in pairing.base.iter().enumerate() {
            deadline.check_every(i)?;
            let identity = &base_nodes[i];
            let old = base_f.nodes[i];
            let (change_type, target_node_id, changes) = match partner {
                None => (ChangeType::Removed, None, Vec::new()),
                Some(j) => {
                    let new = target_f.nodes[j];
                    let changes = diff_attributes(&old.attributes, &new.attributes);
                    let change = if changes.is_empty() {
                        ChangeType::Unchanged
                    } else {
                        ChangeType::Modified
                    };
                    (change, Some(new.id.clone()), changes)
                }
            };
            node_counts.record(change_type);
            if change_type != ChangeType::Unchanged || options.include_unchanged {
                node_diffs.push(NodeDiff {
                    change_type,
                    identity: identity.clone(),
                    base_node_id: Some(old.id.clone()),
                    target_node_id,
                    attribute_changes: (change_type == ChangeType::Modified
                        && options.include_attribute_changes)
                        .then_some(changes),
                });
            }
        }
        for (step, &j) in pairing.added.iter().enumerate() {
            deadline.check_every(step)?;
            let identity = &target_nodes[j];
            node_counts.record(ChangeType::Added);
            node_diffs.push(NodeDiff {
                change_type: ChangeType::Added,
                identity: identity.clone(),
                base_node_id: None,
                target_node_id: Some(target_f.nodes[j].id.clone()),
                attribute_changes: None,
            });
        }
        timing.node_comparison_ms = elapsed_ms(phase);
        deadline.check()?;

        // Phase 3: edges
        let phase = Instant::now();
        let mut edge_counts = ChangeCounts::default();
        let mut edge_diffs = Vec::new();
        let pairing = pair_by_occurrence(
            base_edges.iter().map(|e| (e.identity_hash.as_str(), e.key.as_str())),
            target_edges.iter().map(|e| (e.identity_hash.as_str(), e.key.as_str())),
            "edge",
            &mut warnings,
        );

        for (i, &partner) in pairing.base.iter().enumerate() {
            deadline.check_every(i)?;
            let identity = &base_edges[i];
            let old = base_f.edges[i];
            let (change_type, target_edge_id, changes) = match partner {
                None => (ChangeType::Removed, None, Vec::new()),
                Some(j) => {
                    let new = target_f.edges[j];
                    let changes = edge_changes(old, new);
                    let change = if changes.is_empty() {
                        ChangeType::Unchanged
                    } else {
                        ChangeType::Modified
                    };
                    (change, Some(new.id.clone()), changes)
                }
            };
            edge_counts.record(change_type);
            if change_type != ChangeType::Unchanged || options.include_unchanged {
                edge_diffs.push(EdgeDiff {
                    change_type,
                    identity: identity.clone(),
                    base_edge_id: Some(old.id.clone()),
                    target_edge_id,
                    attribute_changes: (change_type == ChangeType::Modified
                        && options.include_attribute_changes)
                        .then_some(changes),
                });
            }
        }
        for (step, &j) in pairing.added.iter().enumerate() {
            deadline.check_every(step)?;
            let identity = &target_edges[j];
            edge_counts.record(ChangeType::Added);
            edge_diffs.push(EdgeDiff {
                change_type: ChangeType::Added,
                identity: identity.clone(),
                base_edge_id: None,
                target_edge_id: Some(target_f.edges[j].id.clone()),
                attribute_changes: None,
            });
        }
        timing.edge_comparison_ms = elapsed_ms(phase);
        deadline.check()?;

        // Phase 4: summary
        let phase = Instant::now();
        let base_node_count = base_f.nodes.len();
        let base_edge_count = base_f.edges.len();
        let overall_change_ratio = ratio(
            node_counts.changes() + edge_counts.changes(),
            base_node_count + base_edge_count,
        );
        let summary = DiffSummary {
            base_node_count,
            target_node_count: target_f.nodes.len(),
            base_edge_count,
            target_edge_count: target_f.edges.len(),
            nodes: node_counts,
            edges: edge_counts,
            node_change_ratio: ratio(node_counts.changes(), base_node_count),
            edge_change_ratio: ratio(edge_counts.changes(), base_edge_count),
            overall_change_ratio,
            is_significant_change: overall_change_ratio > options.significant_change_threshold,
        };
        timing.summary_ms = elapsed_ms(phase);
        timing.total_ms = elapsed_ms(deadline.start);

        for message in &warnings {
            warn!(base = %base.scan_id, target = %target.scan_id, "{message}");
        }
        debug!(
            base = %base.scan_id,
            target = %target.scan_id,
            nodes_added = node_counts.added,
            nodes_removed = node_counts.removed,
            nodes_modified = node_counts.modified,
            edges_changed = edge_counts.changes(),
            total_ms = timing.total_ms,
            "Computed diff"
        );

        Ok(DiffResult {
            diff_id: diff_id(&base.scan_id, &target.scan_id, options),
            base_snapshot_id: base.scan_id.clone(),
            target_snapshot_id: target.scan_id.clone(),
            node_diffs,
            edge_diffs,
            summary,
            timing,
            computed_at: Utc::now(),
            warnings,
        })
    }

    /// Predict the cost of diffing two snapshots of the given sizes.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn estimate_cost(
        &self,
        base: SnapshotSize,
        target: SnapshotSize,
        options: &DiffOptions,
    ) -> CostEstimate {
        let total_nodes = base.nodes + target.nodes;
        let total_edges = base.edges + target.edges;
        let estimated_time_ms = BASE_COST_MS
            + (total_nodes as u64 * NODE_COST_US + total_edges as u64 * EDGE_COST_US) / 1_000;
        let estimated_memory_bytes =
            total_nodes as u64 * NODE_MEMORY_BYTES + total_edges as u64 * EDGE_MEMORY_BYTES;

        let mut warnings = Vec::new();
        let mut within_limits = true;
        let most_nodes = base.nodes.max(target.nodes);
        let most_edges = base.edges.max(target.edges);

        for (what, actual, cap) in [
            ("nodes", most_nodes, options.max_nodes),
            ("edges", most_edges, options.max_edges),
        ] {
            if actual > cap {
                within_limits = false;
                warnings.push(format!("snapshot has {actual} {what}, cap is {cap}"));
            } else if near_limit(actual as f64, cap as f64) {
                warnings.push(format!("snapshot {what} ({actual}) close to cap {cap}"));
            }
        }
        if estimated_time_ms > options.timeout_ms {
            within_limits = false;
            warnings.push(format!(
                "estimated {estimated_time_ms}ms exceeds the {}ms budget",
                options.timeout_ms
            ));
        } else if near_limit(estimated_time_ms as f64, options.timeout_ms as f64) {
            warnings.push(format!(
                "estimated {estimated_time_ms}ms is close to the {}ms budget",
                options.timeout_ms
            ));
        }

        CostEstimate {
            estimated_time_ms,
            estimated_memory_bytes,
            total_nodes,
            total_edges,
            within_limits,
            warnings,
        }
    }
}

fn near_limit(actual: f64, cap: f64) -> bool {
    cap > 0.0 && actual >= cap * NEAR_LIMIT_RATIO
}

/// Attribute changes of an edge plus a `confidence` change.
fn edge_changes(old: &GraphEdge, new: &GraphEdge) -> Vec<AttributeChange> {
    let mut changes = diff_attributes(&old.attributes, &new.attributes);
    if old.confidence != new.confidence {
        changes.push(AttributeChange {
            path: "confidence".to_string(),
            previous_value: Some(json!(old.confidence)),
            new_value: Some(json!(new.confidence)),
            change_type: AttributeChangeType::Modified,
        });
        changes.sort_by(|a, b| a.path.cmp(&b.path));
    }
    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GraphNode, NodeId};

    fn base() -> GraphSnapshot {
        GraphSnapshot::new("t", "infra", "scan-1")
            .with_node(
                GraphNode::new("n1", "aws_vpc", "main", "", "")
                    .with_attribute("cidr", json!("10.0.0.0/16")),
            )
            .with_node(GraphNode::new("n2", "aws_subnet", "a", "", ""))
            .with_node(GraphNode::new("n3", "aws_subnet", "b", "", ""))
            .with_edge(GraphEdge::new("e1", "n2", "n1", "CONTAINED_IN", 90))
            .with_edge(GraphEdge::new("e2", "n3", "n1", "CONTAINED_IN", 90))
    }

    fn target() -> GraphSnapshot {
        // new ids, cidr changed, subnet b removed, subnet c added, confidence changed
        GraphSnapshot::new("t", "infra", "scan-2")
            .with_node(
                GraphNode::new("m1", "aws_vpc", "main", "", "")
                    .with_attribute("cidr", json!("10.1.0.0/16")),
            )
            .with_node(GraphNode::new("m2", "aws_subnet", "a", "", ""))
            .with_node(GraphNode::new("m4", "aws_subnet", "c", "", ""))
            .with_edge(GraphEdge::new("f1", "m2", "m1", "CONTAINED_IN", 75))
            .with_edge(GraphEdge::new("f4", "m4", "m1", "CONTAINED_IN", 90))
    }

    fn engine() -> GraphDiffEngine {
        GraphDiffEngine::new(DiffConfig::default())
    }

    #[test]
    fn classifies_nodes_by_identity() {
        let result = engine()
            .compute_diff(&base(), &target(), &DiffOptions::default())
            .unwrap();

        let nodes = result.summary.nodes;
        assert_eq!((nodes.added, nodes.removed, nodes.modified, nodes.unchanged), (1, 1, 1, 1));
        // unchanged omitted by default
        assert_eq!(result.node_diffs.len(), 3);

        let modified = result
            .node_diffs
            .iter()
            .find(|d| d.change_type == ChangeType::Modified)
            .unwrap();
        let changes = modified.attribute_changes.as_ref().unwrap();
        assert_eq!(changes[0].path, "cidr");
        assert_eq!(modified.base_node_id.as_ref().unwrap().as_str(), "n1");
        assert_eq!(modified.target_node_id.as_ref().unwrap().as_str(), "m1");
    }

    #[test]
    fn edges_compare_confidence() {
        let result = engine()
            .compute_diff(&base(), &target(), &DiffOptions::default())
            .unwrap();

        let edges = result.summary.edges;
        assert_eq!((edges.added, edges.removed, edges.modified), (1, 1, 1));
        let modified = result
            .edge_diffs
            .iter()
            .find(|d| d.change_type == ChangeType::Modified)
            .unwrap();
        assert_eq!(modified.attribute_changes.as_ref().unwrap()[0].path, "confidence");
    }

    #[test]
    fn change_ratios() {
        let result = engine()
            .compute_diff(&base(), &target(), &DiffOptions::default())
            .unwrap();

        let summary = &result.summary;
        assert!((summary.node_change_ratio - 1.0).abs() < f64::EPSILON);
        assert!((summary.edge_change_ratio - 1.5).abs() < f64::EPSILON);
        assert!((summary.overall_change_ratio - 6.0 / 5.0).abs() < f64::EPSILON);
        assert!(summary.is_significant_change);
    }

    #[test]
    fn self_diff_is_empty() {
        let snapshot = base();
        let options = DiffOptions {
            include_unchanged: true,
            ..DiffOptions::default()
        };

        let result = engine().compute_diff(&snapshot, &snapshot, &options).unwrap();

        assert_eq!(result.summary.nodes.changes(), 0);
        assert_eq!(result.summary.nodes.unchanged, 3);
        assert_eq!(result.node_diffs.len(), 3);
        assert!(!result.summary.is_significant_change);
    }

    #[test]
    fn empty_snapshots_have_zero_ratios() {
        let empty = GraphSnapshot::new("t", "r", "s");
        let result = engine()
            .compute_diff(&empty, &empty, &DiffOptions::default())
            .unwrap();

        assert!(result.summary.overall_change_ratio.abs() < f64::EPSILON);
    }

    #[test]
    fn type_filters_apply_before_comparison() {
        let options = DiffOptions {
            include_node_types: Some(vec!["aws_vpc".into()]),
            ..DiffOptions::default()
        };
        let result = engine().compute_diff(&base(), &target(), &options).unwrap();

        assert_eq!(result.summary.base_node_count, 1);
        // every edge touches a filtered-out subnet
        assert_eq!(result.summary.base_edge_count, 0);
        assert_eq!(result.summary.nodes.modified, 1);
    }

    #[test]
    fn node_cap_is_enforced() {
        let options = DiffOptions {
            max_nodes: 2,
            ..DiffOptions::default()
        };
        let err = engine().compute_diff(&base(), &target(), &options).unwrap_err();
        assert!(matches!(err, Error::MaxNodesExceeded { actual: 3, maximum: 2 }));
    }

    #[test]
    fn edge_cap_is_enforced() {
        let options = DiffOptions {
            max_edges: 1,
            ..DiffOptions::default()
        };
        let err = engine().compute_diff(&base(), &target(), &options).unwrap_err();
        assert!(matches!(err, Error::MaxEdgesExceeded { actual: 2, maximum: 1 }));
    }

    #[test]
    fn duplicate_identities_pair_by_occurrence_and_warn() {
        let doubled = base().with_node(GraphNode::new("dup", "aws_vpc", "main", "", ""));

        let same = engine()
            .compute_diff(&doubled, &doubled, &DiffOptions::default())
            .unwrap();
        assert_eq!(same.warnings.len(), 2);
        assert_eq!(same.summary.nodes.changes(), 0);
        assert_eq!(same.summary.nodes.unchanged, doubled.nodes.len());

        let shrunk = engine()
            .compute_diff(&doubled, &base(), &DiffOptions::default())
            .unwrap();
        assert_eq!(shrunk.warnings.len(), 1);
        assert_eq!(shrunk.summary.nodes.removed, 1);
        assert_eq!(shrunk.summary.nodes.unchanged, 3);
        let removed: Vec<_> = shrunk
            .node_diffs
            .iter()
            .filter_map(|d| d.base_node_id.as_ref())
            .collect();
        assert_eq!(removed, vec![&NodeId::from("dup")]);
    }

    #[test]
    fn attribute_changes_can_be_suppressed() {
        let options = DiffOptions {
            include_attribute_changes: false,
            ..DiffOptions::default()
        };
        let result = engine().compute_diff(&base(), &target(), &options).unwrap();

        assert!(result.node_diffs.iter().all(|d| d.attribute_changes.is_none()));
        assert_eq!(result.summary.nodes.modified, 1);
    }

    #[test]
    fn diff_id_is_stable() {
        let options = DiffOptions::default();
        let a = engine().compute_diff(&base(), &target(), &options).unwrap();
        let b = engine().compute_diff(&base(), &target(), &options).unwrap();

        assert_eq!(a.diff_id, b.diff_id);
        assert_ne!(a.diff_id, diff_id(&"scan-2".into(), &"scan-1".into(), &options));
    }

    #[test]
    fn cost_estimate_flags_oversized_inputs() {
        let options = DiffOptions {
            max_nodes: 100,
            ..DiffOptions::default()
        };
        let estimate = engine().estimate_cost(
            SnapshotSize { nodes: 150, edges: 10 },
            SnapshotSize { nodes: 90, edges: 10 },
            &options,
        );

        assert_eq!(estimate.total_nodes, 240);
        assert_eq!(estimate.total_edges, 20);
        assert!(!estimate.within_limits);
        assert!(!estimate.warnings.is_empty());

        let small = engine().estimate_cost(
            SnapshotSize { nodes: 10, edges: 10 },
            SnapshotSize { nodes: 10, edges: 10 },
            &DiffOptions::default(),
        );
        assert!(small.within_limits);
        assert!(small.estimated_memory_bytes > 0);
    }
}

//! Merge engine: many repository graphs in, one unified graph out.
//!
//! Matches are closed transitively into groups. Every group becomes one
//! [`MergedNode`] with conflict-resolved attributes; nodes outside any group
//! pass through unchanged. Edges are rewritten onto merged nodes, collapsed
//! when remapping makes them identical, and tagged as cross-repository when
//! their original endpoints came from different repositories.
//!
//! ## Module Structure
//!
//! - `types` - Options, merged nodes and edges, statistics
//! - `conflict` - Attribute conflict detection and resolution

mod conflict;
mod types;

pub use types::{
    AttributeConflict, ConflictResolution, DEFAULT_MAX_NODES, Location, MergeInput, MergeOptions,
    MergeOptionsInput, MergeOutput, MergeStatistics, MergedEdge, MergedNode,
};

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::error::{Error, LimitType, Result};
use crate::identity::hash_parts;
use crate::matcher::{MatchGroups, MatchResult};
use crate::types::{EdgeId, GraphNode, GraphSnapshot, NodeId, RepositoryId};
use crate::validation::{ValidationCode, ValidationResult};

/// A node's place in the merge input: (graph index, node index).
type Position = (usize, usize);

/// Fewest graphs a merge accepts.
pub const MIN_GRAPHS: usize = 2;

/// Merges matched repository graphs.
#[derive(Debug, Clone, Copy, Default)]
pub struct MergeEngine;

impl MergeEngine {
    /// Create a merge engine.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Check merge input without running the merge.
    ///
    /// Duplicate repository ids are accepted. Matches naming nodes that no
    /// graph contains are warnings, since the merge simply skips them.
    #[must_use]
    pub fn validate_input(
        &self,
        graphs: &[GraphSnapshot],
        matches: &[MatchResult],
        options: &MergeOptionsInput,
    ) -> ValidationResult {
        let mut result = ValidationResult::default();

        if graphs.len() < MIN_GRAPHS {
            result.error(
                ValidationCode::InsufficientGraphs,
                "graphs",
                format!(
                    "at least {MIN_GRAPHS} graphs are required, got {}",
                    graphs.len()
                ),
            );
        }
        options.validate_into(&mut result);

        let known: HashSet<&str> = graphs
            .iter()
            .flat_map(|g| g.nodes.iter().map(|n| n.id.as_str()))
            .collect();
        for (i, m) in matches.iter().enumerate() {
            let sides = [
                ("sourceNodeId", &m.source_node_id),
                ("targetNodeId", &m.target_node_id),
            ];
            for (side, id) in sides {
                if !known.contains(id.as_str()) {
                    result.warn(
                        ValidationCode::UnknownMatchNode,
                        &format!("matches[{i}].{side}"),
                        format!("node {id} is not part of any input graph"),
                    );
                }
            }
        }

        result
    }

    /// Merge graphs along their matches.
    ///
    /// Node ids only need to be unique within their graph. A match resolves
    /// each side within the repository it names, and an edge resolves its
    /// endpoints within its own graph.
    pub fn merge(&self, input: &MergeInput) -> Result<MergeOutput> {
        let start = Instant::now();
        let graphs = &input.graphs;
        let options = &input.options;

        if graphs.len() < MIN_GRAPHS {
            return Err(Error::InsufficientGraphs {
                actual: graphs.len(),
                minimum: MIN_GRAPHS,
            });
        }

        let nodes_before: usize = graphs.iter().map(|g| g.nodes.len()).sum();
        if nodes_before > options.max_nodes {
            return Err(Error::LimitExceeded {
                limit_type: LimitType::Nodes,
                current: nodes_before,
                maximum: options.max_nodes,
            });
        }

        // nodes are addressed by (graph index, node index); ids may repeat
        // across graphs, so ids resolve through the owning repository first
        let mut local: Vec<HashMap<&str, usize>> = Vec::with_capacity(graphs.len());
        let mut by_repo: HashMap<(&str, &str), Position> = HashMap::with_capacity(nodes_before);
        let mut by_id: HashMap<&str, Position> = HashMap::with_capacity(nodes_before);
        for (g, graph) in graphs.iter().enumerate() {
            let mut ids = HashMap::with_capacity(graph.nodes.len());
            for (n, node) in graph.nodes.iter().enumerate() {
                let id = node.id.as_str();
                ids.entry(id).or_insert(n);
                by_repo.entry((graph.repository_id.as_str(), id)).or_insert((g, n));
                by_id.entry(id).or_insert((g, n));
            }
            local.push(ids);
        }
        let node_at = |(g, n): Position| &graphs[g].nodes[n];
        let resolve = |repo: &str, id: &str| {
            by_repo.get(&(repo, id)).or_else(|| by_id.get(id)).copied()
        };
        // edge endpoints belong to the edge's own graph when it has them
        let endpoint = |g: usize, id: &str| {
            local[g].get(id).map(|&n| (g, n)).or_else(|| by_id.get(id).copied())
        };

        let mut warnings = Vec::new();
        let mut pairs: Vec<(Position, Position)> = Vec::with_capacity(input.matches.len());
        for m in &input.matches {
            let source = resolve(m.source_repo_id.as_str(), m.source_node_id.as_str());
            let target = resolve(m.target_repo_id.as_str(), m.target_node_id.as_str());
            match source.zip(target) {
                Some(pair) => pairs.push(pair),
                None => warnings.push(format!(
                    "skipped match {} -> {}: node not in any input graph",
                    m.source_node_id, m.target_node_id
                )),
            }
        }
        let groups = MatchGroups::from_pairs(pairs);

        let mut used_ids: HashSet<String> = by_id.keys().map(|id| (*id).to_string()).collect();
        let mut remap: HashMap<Position, NodeId> = HashMap::new();
        let mut merged_nodes = Vec::with_capacity(groups.len());
        let mut conflicts = 0usize;

        for group in groups.groups() {
            let mut member_positions = group.clone();
            member_positions.sort_unstable();
            let members: Vec<&GraphNode> = member_positions.iter().map(|&p| node_at(p)).collect();

            let member_ids: Vec<&str> = members.iter().map(|m| m.id.as_str()).collect();
            let id = NodeId::new(allocate_id("merged", &member_ids, &mut used_ids));

            let mut source_repo_ids: Vec<RepositoryId> = Vec::new();
            for &(g, _) in &member_positions {
                let repo = &graphs[g].repository_id;
                if !source_repo_ids.contains(repo) {
                    source_repo_ids.push(repo.clone());
                }
            }

            let resolved = conflict::resolve_attributes(&members, options.conflict_resolution);
            conflicts += resolved.conflicts.len();

            let name = conflict::most_common(members.iter().map(|m| m.name.as_str()))
                .unwrap_or_default()
                .to_string();
            let node_type = conflict::most_common(members.iter().map(|m| m.node_type.as_str()))
                .unwrap_or_default()
                .to_string();

            for &position in &member_positions {
                remap.insert(position, id.clone());
            }

            merged_nodes.push(MergedNode {
                id,
                node_type,
                name,
                namespace: members.iter().find_map(|m| m.namespace.clone()),
                source_node_ids: members.iter().map(|m| m.id.clone()).collect(),
                source_repo_ids,
                locations: if options.preserve_source_info {
                    member_positions
                        .iter()
                        .map(|&(g, n)| {
                            let mut location = Location::of(node_at((g, n)));
                            location.repository_id = graphs[g].repository_id.clone();
                            location.scan_id = graphs[g].scan_id.clone();
                            location
                        })
                        .collect()
                } else {
                    Vec::new()
                },
                metadata: resolved.attributes,
                conflicts: resolved.conflicts,
            });
        }

        let unmatched_nodes: Vec<GraphNode> = graphs
            .iter()
            .enumerate()
            .flat_map(|(g, graph)| {
                graph.nodes.iter().enumerate().map(move |(n, node)| ((g, n), node))
            })
            .filter(|(position, _)| !remap.contains_key(position))
            .map(|(_, node)| node.clone())
            .collect();

        // edges: dedupe on (source, target, type) after remapping
        let mut edges: Vec<MergedEdge> = Vec::new();
        let mut edge_slots: HashMap<(NodeId, NodeId, String), usize> = HashMap::new();
        let mut used_edge_ids: HashSet<String> = HashSet::new();
        let mut edges_before = 0usize;
        let mut dropped_self_loops = 0usize;
        let mut dropped_cross_repo = 0usize;

        for (g, graph) in graphs.iter().enumerate() {
            for edge in &graph.edges {
                edges_before += 1;
                let source_at = endpoint(g, edge.source_id.as_str());
                let target_at = endpoint(g, edge.target_id.as_str());
                let source = source_at
                    .and_then(|p| remap.get(&p))
                    .cloned()
                    .unwrap_or_else(|| edge.source_id.clone());
                let target = target_at
                    .and_then(|p| remap.get(&p))
                    .cloned()
                    .unwrap_or_else(|| edge.target_id.clone());

                if source == target && edge.source_id != edge.target_id {
                    dropped_self_loops += 1;
                    continue;
                }

                let repo_of =
                    |at: Option<Position>| &graphs[at.map_or(g, |(g, _)| g)].repository_id;
                let is_cross_repo = repo_of(source_at) != repo_of(target_at);
                if is_cross_repo && !options.create_cross_repo_edges {
                    dropped_cross_repo += 1;
                    continue;
                }

                let key = (source.clone(), target.clone(), edge.edge_type.clone());
                if let Some(&slot) = edge_slots.get(&key) {
                    let existing = &mut edges[slot];
                    existing.confidence = existing.confidence.max(edge.confidence);
                    existing.is_cross_repo |= is_cross_repo;
                    existing.source_edge_ids.push(edge.id.clone());
                    continue;
                }

                let id = if used_edge_ids.insert(edge.id.as_str().to_string()) {
                    edge.id.clone()
                } else {
                    EdgeId::new(allocate_id(
                        "merged-edge",
                        &[source.as_str(), target.as_str(), edge.edge_type.as_str()],
                        &mut used_edge_ids,
                    ))
                };
                edge_slots.insert(key, edges.len());
                edges.push(MergedEdge {
                    id,
                    source_id: source,
                    target_id: target,
                    edge_type: edge.edge_type.clone(),
                    confidence: edge.confidence,
                    is_cross_repo,
                    source_edge_ids: vec![edge.id.clone()],
                });
            }
        }

        let statistics = MergeStatistics {
            nodes_before_merge: nodes_before,
            nodes_after_merge: merged_nodes.len() + unmatched_nodes.len(),
            edges_before_merge: edges_before,
            edges_after_merge: edges.len(),
            conflicts,
            conflicts_resolved: conflicts,
            cross_repo_edges: edges.iter().filter(|e| e.is_cross_repo).count(),
        };

        for message in &warnings {
            warn!(message = %message, "Merge input warning");
        }
        debug!(
            dropped_self_loops,
            dropped_cross_repo, "Edge remapping complete"
        );
        info!(
            graphs = graphs.len(),
            groups = merged_nodes.len(),
            nodes_before = statistics.nodes_before_merge,
            nodes_after = statistics.nodes_after_merge,
            edges_after = statistics.edges_after_merge,
            conflicts,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Merged graphs"
        );

        Ok(MergeOutput {
            merged_nodes,
            unmatched_nodes,
            edges,
            statistics,
            warnings,
        })
    }
}

/// Allocate `{prefix}-{hash}` not present in `used`, then reserve it.
fn allocate_id(prefix: &str, parts: &[&str], used: &mut HashSet<String>) -> String {
    let hash = hash_parts(parts);
    let base = format!("{prefix}-{}", &hash[..16]);
    let mut candidate = base.clone();
    let mut suffix = 1u32;
    while used.contains(&candidate) {
        candidate = format!("{base}-{suffix}");
        suffix += 1;
    }
    used.insert(candidate.clone());
    candidate
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::MatcherType;
    use crate::types::GraphEdge;
    use serde_json::json;

    fn matched(a: &str, b: &str) -> MatchResult {
        MatchResult {
            source_node_id: a.into(),
            target_node_id: b.into(),
            source_repo_id: "ra".into(),
            target_repo_id: "rb".into(),
            confidence: 100,
            matcher_type: MatcherType::Arn,
            priority: 50,
        }
    }

    fn graphs() -> Vec<GraphSnapshot> {
        vec![
            GraphSnapshot::new("t", "ra", "sa")
                .with_node(
                    GraphNode::new("a1", "aws_s3_bucket", "shared", "", "")
                        .with_attribute("region", json!("us-east-1")),
                )
                .with_node(GraphNode::new("a2", "aws_iam_role", "writer", "", ""))
                .with_edge(GraphEdge::new("ea", "a2", "a1", "WRITES_TO", 70)),
            GraphSnapshot::new("t", "rb", "sb")
                .with_node(
                    GraphNode::new("b1", "aws_s3_bucket", "shared-bucket", "", "")
                        .with_attribute("region", json!("eu-west-1")),
                )
                .with_node(GraphNode::new("b2", "helm_release", "app", "", ""))
                .with_edge(GraphEdge::new("eb", "b2", "b1", "READS_FROM", 80)),
        ]
    }

    #[test]
    fn no_matches_passes_everything_through() {
        let output = MergeEngine::new()
            .merge(&MergeInput {
                graphs: graphs(),
                ..MergeInput::default()
            })
            .unwrap();

        assert!(output.merged_nodes.is_empty());
        assert_eq!(output.unmatched_nodes.len(), 4);
        assert_eq!(output.edges.len(), 2);
        assert_eq!(output.statistics.nodes_after_merge, 4);
    }

    #[test]
    fn matched_pair_becomes_one_node() {
        let output = MergeEngine::new()
            .merge(&MergeInput {
                graphs: graphs(),
                matches: vec![matched("a1", "b1")],
                options: MergeOptions::default(),
            })
            .unwrap();

        assert_eq!(output.merged_nodes.len(), 1);
        let merged = &output.merged_nodes[0];
        assert_eq!(merged.source_repo_ids.len(), 2);
        assert_eq!(merged.locations.len(), 2);
        assert_eq!(merged.name, "shared");
        assert_eq!(merged.metadata["region"], json!("us-east-1"));
        assert_eq!(output.statistics.conflicts, 1);
        assert_eq!(output.statistics.conflicts_resolved, 1);
        assert!(!["a1", "b1", "a2", "b2"].contains(&merged.id.as_str()));

        // both edges now point at the merged node
        assert!(output.edges.iter().all(|e| e.target_id == merged.id));
    }

    #[test]
    fn merge_created_self_loops_are_dropped() {
        let mut input = MergeInput {
            graphs: graphs(),
            matches: vec![matched("a1", "b1"), matched("a2", "b1")],
            options: MergeOptions::default(),
        };
        input.options.preserve_source_info = false;

        let output = MergeEngine::new().merge(&input).unwrap();

        assert_eq!(output.merged_nodes[0].source_node_ids.len(), 3);
        assert!(output.merged_nodes[0].locations.is_empty());
        assert!(output.edges.iter().all(|e| e.source_id != e.target_id));
        assert_eq!(output.edges.len(), 1);
    }

    #[test]
    fn cross_repo_edges_follow_original_endpoints() {
        let mut graphs = graphs();
        graphs[0].edges.push(GraphEdge::new("ex", "a2", "b2", "DEPLOYS", 60));

        let input = MergeInput {
            graphs: graphs.clone(),
            ..MergeInput::default()
        };
        let output = MergeEngine::new().merge(&input).unwrap();
        assert_eq!(output.statistics.cross_repo_edges, 1);

        let mut input = MergeInput {
            graphs,
            ..MergeInput::default()
        };
        input.options.create_cross_repo_edges = false;
        let output = MergeEngine::new().merge(&input).unwrap();
        assert_eq!(output.statistics.cross_repo_edges, 0);
        assert!(output.edges.iter().all(|e| !e.is_cross_repo));
    }

    #[test]
    fn duplicate_edges_keep_highest_confidence() {
        let mut graphs = graphs();
        graphs[1].edges.push(GraphEdge::new("eb2", "b2", "b1", "READS_FROM", 95));

        let output = MergeEngine::new()
            .merge(&MergeInput {
                graphs,
                ..MergeInput::default()
            })
            .unwrap();

        let reads: Vec<&MergedEdge> = output
            .edges
            .iter()
            .filter(|e| e.edge_type == "READS_FROM")
            .collect();
        assert_eq!(reads.len(), 1);
        assert_eq!(reads[0].confidence, 95);
        assert_eq!(reads[0].source_edge_ids.len(), 2);
    }

    #[test]
    fn single_graph_is_rejected() {
        let err = MergeEngine::new()
            .merge(&MergeInput {
                graphs: vec![GraphSnapshot::new("t", "r", "s")],
                ..MergeInput::default()
            })
            .unwrap_err();
        assert!(matches!(
            err,
            Error::InsufficientGraphs {
                actual: 1,
                minimum: 2
            }
        ));
    }

    #[test]
    fn node_ceiling_is_enforced() {
        let mut input = MergeInput {
            graphs: graphs(),
            ..MergeInput::default()
        };
        input.options.max_nodes = 3;

        let err = MergeEngine::new().merge(&input).unwrap_err();
        assert!(matches!(
            err,
            Error::LimitExceeded {
                limit_type: LimitType::Nodes,
                current: 4,
                maximum: 3
            }
        ));
    }

    #[test]
    fn validate_input_collects_errors_and_warnings() {
        let options = MergeOptionsInput {
            conflict_resolution: Some("newest".into()),
            max_nodes: Some(0),
            ..MergeOptionsInput::default()
        };
        let result = MergeEngine::new().validate_input(
            &graphs()[..1],
            &[matched("a1", "ghost")],
            &options,
        );

        assert!(result.has_error(ValidationCode::InsufficientGraphs));
        assert!(result.has_error(ValidationCode::InvalidConflictResolution));
        assert!(result.has_error(ValidationCode::InvalidMaxNodes));
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn duplicate_repository_ids_are_accepted() {
        let mut graphs = graphs();
        graphs[1].repository_id = "ra".into();

        let result =
            MergeEngine::new().validate_input(&graphs, &[], &MergeOptionsInput::default());
        assert!(result.is_valid());
    }

    #[test]
    fn colliding_ids_across_graphs_keep_every_node() {
        let graphs = vec![
            GraphSnapshot::new("t", "ra", "sa")
                .with_node(GraphNode::new("n1", "aws_s3_bucket", "shared", "", ""))
                .with_node(GraphNode::new("n2", "aws_iam_role", "writer", "", "")),
            GraphSnapshot::new("t", "rb", "sb")
                .with_node(GraphNode::new("n1", "helm_release", "app", "", ""))
                .with_node(GraphNode::new("b1", "aws_s3_bucket", "shared", "", ""))
                .with_edge(GraphEdge::new("eb", "n1", "b1", "READS_FROM", 80)),
        ];

        let output = MergeEngine::new()
            .merge(&MergeInput {
                graphs,
                matches: vec![matched("n1", "b1")],
                options: MergeOptions::default(),
            })
            .unwrap();

        assert_eq!(output.merged_nodes.len(), 1);
        let merged = &output.merged_nodes[0];
        assert_eq!(merged.node_type, "aws_s3_bucket");
        assert_eq!(merged.source_repo_ids, [RepositoryId::from("ra"), RepositoryId::from("rb")]);

        // rb's own n1 was never matched and must survive
        let unmatched: Vec<(&str, &str)> = output
            .unmatched_nodes
            .iter()
            .map(|n| (n.id.as_str(), n.node_type.as_str()))
            .collect();
        assert_eq!(unmatched, [("n2", "aws_iam_role"), ("n1", "helm_release")]);
        assert_eq!(output.statistics.nodes_before_merge, 4);
        assert_eq!(
            merged.source_node_ids.len() + output.unmatched_nodes.len(),
            output.statistics.nodes_before_merge
        );

        // the edge leaves rb's unmatched n1, not the merged bucket
        assert_eq!(output.edges.len(), 1);
        assert_eq!(output.edges[0].source_id.as_str(), "n1");
        assert_eq!(output.edges[0].target_id, merged.id);
        assert!(!output.edges[0].is_cross_repo);
    }
}

//! Blast radius: downstream impact of a change, grouped by owning tool.
//!
//! A [`DependencyGraph`] is built once from a scan snapshot or a merged
//! multi-repository graph and can answer any number of blast-radius
//! queries. Traversal is breadth-first over both edge directions; the
//! visited set is a bitset over the graph's node indices, owned by the
//! caller so repeated queries reuse one allocation.
//!
//! | Depth | Bucket |
//! |-------|--------|
//! | 1 | `direct` |
//! | 2..=max_depth | `transitive` |

mod tools;

pub use tools::{CROSS_TOOL_EDGE_TYPES, Tool, is_cross_tool_edge};

use std::collections::{BTreeMap, HashMap, VecDeque};

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{EdgeRef, VisitMap, Visitable};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::BlastRadiusConfig;
use crate::error::{Error, Result};
use crate::merge::MergeOutput;
use crate::types::{GraphSnapshot, NodeId, RepositoryId};

/// A node of the traversal graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlastNode {
    /// Node id (source or merged).
    pub id: NodeId,
    /// Resource type.
    pub node_type: String,
    /// Resource name.
    pub name: String,
    /// Owning tool, derived from the type.
    pub tool: Tool,
    /// Repositories the node comes from.
    pub repository_ids: Vec<RepositoryId>,
}

/// An edge of the traversal graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlastEdge {
    /// Relationship type.
    pub edge_type: String,
    /// Confidence, 0..=100.
    pub confidence: u8,
}

type Graph = DiGraph<BlastNode, BlastEdge>;

/// Reusable visited set of a [`DependencyGraph`].
pub type VisitSet = <Graph as Visitable>::Map;

/// Traversal options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BlastRadiusOptions {
    /// Deepest hop followed.
    pub max_depth: u32,
    /// Only populate these tool buckets. Traversal still passes through
    /// nodes of other tools.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_filter: Option<Vec<Tool>>,
    /// Traverse CI nodes. When off they are neither reported nor crossed.
    #[serde(rename = "includeCI")]
    pub include_ci: bool,
    /// Ignore edges below this confidence.
    pub min_confidence: u8,
    /// Number of critical paths reported.
    pub critical_path_limit: usize,
}

impl Default for BlastRadiusOptions {
    fn default() -> Self {
        Self::from_config(&BlastRadiusConfig::default())
    }
}

impl BlastRadiusOptions {
    /// Defaults taken from configuration.
    #[must_use]
    pub fn from_config(config: &BlastRadiusConfig) -> Self {
        Self {
            max_depth: config.default_max_depth,
            tool_filter: None,
            include_ci: true,
            min_confidence: 0,
            critical_path_limit: config.critical_path_limit,
        }
    }

    fn reports(&self, tool: Tool) -> bool {
        self.tool_filter
            .as_ref()
            .is_none_or(|tools| tools.contains(&tool))
    }
}

/// A node reached from the source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImpactedNode {
    /// Node id.
    pub node_id: NodeId,
    /// Resource name.
    pub name: String,
    /// Resource type.
    pub node_type: String,
    /// Owning tool.
    pub tool: Tool,
    /// Hops from the source.
    pub depth: u32,
    /// Product of edge confidences along the path, 0.0..=1.0.
    pub path_confidence: f64,
    /// Type of the edge the node was reached through.
    pub via_edge_type: String,
}

/// Impacted nodes of one tool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolImpact {
    /// One hop from the source.
    pub direct: Vec<ImpactedNode>,
    /// Further away.
    pub transitive: Vec<ImpactedNode>,
}

impl ToolImpact {
    /// Nodes in both buckets.
    #[must_use]
    pub fn total(&self) -> usize {
        self.direct.len() + self.transitive.len()
    }
}

/// A traversal path from the source to an impacted node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CriticalPath {
    /// Node ids, source first.
    pub nodes: Vec<NodeId>,
    /// Edge types between consecutive nodes.
    pub edge_types: Vec<String>,
    /// Product of edge confidences, 0.0..=1.0.
    pub confidence: f64,
    /// Distinct tools along the path, in order of appearance.
    pub tools: Vec<Tool>,
}

/// Aggregates of a blast-radius query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlastRadiusSummary {
    /// Reported nodes one hop away.
    pub direct_impact: usize,
    /// Reported nodes further away.
    pub transitive_impact: usize,
    /// Deepest hop reached.
    pub max_depth_reached: u32,
    /// Tools with at least one reported node.
    pub tools_affected: Vec<Tool>,
    /// Traversed edges that cross a tool boundary.
    pub cross_tool_edges: usize,
}

/// Impact of a change to one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlastRadius {
    /// The changed node.
    pub source_node: BlastNode,
    /// Impacted nodes per tool. Every tool is present.
    pub impact_by_tool: BTreeMap<Tool, ToolImpact>,
    /// Number of reported nodes.
    pub total_impact: usize,
    /// Most confident paths, best first.
    pub critical_paths: Vec<CriticalPath>,
    /// Aggregates.
    pub summary: BlastRadiusSummary,
}

/// A reached node and how it was reached.
struct Reached {
    node: NodeIndex,
    depth: u32,
    parent: Option<usize>,
    edge_type: String,
    confidence: f64,
}

/// Arena graph for impact traversal.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    graph: Graph,
    index: HashMap<NodeId, NodeIndex>,
}

impl DependencyGraph {
    /// Graph of a single scan. Edges with a missing endpoint are dropped.
    #[must_use]
    pub fn from_snapshot(snapshot: &GraphSnapshot) -> Self {
        let mut graph = Self::default();
        for node in &snapshot.nodes {
            graph.add_node(BlastNode {
                id: node.id.clone(),
                node_type: node.node_type.clone(),
                name: node.name.clone(),
                tool: Tool::of(&node.node_type),
                repository_ids: vec![node.repository_id.clone()],
            });
        }
        for edge in &snapshot.edges {
            graph.add_edge(&edge.source_id, &edge.target_id, &edge.edge_type, edge.confidence);
        }
        graph
    }

    /// Graph of a merged multi-repository output.
    #[must_use]
    pub fn from_merge_output(output: &MergeOutput) -> Self {
        let mut graph = Self::default();
        for node in &output.merged_nodes {
            graph.add_node(BlastNode {
                id: node.id.clone(),
                node_type: node.node_type.clone(),
                name: node.name.clone(),
                tool: Tool::of(&node.node_type),
                repository_ids: node.source_repo_ids.clone(),
            });
        }
        for node in &output.unmatched_nodes {
            graph.add_node(BlastNode {
                id: node.id.clone(),
                node_type: node.node_type.clone(),
                name: node.name.clone(),
                tool: Tool::of(&node.node_type),
                repository_ids: vec![node.repository_id.clone()],
            });
        }
        for edge in &output.edges {
            graph.add_edge(&edge.source_id, &edge.target_id, &edge.edge_type, edge.confidence);
        }
        graph
    }

    fn add_node(&mut self, node: BlastNode) {
        if self.index.contains_key(&node.id) {
            return;
        }
        let id = node.id.clone();
        let ix = self.graph.add_node(node);
        self.index.insert(id, ix);
    }

    fn add_edge(&mut self, source: &NodeId, target: &NodeId, edge_type: &str, confidence: u8) {
        if let (Some(&from), Some(&to)) = (self.index.get(source), self.index.get(target)) {
            self.graph.add_edge(
                from,
                to,
                BlastEdge {
                    edge_type: edge_type.to_string(),
                    confidence,
                },
            );
        }
    }

    /// Number of nodes.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Number of edges.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// A node by id.
    #[must_use]
    pub fn node(&self, id: &NodeId) -> Option<&BlastNode> {
        self.index.get(id).map(|&ix| &self.graph[ix])
    }

    /// A visited set sized for this graph.
    #[must_use]
    pub fn visit_set(&self) -> VisitSet {
        self.graph.visit_map()
    }

    /// Blast radius of `source`, allocating a fresh visited set.
    pub fn blast_radius(
        &self,
        source: &NodeId,
        options: &BlastRadiusOptions,
    ) -> Result<BlastRadius> {
        let mut visited = self.visit_set();
        self.blast_radius_with(source, options, &mut visited)
    }

    /// Blast radius of `source`, reusing `visited`.
    ///
    /// `visited` is cleared and resized first; its contents afterwards are
    /// every node the traversal reached.
    pub fn blast_radius_with(
        &self,
        source: &NodeId,
        options: &BlastRadiusOptions,
        visited: &mut VisitSet,
    ) -> Result<BlastRadius> {
        let &start = self
            .index
            .get(source)
            .ok_or_else(|| Error::not_found("node", source.as_str()))?;
        self.graph.reset_map(visited);
        visited.visit(start);

        let reached = self.traverse(start, options, visited);

        let mut impact_by_tool: BTreeMap<Tool, ToolImpact> =
            Tool::ALL.into_iter().map(|tool| (tool, ToolImpact::default())).collect();
        let mut reported = Vec::new();
        let mut cross_tool_edges = 0;
        let mut max_depth_reached = 0;
        for (i, hop) in reached.iter().enumerate() {
            let node = &self.graph[hop.node];
            if let Some(parent) = hop.parent {
                let from = self.graph[reached[parent].node].tool;
                if is_cross_tool_edge(&hop.edge_type, from, node.tool) {
                    cross_tool_edges += 1;
                }
            }
            if hop.parent.is_none() || !options.reports(node.tool) {
                continue;
            }
            max_depth_reached = max_depth_reached.max(hop.depth);
            let impacted = ImpactedNode {
                node_id: node.id.clone(),
                name: node.name.clone(),
                node_type: node.node_type.clone(),
                tool: node.tool,
                depth: hop.depth,
                path_confidence: hop.confidence,
                via_edge_type: hop.edge_type.clone(),
            };
            let bucket = impact_by_tool.entry(node.tool).or_default();
            if hop.depth == 1 {
                bucket.direct.push(impacted);
            } else {
                bucket.transitive.push(impacted);
            }
            reported.push(i);
        }

        let critical_paths = self.critical_paths(&reached, &reported, options.critical_path_limit);
        let summary = BlastRadiusSummary {
            direct_impact: impact_by_tool.values().map(|t| t.direct.len()).sum(),
            transitive_impact: impact_by_tool.values().map(|t| t.transitive.len()).sum(),
            max_depth_reached,
            tools_affected: impact_by_tool
                .iter()
                .filter(|(_, impact)| impact.total() > 0)
                .map(|(&tool, _)| tool)
                .collect(),
            cross_tool_edges,
        };
        debug!(
            source = %source,
            reached = reached.len() - 1,
            reported = reported.len(),
            "Blast radius computed"
        );

        Ok(BlastRadius {
            source_node: self.graph[start].clone(),
            total_impact: reported.len(),
            impact_by_tool,
            critical_paths,
            summary,
        })
    }

    /// Breadth-first traversal. The first element is the source.
    fn traverse(
        &self,
        start: NodeIndex,
        options: &BlastRadiusOptions,
        visited: &mut VisitSet,
    ) -> Vec<Reached> {
        let mut reached = vec![Reached {
            node: start,
            depth: 0,
            parent: None,
            edge_type: String::new(),
            confidence: 1.0,
        }];
        let mut queue = VecDeque::from([0usize]);

        while let Some(current) = queue.pop_front() {
            let (node, depth, confidence) = {
                let hop = &reached[current];
                (hop.node, hop.depth, hop.confidence)
            };
            if depth >= options.max_depth {
                continue;
            }
            let neighbours = self
                .graph
                .edges_directed(node, Direction::Outgoing)
                .map(|edge| (edge.target(), edge.weight()))
                .chain(
                    self.graph
                        .edges_directed(node, Direction::Incoming)
                        .map(|edge| (edge.source(), edge.weight())),
                );
            for (next, edge) in neighbours {
                if edge.confidence < options.min_confidence {
                    continue;
                }
                if !options.include_ci && self.graph[next].tool == Tool::Ci {
                    continue;
                }
                if !visited.visit(next) {
                    continue;
                }
                reached.push(Reached {
                    node: next,
                    depth: depth + 1,
                    parent: Some(current),
                    edge_type: edge.edge_type.clone(),
                    confidence: confidence * f64::from(edge.confidence) / 100.0,
                });
                queue.push_back(reached.len() - 1);
            }
        }
        reached
    }

    /// Paths to the reported nodes with the highest confidence product.
    /// Ties go to the shorter path, then to the earlier discovery.
    fn critical_paths(
        &self,
        reached: &[Reached],
        reported: &[usize],
        limit: usize,
    ) -> Vec<CriticalPath> {
        let mut ranked = reported.to_vec();
        ranked.sort_by(|&a, &b| {
            reached[b]
                .confidence
                .total_cmp(&reached[a].confidence)
                .then(reached[a].depth.cmp(&reached[b].depth))
                .then(a.cmp(&b))
        });
        ranked
            .into_iter()
            .take(limit)
            .map(|end| {
                let mut chain = vec![end];
                let mut cursor = end;
                while let Some(parent) = reached[cursor].parent {
                    chain.push(parent);
                    cursor = parent;
                }
                chain.reverse();

                let mut tools: Vec<Tool> = Vec::new();
                for &hop in &chain {
                    let tool = self.graph[reached[hop].node].tool;
                    if !tools.contains(&tool) {
                        tools.push(tool);
                    }
                }
                CriticalPath {
                    nodes: chain
                        .iter()
                        .map(|&hop| self.graph[reached[hop].node].id.clone())
                        .collect(),
                    edge_types: chain[1..]
                        .iter()
                        .map(|&hop| reached[hop].edge_type.clone())
                        .collect(),
                    confidence: reached[end].confidence,
                    tools,
                }
            })
            .collect()
    }
}

/// Blast radius of `source` in a graph built from `snapshot`.
pub fn calculate_blast_radius(
    snapshot: &GraphSnapshot,
    source: &NodeId,
    options: &BlastRadiusOptions,
) -> Result<BlastRadius> {
    DependencyGraph::from_snapshot(snapshot).blast_radius(source, options)
}

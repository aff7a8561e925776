//! Cross-repository equivalence detection.
//!
//! The matcher looks at nodes from several independently scanned graphs and
//! proposes pairs that describe the same real resource. Pairs only ever join
//! nodes from different input graphs. [`MatchGroups`] closes the pairs
//! transitively for the merge engine.
//!
//! ## Module Structure
//!
//! - `strategy` - Matcher configurations and match-key derivation
//! - `groups` - Union-find over matched node ids

mod groups;
mod strategy;

pub use groups::MatchGroups;
pub use strategy::{MatchStrategy, MatcherConfig, MatcherType};

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, LimitType, Result};
use crate::types::{GraphSnapshot, NodeId, RepositoryId};
use crate::validation::{ValidationCode, ValidationResult};
use strategy::CompiledMatcher;

/// A proposed equivalence between two nodes of different graphs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchResult {
    /// Node from the earlier input graph.
    pub source_node_id: NodeId,
    /// Node from the later input graph.
    pub target_node_id: NodeId,
    /// Repository of the source node.
    pub source_repo_id: RepositoryId,
    /// Repository of the target node.
    pub target_repo_id: RepositoryId,
    /// Confidence 0..=100 of the matcher that produced the pair.
    pub confidence: u8,
    /// Strategy that produced the pair.
    pub matcher_type: MatcherType,
    /// Priority of the matcher that produced the pair.
    pub priority: u32,
}

/// Check a matcher list.
///
/// Too many matchers is a hard limit and fails immediately. Everything else
/// is collected into the returned [`ValidationResult`].
pub fn validate_matchers(
    matchers: &[MatcherConfig],
    max_matchers: usize,
) -> Result<ValidationResult> {
    if matchers.len() > max_matchers {
        return Err(Error::LimitExceeded {
            limit_type: LimitType::Matchers,
            current: matchers.len(),
            maximum: max_matchers,
        });
    }

    let mut result = ValidationResult::default();
    if matchers.is_empty() {
        result.error(
            ValidationCode::NoMatchers,
            "matchers",
            "at least one matcher is required",
        );
    }

    for (i, matcher) in matchers.iter().enumerate() {
        if let MatchStrategy::Arn {
            pattern: Some(pattern),
        } = &matcher.strategy
        {
            if let Err(reason) = strategy::compile_arn_pattern(pattern) {
                result.error(
                    ValidationCode::InvalidMatcherPattern,
                    &format!("matchers[{i}].pattern"),
                    reason,
                );
            }
        }
        if matcher.confidence > 100 {
            result.error(
                ValidationCode::InvalidConfidence,
                &format!("matchers[{i}].confidence"),
                format!("confidence must be 0..=100, got {}", matcher.confidence),
            );
        }
    }

    Ok(result)
}

/// Runs configured matchers over a set of graphs.
#[derive(Debug)]
pub struct Matcher {
    matchers: Vec<CompiledMatcher>,
    min_confidence: u8,
}

impl Matcher {
    /// Compile matchers. Fails with [`Error::Validation`] on any invalid matcher.
    pub fn new(configs: &[MatcherConfig]) -> Result<Self> {
        validate_matchers(configs, usize::MAX)?.into_result()?;
        let matchers = configs
            .iter()
            .filter(|c| c.enabled)
            .map(CompiledMatcher::compile)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::Internal)?;
        Ok(Self {
            matchers,
            min_confidence: 0,
        })
    }

    /// Drop candidates below `min_confidence`.
    #[must_use]
    pub fn with_min_confidence(mut self, min_confidence: u8) -> Self {
        self.min_confidence = min_confidence;
        self
    }

    /// Find all cross-graph matches.
    ///
    /// When several matchers pair the same two nodes, the one with the higher
    /// priority wins, then the one with the higher confidence. Results are
    /// ordered by the position of the source node, then the target node.
    #[must_use]
    pub fn find_matches(&self, graphs: &[GraphSnapshot]) -> Vec<MatchResult> {
        // (graph index, node index) of both endpoints, earlier graph first
        type Pair = ((usize, usize), (usize, usize));
        let mut best: HashMap<Pair, MatchResult> = HashMap::new();

        for matcher in &self.matchers {
            let config = &matcher.config;
            if config.confidence < self.min_confidence {
                continue;
            }

            let mut buckets: HashMap<String, Vec<(usize, usize)>> = HashMap::new();
            for (g, graph) in graphs.iter().enumerate() {
                for (n, node) in graph.nodes.iter().enumerate() {
                    if let Some(key) = matcher.key(node) {
                        buckets.entry(key).or_default().push((g, n));
                    }
                }
            }

            let mut candidates = 0usize;
            for members in buckets.values().filter(|m| m.len() > 1) {
                for (i, &left) in members.iter().enumerate() {
                    for &right in &members[i + 1..] {
                        if left.0 == right.0 {
                            continue;
                        }
                        let (src, dst) = if left < right { (left, right) } else { (right, left) };
                        let source = &graphs[src.0].nodes[src.1];
                        let target = &graphs[dst.0].nodes[dst.1];
                        if source.id == target.id {
                            continue;
                        }
                        candidates += 1;

                        let candidate = MatchResult {
                            source_node_id: source.id.clone(),
                            target_node_id: target.id.clone(),
                            source_repo_id: graphs[src.0].repository_id.clone(),
                            target_repo_id: graphs[dst.0].repository_id.clone(),
                            confidence: config.confidence,
                            matcher_type: config.matcher_type(),
                            priority: config.priority,
                        };
                        best.entry((src, dst))
                            .and_modify(|current| {
                                if (candidate.priority, candidate.confidence)
                                    > (current.priority, current.confidence)
                                {
                                    *current = candidate.clone();
                                }
                            })
                            .or_insert(candidate);
                    }
                }
            }

            debug!(
                matcher = config.matcher_type().as_str(),
                keys = buckets.len(),
                candidates,
                "Matcher pass complete"
            );
        }

        let mut ordered: Vec<(Pair, MatchResult)> = best.into_iter().collect();
        ordered.sort_by_key(|(pair, _)| *pair);
        ordered.into_iter().map(|(_, m)| m).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GraphNode;
    use serde_json::json;

    fn bucket(id: &str, repo: &str, arn: &str) -> GraphNode {
        GraphNode::new(id, "aws_s3_bucket", "shared_resource", repo, "scan")
            .with_attribute("arn", json!(arn))
            .with_attribute("id", json!(arn.rsplit(':').next().unwrap_or_default()))
    }

    fn graph(repo: &str, nodes: Vec<GraphNode>) -> GraphSnapshot {
        nodes
            .into_iter()
            .fold(GraphSnapshot::new("t", repo, format!("scan-{repo}")), |g, n| g.with_node(n))
    }

    #[test]
    fn arn_match_across_repositories() {
        let graphs = [
            graph("a", vec![bucket("a-1", "a", "arn:aws:s3:::shared")]),
            graph("b", vec![bucket("b-1", "b", "arn:aws:s3:::shared")]),
        ];
        let matcher = Matcher::new(&[MatcherConfig::arn()]).unwrap();

        let matches = matcher.find_matches(&graphs);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].source_node_id.as_str(), "a-1");
        assert_eq!(matches[0].target_repo_id.as_str(), "b");
    }

    #[test]
    fn nodes_in_same_graph_never_match() {
        let graphs = [graph(
            "a",
            vec![
                bucket("a-1", "a", "arn:aws:s3:::shared"),
                bucket("a-2", "a", "arn:aws:s3:::shared"),
            ],
        )];
        let matcher = Matcher::new(&[MatcherConfig::arn()]).unwrap();

        assert!(matcher.find_matches(&graphs).is_empty());
    }

    #[test]
    fn higher_priority_wins_over_higher_confidence() {
        let graphs = [
            graph("a", vec![bucket("a-1", "a", "arn:aws:s3:::shared")]),
            graph("b", vec![bucket("b-1", "b", "arn:aws:s3:::shared")]),
        ];
        let matcher = Matcher::new(&[
            MatcherConfig::arn().with_priority(10).with_confidence(100),
            MatcherConfig::resource_id().with_priority(90).with_confidence(70),
        ])
        .unwrap();

        let matches = matcher.find_matches(&graphs);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].matcher_type, MatcherType::ResourceId);
        assert_eq!(matches[0].confidence, 70);
    }

    #[test]
    fn min_confidence_drops_weak_matchers() {
        let graphs = [
            graph("a", vec![bucket("a-1", "a", "arn:aws:s3:::shared")]),
            graph("b", vec![bucket("b-1", "b", "arn:aws:s3:::shared")]),
        ];
        let matcher = Matcher::new(&[MatcherConfig::arn().with_confidence(60)])
            .unwrap()
            .with_min_confidence(80);

        assert!(matcher.find_matches(&graphs).is_empty());
    }

    #[test]
    fn disabled_matchers_do_not_run() {
        let graphs = [
            graph("a", vec![bucket("a-1", "a", "arn:aws:s3:::shared")]),
            graph("b", vec![bucket("b-1", "b", "arn:aws:s3:::shared")]),
        ];
        let matcher = Matcher::new(&[MatcherConfig::arn().with_enabled(false)]).unwrap();

        assert!(matcher.find_matches(&graphs).is_empty());
    }

    #[test]
    fn validation_collects_problems() {
        let result = validate_matchers(&[], 20).unwrap();
        assert!(result.has_error(ValidationCode::NoMatchers));

        let bad = MatcherConfig::new(MatchStrategy::Arn {
            pattern: Some(String::new()),
        });
        let result = validate_matchers(&[bad], 20).unwrap();
        assert!(result.has_error(ValidationCode::InvalidMatcherPattern));
        assert_eq!(result.errors[0].field, "matchers[0].pattern");
    }

    #[test]
    fn too_many_matchers_is_a_limit_error() {
        let matchers = vec![MatcherConfig::arn(); 21];

        let err = validate_matchers(&matchers, 20).unwrap_err();
        assert!(matches!(
            err,
            Error::LimitExceeded {
                limit_type: LimitType::Matchers,
                current: 21,
                maximum: 20
            }
        ));
    }
}

//! Shared snapshot generators for Nereus benchmarks.

#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(dead_code)]

use nereus::{GraphEdge, GraphNode, GraphSnapshot};
use serde_json::json;

const NODE_TYPES: [&str; 4] = [
    "aws_s3_bucket",
    "aws_iam_role",
    "helm_release",
    "k8s_deployment",
];

/// A snapshot of `nodes` resources chained by `DEPENDS_ON` edges, each
/// carrying an ARN and a small attribute tree.
///
/// `revision` changes the `tier` attribute of every tenth node, so two
/// revisions of the same size differ by roughly 10% of their nodes.
pub fn snapshot(tenant: &str, scan: &str, nodes: usize, revision: u32) -> GraphSnapshot {
    let mut snapshot = GraphSnapshot::new(tenant, "infra", scan);
    for i in 0..nodes {
        let tier = if i % 10 == 0 { revision } else { 0 };
        snapshot = snapshot.with_node(
            GraphNode::new(
                format!("{scan}-n{i}"),
                NODE_TYPES[i % NODE_TYPES.len()],
                format!("resource-{i}"),
                "",
                "",
            )
            .with_attribute("arn", json!(format!("arn:aws:s3:::resource-{i}")))
            .with_attribute(
                "tags",
                json!({ "team": format!("team-{}", i % 7), "tier": tier }),
            ),
        );
    }
    for i in 1..nodes {
        snapshot = snapshot.with_edge(GraphEdge::new(
            format!("{scan}-e{i}"),
            format!("{scan}-n{i}"),
            format!("{scan}-n{}", i / 2),
            "DEPENDS_ON",
            90,
        ));
    }
    snapshot
}

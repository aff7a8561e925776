//! Structural properties of graph diffs over generated snapshots, plus the
//! service path over imported scans.

use nereus::diff::{ChangeType, DiffOptions};
use nereus::{
    DiffOutcome, DiffRequest, Error, GraphDiffEngine, GraphEdge, GraphNode, GraphSnapshot, Nereus,
    NereusConfig, TenantId,
};
use proptest::prelude::*;
use rstest::rstest;
use serde_json::json;

const NODE_TYPES: [&str; 3] = ["aws_s3_bucket", "helm_release", "k8s_deployment"];
const EDGE_TYPES: [&str; 2] = ["DEPENDS_ON", "FEEDS_INTO"];

type NodeSpec = (usize, usize, u8);
type EdgeSpec = (usize, usize, usize, u8);

fn build(scan: &str, nodes: &[NodeSpec], edges: &[EdgeSpec]) -> GraphSnapshot {
    let mut snapshot = GraphSnapshot::new("acme", "infra", scan);
    for (i, &(kind, name, size)) in nodes.iter().enumerate() {
        snapshot = snapshot.with_node(
            GraphNode::new(
                format!("{scan}-n{i}"),
                NODE_TYPES[kind],
                format!("res-{name}"),
                "",
                "",
            )
            .with_attribute("size", json!(size)),
        );
    }
    if nodes.is_empty() {
        return snapshot;
    }
    for (i, &(from, to, kind, confidence)) in edges.iter().enumerate() {
        snapshot = snapshot.with_edge(GraphEdge::new(
            format!("{scan}-e{i}"),
            format!("{scan}-n{}", from % nodes.len()),
            format!("{scan}-n{}", to % nodes.len()),
            EDGE_TYPES[kind],
            confidence,
        ));
    }
    snapshot
}

fn node_specs() -> impl Strategy<Value = Vec<NodeSpec>> {
    prop::collection::vec((0..NODE_TYPES.len(), 0..6usize, 0..3u8), 0..12)
}

fn edge_specs() -> impl Strategy<Value = Vec<EdgeSpec>> {
    prop::collection::vec((0..12usize, 0..12usize, 0..EDGE_TYPES.len(), 50..=100u8), 0..12)
}

fn engine() -> GraphDiffEngine {
    GraphDiffEngine::default()
}

proptest! {
    #[test]
    fn self_diff_has_no_changes(nodes in node_specs(), edges in edge_specs()) {
        let base = build("base", &nodes, &edges);
        let target = build("target", &nodes, &edges);

        let result = engine()
            .compute_diff(&base, &target, &DiffOptions::default())
            .unwrap();

        prop_assert_eq!(result.summary.nodes.changes(), 0);
        prop_assert_eq!(result.summary.edges.changes(), 0);
        prop_assert_eq!(result.summary.nodes.unchanged, base.nodes.len());
        prop_assert_eq!(result.summary.edges.unchanged, base.edges.len());
        prop_assert!(result.node_diffs.is_empty());
        prop_assert!(!result.summary.is_significant_change);
    }

    #[test]
    fn swapping_sides_swaps_additions_and_removals(
        base_nodes in node_specs(),
        base_edges in edge_specs(),
        target_nodes in node_specs(),
        target_edges in edge_specs(),
    ) {
        let a = build("a", &base_nodes, &base_edges);
        let b = build("b", &target_nodes, &target_edges);
        let options = DiffOptions::default();

        let forward = engine().compute_diff(&a, &b, &options).unwrap();
        let backward = engine().compute_diff(&b, &a, &options).unwrap();

        prop_assert_eq!(forward.summary.nodes.added, backward.summary.nodes.removed);
        prop_assert_eq!(forward.summary.nodes.removed, backward.summary.nodes.added);
        prop_assert_eq!(forward.summary.nodes.modified, backward.summary.nodes.modified);
        prop_assert_eq!(forward.summary.edges.added, backward.summary.edges.removed);
        prop_assert_eq!(forward.summary.edges.modified, backward.summary.edges.modified);
    }

    #[test]
    fn additions_follow_every_base_entry(
        base_nodes in node_specs(),
        target_nodes in node_specs(),
    ) {
        let a = build("a", &base_nodes, &[]);
        let b = build("b", &target_nodes, &[]);

        let result = engine().compute_diff(&a, &b, &DiffOptions::default()).unwrap();

        let first_added = result
            .node_diffs
            .iter()
            .position(|d| d.change_type == ChangeType::Added)
            .unwrap_or(result.node_diffs.len());
        prop_assert!(result.node_diffs[first_added..]
            .iter()
            .all(|d| d.change_type == ChangeType::Added));
    }

    #[test]
    fn diff_id_is_stable(nodes in node_specs()) {
        let a = build("a", &nodes, &[]);
        let b = build("b", &nodes, &[]);
        let options = DiffOptions::default();

        let first = engine().compute_diff(&a, &b, &options).unwrap();
        let second = engine().compute_diff(&a, &b, &options).unwrap();

        prop_assert_eq!(first.diff_id, second.diff_id);
    }
}

#[rstest]
#[case::same_size(1, 1, ChangeType::Unchanged)]
#[case::resized(1, 2, ChangeType::Modified)]
fn attribute_change_classifies_node(
    #[case] before: u8,
    #[case] after: u8,
    #[case] expected: ChangeType,
) {
    let base = build("a", &[(0, 0, before)], &[]);
    let target = build("b", &[(0, 0, after)], &[]);
    let options = DiffOptions {
        include_unchanged: true,
        ..DiffOptions::default()
    };

    let result = engine().compute_diff(&base, &target, &options).unwrap();

    assert_eq!(result.node_diffs.len(), 1);
    assert_eq!(result.node_diffs[0].change_type, expected);
}

#[test]
fn node_cap_fails_without_partial_result() {
    let nodes: Vec<NodeSpec> = (0..5).map(|i| (0, i, 0)).collect();
    let base = build("a", &nodes, &[]);
    let target = build("b", &nodes[..2], &[]);
    let options = DiffOptions {
        max_nodes: 4,
        ..DiffOptions::default()
    };

    assert!(matches!(
        engine().compute_diff(&base, &target, &options),
        Err(Error::MaxNodesExceeded { actual: 5, maximum: 4 })
    ));
}

#[test]
fn service_caches_diffs_of_imported_scans() {
    let nereus = Nereus::open_in_memory(NereusConfig::default()).unwrap();
    let tenant = TenantId::from("acme");
    nereus
        .import_snapshot(&build("s1", &[(0, 0, 1), (1, 1, 1)], &[(0, 1, 0, 90)]), None)
        .unwrap();
    nereus
        .import_snapshot(&build("s2", &[(0, 0, 2), (2, 3, 1)], &[]), None)
        .unwrap();
    let request = DiffRequest::new("s1", "s2");

    let first = nereus.diffs().diff(&tenant, &request).unwrap();
    let second = nereus.diffs().diff(&tenant, &request).unwrap();

    let DiffOutcome::Completed {
        result, from_cache, ..
    } = first
    else {
        panic!("small diffs complete synchronously");
    };
    assert!(!from_cache);
    assert_eq!(result.summary.nodes.added, 1);
    assert_eq!(result.summary.nodes.removed, 1);
    assert_eq!(result.summary.nodes.modified, 1);
    assert_eq!(result.summary.edges.removed, 1);
    assert!(matches!(
        second,
        DiffOutcome::Completed {
            from_cache: true,
            ..
        }
    ));
}

#[test]
fn service_rejects_scans_of_other_tenants() {
    let nereus = Nereus::open_in_memory(NereusConfig::default()).unwrap();
    nereus
        .import_snapshot(&build("s1", &[(0, 0, 1)], &[]), None)
        .unwrap();
    nereus
        .import_snapshot(&build("s2", &[(0, 0, 1)], &[]), None)
        .unwrap();

    assert!(matches!(
        nereus
            .diffs()
            .diff(&TenantId::from("globex"), &DiffRequest::new("s1", "s2")),
        Err(Error::NotFound { .. })
    ));
}

//! External object index through the engine facade: builds, lookups,
//! reverse lookups and tenant isolation.

use nereus::index::{
    BuildRequest, BuildStatus, HealthStatus, LookupRequest, ReferenceType, ReverseLookupRequest,
};
use nereus::{GraphEdge, GraphNode, GraphSnapshot, Nereus, NereusConfig, NodeId, TenantId};
use rstest::rstest;
use serde_json::json;

const QUEUE_ARN: &str = "arn:aws:sqs:us-east-1:123456789012:Orders";

fn infra_scan(tenant: &str) -> GraphSnapshot {
    GraphSnapshot::new(tenant, "infra", format!("{tenant}-infra-1"))
        .with_node(
            GraphNode::new(format!("{tenant}-queue"), "aws_sqs_queue", "orders", "", "")
                .with_attribute("arn", json!(QUEUE_ARN)),
        )
        .with_node(
            GraphNode::new(format!("{tenant}-vpc"), "aws_vpc", "main", "", "")
                .with_attribute("id", json!("vpc-0a1b2c3d")),
        )
}

fn apps_scan(tenant: &str) -> GraphSnapshot {
    GraphSnapshot::new(tenant, "apps", format!("{tenant}-apps-1"))
        .with_node(
            GraphNode::new(format!("{tenant}-worker"), "helm_release", "worker", "", "")
                .with_attribute("values", json!({ "queue": { "url": QUEUE_ARN } })),
        )
        .with_node(
            GraphNode::new(format!("{tenant}-deploy"), "k8s_deployment", "worker", "", "")
                .with_namespace("jobs"),
        )
        .with_edge(GraphEdge::new(
            format!("{tenant}-e1"),
            format!("{tenant}-worker"),
            format!("{tenant}-deploy"),
            "CREATES",
            100,
        ))
}

fn indexed(tenants: &[&str]) -> Nereus {
    let nereus = Nereus::open_in_memory(NereusConfig::default()).expect("open engine");
    for tenant in tenants {
        nereus.import_snapshot(&infra_scan(tenant), None).expect("import infra");
        nereus.import_snapshot(&apps_scan(tenant), None).expect("import apps");
        let result = nereus
            .index()
            .build(
                &TenantId::from(*tenant),
                BuildRequest::for_repositories(vec!["infra".into(), "apps".into()]),
            )
            .expect("build index");
        assert_eq!(result.status, BuildStatus::Completed);
    }
    nereus
}

#[test]
fn lookup_finds_references_across_repositories() {
    let nereus = indexed(&["acme"]);

    let result = nereus
        .index()
        .lookup(
            &"acme".into(),
            &LookupRequest::new(QUEUE_ARN, ReferenceType::Arn).with_node_details(),
        )
        .unwrap();

    assert!(result.found);
    assert_eq!(result.reference_count, 2);
    assert_eq!(result.repository_ids.len(), 2);
    let names: Vec<_> = result
        .nodes
        .expect("node details were requested")
        .into_iter()
        .map(|n| n.name)
        .collect();
    assert!(names.contains(&"orders".to_string()));
    assert!(names.contains(&"worker".to_string()));
}

#[rstest]
#[case::exact(QUEUE_ARN)]
#[case::padded("  arn:aws:sqs:us-east-1:123456789012:Orders ")]
#[case::upper_prefix("ARN:AWS:SQS:US-EAST-1:123456789012:Orders")]
fn lookup_normalizes_the_identifier(#[case] external_id: &str) {
    let nereus = indexed(&["acme"]);

    let result = nereus
        .index()
        .lookup(&"acme".into(), &LookupRequest::new(external_id, ReferenceType::Arn))
        .unwrap();

    assert!(result.found, "{external_id} should resolve to the indexed ARN");
}

#[test]
fn arn_resource_segment_is_case_sensitive() {
    let nereus = indexed(&["acme"]);

    let result = nereus
        .index()
        .lookup(
            &"acme".into(),
            &LookupRequest::new("arn:aws:sqs:us-east-1:123456789012:orders", ReferenceType::Arn),
        )
        .unwrap();

    assert!(!result.found);
}

#[test]
fn lookup_can_be_restricted_to_one_repository() {
    let nereus = indexed(&["acme"]);

    let result = nereus
        .index()
        .lookup(
            &"acme".into(),
            &LookupRequest::new(QUEUE_ARN, ReferenceType::Arn).in_repository("apps"),
        )
        .unwrap();

    assert_eq!(result.reference_count, 1);
    assert_eq!(result.node_ids, vec![NodeId::from("acme-worker")]);
}

#[test]
fn tenants_never_see_each_other() {
    let nereus = indexed(&["acme", "globex"]);

    let result = nereus
        .index()
        .lookup(&"acme".into(), &LookupRequest::new(QUEUE_ARN, ReferenceType::Arn))
        .unwrap();

    assert_eq!(result.reference_count, 2);
    assert!(result.node_ids.iter().all(|id| id.as_str().starts_with("acme-")));

    let other = nereus
        .index()
        .lookup(
            &"initech".into(),
            &LookupRequest::new(QUEUE_ARN, ReferenceType::Arn),
        )
        .unwrap();
    assert!(!other.found);
}

#[test]
fn tenants_sharing_scan_and_node_ids_keep_their_own_data() {
    let nereus = Nereus::open_in_memory(NereusConfig::default()).expect("open engine");
    let scan = |tenant: &str, node_type: &str, arn: &str| {
        GraphSnapshot::new(tenant, "infra", "scan-1").with_node(
            GraphNode::new("n1", node_type, "shared", "", "").with_attribute("arn", json!(arn)),
        )
    };
    nereus
        .import_snapshot(&scan("acme", "aws_sqs_queue", QUEUE_ARN), None)
        .expect("first tenant imports");
    let second = nereus
        .import_snapshot(&scan("globex", "aws_s3_bucket", "arn:aws:s3:::globex-logs"), None)
        .expect("second tenant reuses the scan and node ids");
    assert!(!second.replaced);

    for tenant in ["acme", "globex"] {
        nereus
            .index()
            .build(
                &TenantId::from(tenant),
                BuildRequest::for_scans(vec!["scan-1".into()]),
            )
            .expect("build index");
    }

    let acme = nereus
        .index()
        .lookup(
            &"acme".into(),
            &LookupRequest::new(QUEUE_ARN, ReferenceType::Arn).with_node_details(),
        )
        .unwrap();
    let nodes = acme.nodes.expect("node details were requested");
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].node_type, "aws_sqs_queue");

    let globex = nereus
        .index()
        .lookup(
            &"globex".into(),
            &LookupRequest::new("arn:aws:s3:::globex-logs", ReferenceType::Arn),
        )
        .unwrap();
    assert_eq!(globex.node_ids, vec![NodeId::from("n1")]);
    let leaked = nereus
        .index()
        .lookup(&"globex".into(), &LookupRequest::new(QUEUE_ARN, ReferenceType::Arn))
        .unwrap();
    assert!(!leaked.found);
}

#[test]
fn reverse_lookup_lists_a_nodes_references() {
    let nereus = indexed(&["acme"]);

    let result = nereus
        .index()
        .reverse_lookup(
            &"acme".into(),
            &ReverseLookupRequest::new("acme-apps-1", "acme-deploy"),
        )
        .unwrap();

    assert_eq!(result.total_count, 1);
    let reference = &result.external_objects[0];
    assert_eq!(reference.ref_type, ReferenceType::K8sReference);
    assert_eq!(reference.external_object_id, "k8s://jobs/deployment/worker");
    assert_eq!(reference.context.as_deref(), Some("$node"));
}

#[test]
fn incidental_references_carry_lower_confidence() {
    let nereus = indexed(&["acme"]);

    let worker = nereus
        .index()
        .reverse_lookup(
            &"acme".into(),
            &ReverseLookupRequest::new("acme-apps-1", "acme-worker"),
        )
        .unwrap();
    let queue = nereus
        .index()
        .reverse_lookup(
            &"acme".into(),
            &ReverseLookupRequest::new("acme-infra-1", "acme-queue"),
        )
        .unwrap();

    assert!(worker.external_objects[0].confidence < queue.external_objects[0].confidence);
    assert_eq!(
        worker.external_objects[0].context.as_deref(),
        Some("values.queue.url")
    );
}

#[test]
fn repeated_lookups_are_served_from_cache() {
    let nereus = indexed(&["acme"]);
    let tenant = TenantId::from("acme");
    let request = LookupRequest::new(QUEUE_ARN, ReferenceType::Arn);

    let first = nereus.index().lookup(&tenant, &request).unwrap();
    let second = nereus.index().lookup(&tenant, &request).unwrap();

    assert_eq!(first.node_ids, second.node_ids);
    let stats = nereus.index().stats(&tenant).unwrap();
    assert_eq!(stats.cache.misses, 1);
    assert_eq!(stats.cache.l1_hits, 1);
}

#[test]
fn stats_and_health_after_a_build() {
    let nereus = indexed(&["acme"]);
    let tenant = TenantId::from("acme");

    let stats = nereus.index().stats(&tenant).unwrap();
    assert_eq!(stats.total_entries, 4);
    assert_eq!(stats.unique_objects, 3);
    assert_eq!(stats.counts_by_type.get(&ReferenceType::Arn), Some(&2));
    assert!(stats.last_build.is_some());

    let health = nereus.index().health(&tenant).unwrap();
    assert_eq!(health.status, HealthStatus::Healthy, "{:?}", health.issues);
}

#[test]
fn health_is_degraded_before_any_build() {
    let nereus = Nereus::open_in_memory(NereusConfig::default()).unwrap();

    let health = nereus.index().health(&"acme".into()).unwrap();

    assert_eq!(health.status, HealthStatus::Degraded);
    assert_eq!(health.issues.len(), 1);
}

#[test]
fn index_survives_reopening_the_database() {
    let dir = tempfile::tempdir().expect("create temp dir");
    {
        let nereus = Nereus::open(dir.path(), NereusConfig::default()).unwrap();
        nereus.import_snapshot(&infra_scan("acme"), None).unwrap();
        nereus
            .index()
            .build(&"acme".into(), BuildRequest::for_scans(vec!["acme-infra-1".into()]))
            .unwrap();
    }

    let reopened = Nereus::open(dir.path(), NereusConfig::default()).unwrap();
    let result = reopened
        .index()
        .lookup(
            &"acme".into(),
            &LookupRequest::new("vpc-0a1b2c3d", ReferenceType::ResourceId),
        )
        .unwrap();

    assert!(result.found);
    assert_eq!(result.node_ids, vec![NodeId::from("acme-vpc")]);
}

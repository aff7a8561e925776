//! Named multi-repository rollups.
//!
//! A rollup stores which repositories to aggregate, how their nodes are
//! matched and how matched nodes are merged. Executing it loads one scan per
//! repository, runs the [`Matcher`] and the [`MergeEngine`], and records a
//! [`RollupExecution`] holding the merged graph. Every operation is scoped by
//! tenant; ids of other tenants behave exactly like unknown ids.

mod repository;
mod types;

pub use repository::RollupRepository;
pub use types::{ExecutionError, ExecutionStatus, Rollup, RollupExecution, RollupInput};

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use chrono::Utc;
use tracing::{info, warn};

use crate::blast::{BlastRadius, BlastRadiusOptions, DependencyGraph};
use crate::config::LimitsConfig;
use crate::db::now_millis;
use crate::error::{Error, LimitType, Result};
use crate::identity::hash_parts;
use crate::limiter::ExecutionLimiter;
use crate::matcher::{Matcher, validate_matchers};
use crate::merge::{MergeEngine, MergeInput, MergeOptions, MergeOutput};
use crate::store::{GraphStore, require_snapshot};
use crate::types::{ExecutionId, GraphSnapshot, NodeId, RollupId, ScanId, TenantId};
use crate::validation::{ValidationCode, ValidationResult};

/// Fewest repositories a rollup aggregates.
pub const MIN_REPOSITORIES: usize = 2;

/// Check a rollup definition.
///
/// Too many repositories or matchers are hard limits and fail immediately.
/// Every other problem is collected into the returned result.
pub fn validate_rollup(input: &RollupInput, limits: &LimitsConfig) -> Result<ValidationResult> {
    if input.repository_ids.len() > limits.max_repositories_per_rollup {
        return Err(Error::LimitExceeded {
            limit_type: LimitType::Repositories,
            current: input.repository_ids.len(),
            maximum: limits.max_repositories_per_rollup,
        });
    }
    let matcher_issues = validate_matchers(&input.matchers, limits.max_matchers_per_rollup)?;

    let mut result = ValidationResult::default();
    let name_length = input.name.trim().chars().count();
    if name_length == 0 {
        result.error(ValidationCode::NameRequired, "name", "name is required");
    } else if input.name.chars().count() > limits.max_rollup_name_length {
        result.error(
            ValidationCode::NameTooLong,
            "name",
            format!(
                "name must be at most {} characters, got {}",
                limits.max_rollup_name_length,
                input.name.chars().count()
            ),
        );
    }
    if input.repository_ids.len() < MIN_REPOSITORIES {
        result.error(
            ValidationCode::InsufficientRepositories,
            "repositoryIds",
            format!(
                "at least {MIN_REPOSITORIES} repositories are required, got {}",
                input.repository_ids.len()
            ),
        );
    }
    result.extend(matcher_issues);
    input.merge_options.validate_into(&mut result);

    Ok(result)
}

/// Stores rollups and runs them against the graph store.
pub struct RollupService {
    store: Arc<dyn GraphStore>,
    repository: RollupRepository,
    limits: LimitsConfig,
    limiter: ExecutionLimiter,
    engine: MergeEngine,
    sequence: AtomicU64,
}

impl std::fmt::Debug for RollupService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RollupService")
            .field("repository", &self.repository)
            .field("limits", &self.limits)
            .field("limiter", &self.limiter)
            .finish_non_exhaustive()
    }
}

impl RollupService {
    /// Create a service over `store`, persisting through `repository`.
    #[must_use]
    pub fn new(
        store: Arc<dyn GraphStore>,
        repository: RollupRepository,
        limits: LimitsConfig,
        limiter: ExecutionLimiter,
    ) -> Self {
        Self {
            store,
            repository,
            limits,
            limiter,
            engine: MergeEngine::new(),
            sequence: AtomicU64::new(0),
        }
    }

    fn next_id(&self, prefix: &str, parts: &[&str]) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed).to_string();
        let millis = now_millis().to_string();
        let mut all = parts.to_vec();
        all.push(&millis);
        all.push(&seq);
        format!("{prefix}-{}", &hash_parts(&all)[..16])
    }

    fn validate(&self, input: &RollupInput) -> Result<()> {
        validate_rollup(input, &self.limits)?.into_result()
    }

    /// Validate and store a new rollup at version 1.
    pub fn create(&self, tenant_id: &TenantId, input: RollupInput) -> Result<Rollup> {
        self.validate(&input)?;
        let now = Utc::now();
        let rollup = Rollup {
            id: RollupId::new(self.next_id("rollup", &[tenant_id.as_str(), &input.name])),
            tenant_id: tenant_id.clone(),
            name: input.name,
            description: input.description,
            repository_ids: input.repository_ids,
            matchers: input.matchers,
            merge_options: input.merge_options,
            version: 1,
            created_at: now,
            updated_at: now,
        };
        self.repository.insert_rollup(&rollup)?;
        info!(
            tenant_id = %tenant_id,
            rollup_id = %rollup.id,
            repositories = rollup.repository_ids.len(),
            "Created rollup"
        );
        Ok(rollup)
    }

    /// A rollup of the tenant.
    pub fn get(&self, tenant_id: &TenantId, rollup_id: &RollupId) -> Result<Rollup> {
        self.repository
            .get_rollup(tenant_id, rollup_id)?
            .ok_or_else(|| Error::not_found("rollup", rollup_id.as_str()))
    }

    /// All rollups of the tenant, by name.
    pub fn list(&self, tenant_id: &TenantId) -> Result<Vec<Rollup>> {
        self.repository.list_rollups(tenant_id)
    }

    /// Replace the definition of a rollup. The version goes up by one.
    pub fn update(
        &self,
        tenant_id: &TenantId,
        rollup_id: &RollupId,
        input: RollupInput,
    ) -> Result<Rollup> {
        self.validate(&input)?;
        let current = self.get(tenant_id, rollup_id)?;
        let rollup = Rollup {
            name: input.name,
            description: input.description,
            repository_ids: input.repository_ids,
            matchers: input.matchers,
            merge_options: input.merge_options,
            version: current.version.saturating_add(1),
            updated_at: Utc::now(),
            ..current
        };
        if !self.repository.update_rollup(&rollup)? {
            return Err(Error::not_found("rollup", rollup_id.as_str()));
        }
        info!(
            tenant_id = %tenant_id,
            rollup_id = %rollup_id,
            version = rollup.version,
            "Updated rollup"
        );
        Ok(rollup)
    }

    /// Delete a rollup together with its executions.
    pub fn delete(&self, tenant_id: &TenantId, rollup_id: &RollupId) -> Result<()> {
        if !self.repository.delete_rollup(tenant_id, rollup_id)? {
            return Err(Error::not_found("rollup", rollup_id.as_str()));
        }
        info!(tenant_id = %tenant_id, rollup_id = %rollup_id, "Deleted rollup");
        Ok(())
    }

    /// Snapshots to merge, in rollup repository order unless `scan_ids` is
    /// given, in which case its order is kept.
    fn load_graphs(
        &self,
        tenant_id: &TenantId,
        rollup: &Rollup,
        scan_ids: Option<&[ScanId]>,
    ) -> Result<Vec<GraphSnapshot>> {
        let store = self.store.as_ref();
        match scan_ids {
            Some(ids) => ids
                .iter()
                .map(|id| {
                    let snapshot = require_snapshot(store, tenant_id, id)?;
                    if rollup.repository_ids.contains(&snapshot.repository_id) {
                        Ok(snapshot)
                    } else {
                        Err(Error::not_found("scan", id.as_str()))
                    }
                })
                .collect(),
            None => rollup
                .repository_ids
                .iter()
                .map(|repository_id| {
                    let scan = store
                        .latest_scan(tenant_id, repository_id)?
                        .ok_or_else(|| Error::not_found("repository", repository_id.as_str()))?;
                    require_snapshot(store, tenant_id, &scan.scan_id)
                })
                .collect(),
        }
    }

    fn match_and_merge(
        &self,
        rollup: &Rollup,
        graphs: Vec<GraphSnapshot>,
    ) -> Result<(usize, MergeOutput)> {
        let options = MergeOptions::try_from(&rollup.merge_options)?;
        let matches = Matcher::new(&rollup.matchers)?.find_matches(&graphs);
        let match_count = matches.len();
        let output = self.engine.merge(&MergeInput {
            graphs,
            matches,
            options,
        })?;
        Ok((match_count, output))
    }

    /// Run a rollup.
    ///
    /// Without `scan_ids` the latest scan of every repository is used. Given
    /// scans must belong to the rollup's repositories. Matching and merging
    /// failures produce a `Failed` execution rather than an error; missing
    /// scans and the concurrency limit fail before anything is recorded.
    pub fn execute(
        &self,
        tenant_id: &TenantId,
        rollup_id: &RollupId,
        scan_ids: Option<&[ScanId]>,
    ) -> Result<RollupExecution> {
        let rollup = self.get(tenant_id, rollup_id)?;
        let _permit = self.limiter.acquire(tenant_id)?;
        let graphs = self.load_graphs(tenant_id, &rollup, scan_ids)?;
        let start = Instant::now();

        let mut execution = RollupExecution {
            execution_id: ExecutionId::new(
                self.next_id("exec", &[tenant_id.as_str(), rollup_id.as_str()]),
            ),
            rollup_id: rollup.id.clone(),
            tenant_id: tenant_id.clone(),
            status: ExecutionStatus::Running,
            scan_ids: graphs.iter().map(|g| g.scan_id.clone()).collect(),
            match_count: 0,
            output: None,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
        };
        self.repository.save_execution(&execution)?;

        match self.match_and_merge(&rollup, graphs) {
            Ok((match_count, output)) => {
                execution.status = ExecutionStatus::Completed;
                execution.match_count = match_count;
                execution.output = Some(output);
            }
            Err(e) => {
                warn!(
                    tenant_id = %tenant_id,
                    rollup_id = %rollup_id,
                    error = %e,
                    "Rollup execution failed"
                );
                execution.status = ExecutionStatus::Failed;
                execution.error = Some(ExecutionError::from(&e));
            }
        }
        execution.completed_at = Some(Utc::now());
        self.repository.save_execution(&execution)?;

        info!(
            tenant_id = %tenant_id,
            rollup_id = %rollup_id,
            execution_id = %execution.execution_id,
            status = execution.status.as_str(),
            matches = execution.match_count,
            elapsed_ms = start.elapsed().as_millis(),
            "Rollup executed"
        );
        Ok(execution)
    }

    /// An execution of the tenant.
    pub fn get_execution(
        &self,
        tenant_id: &TenantId,
        execution_id: &ExecutionId,
    ) -> Result<RollupExecution> {
        self.repository
            .get_execution(tenant_id, execution_id)?
            .ok_or_else(|| Error::not_found("execution", execution_id.as_str()))
    }

    /// Executions of a rollup, newest first.
    pub fn list_executions(
        &self,
        tenant_id: &TenantId,
        rollup_id: &RollupId,
    ) -> Result<Vec<RollupExecution>> {
        self.get(tenant_id, rollup_id)?;
        self.repository.list_executions(tenant_id, rollup_id)
    }

    /// Blast radius of a node within the merged graph of an execution.
    ///
    /// `source` may be a merged node id or the id of any node it absorbed.
    pub fn blast_radius(
        &self,
        tenant_id: &TenantId,
        execution_id: &ExecutionId,
        source: &NodeId,
        options: &BlastRadiusOptions,
    ) -> Result<BlastRadius> {
        let execution = self.get_execution(tenant_id, execution_id)?;
        let output = execution
            .output
            .ok_or_else(|| Error::not_found("execution output", execution_id.as_str()))?;
        let merged_id = output
            .merged_nodes
            .iter()
            .find(|node| node.source_node_ids.contains(source))
            .map_or_else(|| source.clone(), |node| node.id.clone());
        DependencyGraph::from_merge_output(&output).blast_radius(&merged_id, options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::matcher::MatcherConfig;
    use crate::merge::MergeOptionsInput;
    use crate::store::MemoryGraphStore;
    use crate::types::{GraphEdge, GraphNode, RepositoryId};
    use chrono::Duration as ChronoDuration;
    use rstest::rstest;
    use serde_json::json;

    fn input(name: &str, repos: &[&str]) -> RollupInput {
        RollupInput {
            name: name.to_string(),
            description: None,
            repository_ids: repos.iter().map(|r| RepositoryId::from(*r)).collect(),
            matchers: vec![MatcherConfig::arn()],
            merge_options: MergeOptionsInput::default(),
        }
    }

    fn codes(input: &RollupInput) -> Vec<ValidationCode> {
        validate_rollup(input, &LimitsConfig::default())
            .unwrap()
            .errors
            .into_iter()
            .map(|issue| issue.code)
            .collect()
    }

    fn bucket(id: &str) -> GraphNode {
        GraphNode::new(id, "aws_s3_bucket", "shared_resource", "", "")
            .with_attribute("arn", json!("arn:aws:s3:::shared_resource"))
    }

    /// `infra` owns the bucket; `apps` has a deployment feeding from its
    /// own view of the same bucket.
    fn seeded() -> (RollupService, Arc<MemoryGraphStore>) {
        let store = Arc::new(MemoryGraphStore::new());
        let earlier = Utc::now() - ChronoDuration::hours(1);
        store.insert_snapshot_at(
            GraphSnapshot::new("t1", "infra", "infra-old").with_node(bucket("old-bucket")),
            earlier,
        );
        store.insert_snapshot(
            GraphSnapshot::new("t1", "infra", "infra-new")
                .with_node(bucket("infra-bucket"))
                .with_node(GraphNode::new("infra-role", "aws_iam_role", "reader", "", ""))
                .with_edge(GraphEdge::new("e1", "infra-role", "infra-bucket", "DEPENDS_ON", 90)),
        );
        store.insert_snapshot(
            GraphSnapshot::new("t1", "apps", "apps-1")
                .with_node(bucket("apps-bucket"))
                .with_node(GraphNode::new("apps-web", "k8s_deployment", "web", "", ""))
                .with_edge(GraphEdge::new("e2", "apps-bucket", "apps-web", "FEEDS_INTO", 85)),
        );
        let db = Arc::new(Database::open_in_memory().expect("should open database"));
        let service = RollupService::new(
            Arc::clone(&store) as Arc<dyn GraphStore>,
            RollupRepository::new(db),
            LimitsConfig::default(),
            ExecutionLimiter::new(5),
        );
        (service, store)
    }

    #[rstest]
    #[case::at_limit(255, false)]
    #[case::over_limit(256, true)]
    fn name_length_is_counted_in_characters(#[case] length: usize, #[case] too_long: bool) {
        let name = "é".repeat(length);
        assert_eq!(
            codes(&input(&name, &["a", "b"])).contains(&ValidationCode::NameTooLong),
            too_long
        );
    }

    #[test]
    fn every_problem_is_reported_together() {
        let mut bad = input("  ", &["only"]);
        bad.matchers.clear();
        bad.merge_options.conflict_resolution = Some("newest".to_string());
        bad.merge_options.max_nodes = Some(0);

        assert_eq!(
            codes(&bad),
            [
                ValidationCode::NameRequired,
                ValidationCode::InsufficientRepositories,
                ValidationCode::NoMatchers,
                ValidationCode::InvalidConflictResolution,
                ValidationCode::InvalidMaxNodes,
            ]
        );
    }

    #[test]
    fn too_many_repositories_is_a_hard_limit() {
        let repos: Vec<String> = (0..11).map(|i| format!("repo-{i}")).collect();
        let refs: Vec<&str> = repos.iter().map(String::as_str).collect();

        let err = validate_rollup(&input("estate", &refs), &LimitsConfig::default()).unwrap_err();
        assert!(matches!(
            err,
            Error::LimitExceeded {
                limit_type: LimitType::Repositories,
                current: 11,
                maximum: 10,
            }
        ));
    }

    #[test]
    fn too_many_matchers_is_a_hard_limit() {
        let mut many = input("estate", &["a", "b"]);
        many.matchers = vec![MatcherConfig::arn(); 21];

        let err = validate_rollup(&many, &LimitsConfig::default()).unwrap_err();
        assert!(matches!(
            err,
            Error::LimitExceeded {
                limit_type: LimitType::Matchers,
                ..
            }
        ));
    }

    #[test]
    fn crud_is_tenant_scoped_and_versioned() {
        let (service, _) = seeded();
        let t1 = TenantId::from("t1");
        let t2 = TenantId::from("t2");
        let created = service.create(&t1, input("estate", &["infra", "apps"])).unwrap();
        assert_eq!(created.version, 1);

        assert!(matches!(
            service.get(&t2, &created.id),
            Err(Error::NotFound { resource: "rollup", .. })
        ));
        assert!(service.list(&t2).unwrap().is_empty());

        let updated = service
            .update(&t1, &created.id, input("estate-v2", &["infra", "apps"]))
            .unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.created_at, created.created_at);
        assert_eq!(service.get(&t1, &created.id).unwrap().name, "estate-v2");

        assert!(service.update(&t2, &created.id, input("x", &["a", "b"])).is_err());
        assert!(service.delete(&t2, &created.id).is_err());
        service.delete(&t1, &created.id).unwrap();
        assert!(service.list(&t1).unwrap().is_empty());
    }

    #[test]
    fn invalid_update_keeps_the_stored_rollup() {
        let (service, _) = seeded();
        let t1 = TenantId::from("t1");
        let created = service.create(&t1, input("estate", &["infra", "apps"])).unwrap();

        let err = service.update(&t1, &created.id, input("", &["infra", "apps"])).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(service.get(&t1, &created.id).unwrap(), created);
    }

    #[test]
    fn shared_bucket_merges_across_repositories() {
        let (service, _) = seeded();
        let t1 = TenantId::from("t1");
        let rollup = service.create(&t1, input("estate", &["infra", "apps"])).unwrap();

        let execution = service.execute(&t1, &rollup.id, None).unwrap();

        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.scan_ids, [ScanId::from("infra-new"), ScanId::from("apps-1")]);
        assert_eq!(execution.match_count, 1);
        let output = execution.output.as_ref().unwrap();
        assert_eq!(output.merged_nodes.len(), 1);
        assert_eq!(
            output.merged_nodes[0].source_repo_ids,
            [RepositoryId::from("infra"), RepositoryId::from("apps")]
        );
        assert_eq!(output.unmatched_nodes.len(), 2);
        assert_eq!(service.get_execution(&t1, &execution.execution_id).unwrap(), execution);
        assert_eq!(service.list_executions(&t1, &rollup.id).unwrap().len(), 1);
    }

    #[test]
    fn explicit_scans_must_belong_to_the_rollup() {
        let (service, store) = seeded();
        store.insert_snapshot(GraphSnapshot::new("t1", "other", "other-1"));
        let t1 = TenantId::from("t1");
        let rollup = service.create(&t1, input("estate", &["infra", "apps"])).unwrap();

        let old = [ScanId::from("infra-old"), ScanId::from("apps-1")];
        let execution = service.execute(&t1, &rollup.id, Some(&old)).unwrap();
        assert_eq!(execution.scan_ids, old);

        let foreign = [ScanId::from("infra-old"), ScanId::from("other-1")];
        assert!(matches!(
            service.execute(&t1, &rollup.id, Some(&foreign)),
            Err(Error::NotFound { resource: "scan", .. })
        ));
    }

    #[test]
    fn merge_failure_is_recorded() {
        let (service, _) = seeded();
        let t1 = TenantId::from("t1");
        let mut tight = input("estate", &["infra", "apps"]);
        tight.merge_options.max_nodes = Some(2);
        let rollup = service.create(&t1, tight).unwrap();

        let execution = service.execute(&t1, &rollup.id, None).unwrap();

        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert!(execution.output.is_none());
        assert_eq!(execution.error.as_ref().unwrap().code, "LIMIT_EXCEEDED");
        assert!(execution.completed_at.is_some());
    }

    #[test]
    fn missing_repository_scan_fails_without_record() {
        let (service, _) = seeded();
        let t1 = TenantId::from("t1");
        let rollup = service.create(&t1, input("estate", &["infra", "ghost"])).unwrap();

        assert!(matches!(
            service.execute(&t1, &rollup.id, None),
            Err(Error::NotFound { resource: "repository", .. })
        ));
        assert!(service.list_executions(&t1, &rollup.id).unwrap().is_empty());
    }

    #[test]
    fn concurrency_limit_rejects_execution() {
        let (service, _) = seeded();
        let t1 = TenantId::from("t1");
        let rollup = service.create(&t1, input("estate", &["infra", "apps"])).unwrap();
        let _held: Vec<_> = (0..5).map(|_| service.limiter.acquire(&t1).unwrap()).collect();

        assert!(matches!(
            service.execute(&t1, &rollup.id, None),
            Err(Error::LimitExceeded {
                limit_type: LimitType::ConcurrentExecutions,
                ..
            })
        ));
    }

    #[test]
    fn blast_radius_crosses_repositories_through_merged_node() {
        let (service, _) = seeded();
        let t1 = TenantId::from("t1");
        let rollup = service.create(&t1, input("estate", &["infra", "apps"])).unwrap();
        let execution = service.execute(&t1, &rollup.id, None).unwrap();

        let radius = service
            .blast_radius(
                &t1,
                &execution.execution_id,
                &NodeId::from("infra-bucket"),
                &BlastRadiusOptions::default(),
            )
            .unwrap();

        assert_eq!(radius.source_node.repository_ids.len(), 2);
        assert_eq!(radius.total_impact, 2);
        assert_eq!(radius.summary.direct_impact, 2);
    }
}

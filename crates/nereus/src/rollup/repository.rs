//! `SQLite` persistence of rollups and their executions.

use std::sync::Arc;

use rusqlite::{OptionalExtension, params};
use tracing::debug;

use super::types::{ExecutionStatus, Rollup, RollupExecution};
use crate::db::{Database, json_column, millis_to_datetime};
use crate::error::Result;
use crate::types::{ExecutionId, RollupId, TenantId};

/// SQL column list for the `rollups` table.
///
/// Use with `row_to_rollup` for consistent column ordering.
const ROLLUP_COLUMNS: &str = "rollup_id, tenant_id, name, description, repository_ids, matchers, \
                              merge_options, version, created_at, updated_at";

/// SQL column list for the `rollup_executions` table.
///
/// Use with `row_to_execution` for consistent column ordering.
const EXECUTION_COLUMNS: &str = "execution_id, rollup_id, tenant_id, status, scan_ids, \
                                 match_count, output, error, started_at, completed_at";

fn row_to_rollup(row: &rusqlite::Row) -> rusqlite::Result<Rollup> {
    Ok(Rollup {
        id: RollupId::new(row.get::<_, String>(0)?),
        tenant_id: TenantId::new(row.get::<_, String>(1)?),
        name: row.get(2)?,
        description: row.get(3)?,
        repository_ids: json_column(4, &row.get::<_, String>(4)?)?,
        matchers: json_column(5, &row.get::<_, String>(5)?)?,
        merge_options: json_column(6, &row.get::<_, String>(6)?)?,
        version: row.get(7)?,
        created_at: millis_to_datetime(row.get(8)?)?,
        updated_at: millis_to_datetime(row.get(9)?)?,
    })
}

fn parse_status(idx: usize, text: &str) -> rusqlite::Result<ExecutionStatus> {
    match text {
        "running" => Ok(ExecutionStatus::Running),
        "completed" => Ok(ExecutionStatus::Completed),
        "failed" => Ok(ExecutionStatus::Failed),
        other => Err(rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("unknown execution status: {other}").into(),
        )),
    }
}

fn row_to_execution(row: &rusqlite::Row) -> rusqlite::Result<RollupExecution> {
    let output = row
        .get::<_, Option<String>>(6)?
        .map(|text| json_column(6, &text))
        .transpose()?;
    let error = row
        .get::<_, Option<String>>(7)?
        .map(|text| json_column(7, &text))
        .transpose()?;
    Ok(RollupExecution {
        execution_id: ExecutionId::new(row.get::<_, String>(0)?),
        rollup_id: RollupId::new(row.get::<_, String>(1)?),
        tenant_id: TenantId::new(row.get::<_, String>(2)?),
        status: parse_status(3, &row.get::<_, String>(3)?)?,
        scan_ids: json_column(4, &row.get::<_, String>(4)?)?,
        match_count: usize::try_from(row.get::<_, i64>(5)?).unwrap_or(0),
        output,
        error,
        started_at: millis_to_datetime(row.get(8)?)?,
        completed_at: row.get::<_, Option<i64>>(9)?.map(millis_to_datetime).transpose()?,
    })
}

/// Rollup definitions and execution history, scoped by tenant.
pub struct RollupRepository {
    db: Arc<Database>,
}

impl std::fmt::Debug for RollupRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RollupRepository")
            .field("db", &self.db.path())
            .finish()
    }
}

impl RollupRepository {
    /// Create a repository over the shared database.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Store a new rollup.
    pub fn insert_rollup(&self, rollup: &Rollup) -> Result<()> {
        let conn = self.db.connection()?;
        conn.execute(
            &format!(
                "INSERT INTO rollups ({ROLLUP_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
            ),
            params![
                rollup.id.as_str(),
                rollup.tenant_id.as_str(),
                rollup.name,
                rollup.description,
                serde_json::to_string(&rollup.repository_ids)?,
                serde_json::to_string(&rollup.matchers)?,
                serde_json::to_string(&rollup.merge_options)?,
                rollup.version,
                rollup.created_at.timestamp_millis(),
                rollup.updated_at.timestamp_millis(),
            ],
        )?;
        debug!(rollup_id = %rollup.id, tenant_id = %rollup.tenant_id, "Inserted rollup");
        Ok(())
    }

    /// Overwrite the definition of an existing rollup. Returns `false` when
    /// the tenant has no rollup with that id.
    ///
    /// Executions are kept: an `UPDATE` never triggers the cascade.
    pub fn update_rollup(&self, rollup: &Rollup) -> Result<bool> {
        let conn = self.db.connection()?;
        let updated = conn.execute(
            "UPDATE rollups
             SET name = ?3, description = ?4, repository_ids = ?5, matchers = ?6,
                 merge_options = ?7, version = ?8, updated_at = ?9
             WHERE rollup_id = ?1 AND tenant_id = ?2",
            params![
                rollup.id.as_str(),
                rollup.tenant_id.as_str(),
                rollup.name,
                rollup.description,
                serde_json::to_string(&rollup.repository_ids)?,
                serde_json::to_string(&rollup.matchers)?,
                serde_json::to_string(&rollup.merge_options)?,
                rollup.version,
                rollup.updated_at.timestamp_millis(),
            ],
        )?;
        Ok(updated > 0)
    }

    /// A rollup of a tenant.
    pub fn get_rollup(&self, tenant_id: &TenantId, rollup_id: &RollupId) -> Result<Option<Rollup>> {
        let conn = self.db.connection()?;
        let rollup = conn
            .query_row(
                &format!(
                    "SELECT {ROLLUP_COLUMNS} FROM rollups WHERE tenant_id = ?1 AND rollup_id = ?2"
                ),
                [tenant_id.as_str(), rollup_id.as_str()],
                row_to_rollup,
            )
            .optional()?;
        Ok(rollup)
    }

    /// All rollups of a tenant, by name.
    pub fn list_rollups(&self, tenant_id: &TenantId) -> Result<Vec<Rollup>> {
        let conn = self.db.connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ROLLUP_COLUMNS} FROM rollups WHERE tenant_id = ?1 ORDER BY name, rollup_id"
        ))?;
        let rollups = stmt
            .query_map([tenant_id.as_str()], row_to_rollup)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rollups)
    }

    /// Delete a rollup and its executions. Returns `false` when the tenant
    /// has no rollup with that id.
    pub fn delete_rollup(&self, tenant_id: &TenantId, rollup_id: &RollupId) -> Result<bool> {
        let conn = self.db.connection()?;
        let deleted = conn.execute(
            "DELETE FROM rollups WHERE tenant_id = ?1 AND rollup_id = ?2",
            [tenant_id.as_str(), rollup_id.as_str()],
        )?;
        Ok(deleted > 0)
    }

    /// Insert or replace an execution record.
    pub fn save_execution(&self, execution: &RollupExecution) -> Result<()> {
        let output = execution
            .output
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let error = execution
            .error
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let conn = self.db.connection()?;
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO rollup_executions ({EXECUTION_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
            ),
            params![
                execution.execution_id.as_str(),
                execution.rollup_id.as_str(),
                execution.tenant_id.as_str(),
                execution.status.as_str(),
                serde_json::to_string(&execution.scan_ids)?,
                i64::try_from(execution.match_count).unwrap_or(i64::MAX),
                output,
                error,
                execution.started_at.timestamp_millis(),
                execution.completed_at.map(|t| t.timestamp_millis()),
            ],
        )?;
        Ok(())
    }

    /// An execution of a tenant.
    pub fn get_execution(
        &self,
        tenant_id: &TenantId,
        execution_id: &ExecutionId,
    ) -> Result<Option<RollupExecution>> {
        let conn = self.db.connection()?;
        let execution = conn
            .query_row(
                &format!(
                    "SELECT {EXECUTION_COLUMNS} FROM rollup_executions
                     WHERE tenant_id = ?1 AND execution_id = ?2"
                ),
                [tenant_id.as_str(), execution_id.as_str()],
                row_to_execution,
            )
            .optional()?;
        Ok(execution)
    }

    /// Executions of one rollup, newest first.
    pub fn list_executions(
        &self,
        tenant_id: &TenantId,
        rollup_id: &RollupId,
    ) -> Result<Vec<RollupExecution>> {
        let conn = self.db.connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM rollup_executions
             WHERE tenant_id = ?1 AND rollup_id = ?2
             ORDER BY started_at DESC, execution_id DESC"
        ))?;
        let executions = stmt
            .query_map([tenant_id.as_str(), rollup_id.as_str()], row_to_execution)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(executions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::MatcherConfig;
    use crate::merge::MergeOptionsInput;
    use crate::rollup::types::ExecutionError;
    use crate::types::{RepositoryId, ScanId};
    use chrono::{TimeZone, Utc};

    fn repo() -> RollupRepository {
        RollupRepository::new(Arc::new(
            Database::open_in_memory().expect("should open database"),
        ))
    }

    fn rollup(id: &str, tenant: &str, name: &str) -> Rollup {
        let at = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
        Rollup {
            id: RollupId::from(id),
            tenant_id: TenantId::from(tenant),
            name: name.to_string(),
            description: Some("prod estate".to_string()),
            repository_ids: vec![RepositoryId::from("infra"), RepositoryId::from("apps")],
            matchers: vec![MatcherConfig::arn()],
            merge_options: MergeOptionsInput {
                conflict_resolution: Some("first".to_string()),
                ..MergeOptionsInput::default()
            },
            version: 1,
            created_at: at,
            updated_at: at,
        }
    }

    fn execution(id: &str, rollup_id: &str, started_ms: i64) -> RollupExecution {
        RollupExecution {
            execution_id: ExecutionId::from(id),
            rollup_id: RollupId::from(rollup_id),
            tenant_id: TenantId::from("t1"),
            status: ExecutionStatus::Failed,
            scan_ids: vec![ScanId::from("s1"), ScanId::from("s2")],
            match_count: 0,
            output: None,
            error: Some(ExecutionError {
                code: "LIMIT_EXCEEDED".to_string(),
                message: "nodes limit exceeded: 12 > 10".to_string(),
            }),
            started_at: Utc.timestamp_millis_opt(started_ms).unwrap(),
            completed_at: Some(Utc.timestamp_millis_opt(started_ms + 5).unwrap()),
        }
    }

    #[test]
    fn rollups_round_trip_and_stay_tenant_scoped() {
        let repo = repo();
        let stored = rollup("r1", "t1", "estate");
        repo.insert_rollup(&stored).unwrap();

        assert_eq!(repo.get_rollup(&"t1".into(), &"r1".into()).unwrap(), Some(stored));
        assert_eq!(repo.get_rollup(&"t2".into(), &"r1".into()).unwrap(), None);
        assert!(repo.list_rollups(&"t2".into()).unwrap().is_empty());
        assert!(!repo.delete_rollup(&"t2".into(), &"r1".into()).unwrap());
    }

    #[test]
    fn list_orders_by_name() {
        let repo = repo();
        repo.insert_rollup(&rollup("r1", "t1", "zeta")).unwrap();
        repo.insert_rollup(&rollup("r2", "t1", "alpha")).unwrap();

        let names: Vec<String> = repo
            .list_rollups(&"t1".into())
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, ["alpha", "zeta"]);
    }

    #[test]
    fn update_keeps_executions() {
        let repo = repo();
        let mut stored = rollup("r1", "t1", "estate");
        repo.insert_rollup(&stored).unwrap();
        repo.save_execution(&execution("x1", "r1", 1_700_000_000_100)).unwrap();

        stored.name = "renamed".to_string();
        stored.version = 2;
        assert!(repo.update_rollup(&stored).unwrap());

        let loaded = repo.get_rollup(&"t1".into(), &"r1".into()).unwrap().unwrap();
        assert_eq!(loaded.name, "renamed");
        assert_eq!(loaded.version, 2);
        assert_eq!(repo.list_executions(&"t1".into(), &"r1".into()).unwrap().len(), 1);
    }

    #[test]
    fn executions_are_newest_first_and_cascade_on_delete() {
        let repo = repo();
        repo.insert_rollup(&rollup("r1", "t1", "estate")).unwrap();
        repo.save_execution(&execution("x1", "r1", 1_700_000_000_100)).unwrap();
        repo.save_execution(&execution("x2", "r1", 1_700_000_000_200)).unwrap();

        let listed = repo.list_executions(&"t1".into(), &"r1".into()).unwrap();
        assert_eq!(listed[0].execution_id.as_str(), "x2");
        assert_eq!(listed[1], execution("x1", "r1", 1_700_000_000_100));

        assert!(repo.delete_rollup(&"t1".into(), &"r1".into()).unwrap());
        assert_eq!(repo.get_execution(&"t1".into(), &"x1".into()).unwrap(), None);
    }
}

//! Rollup definitions and execution records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::matcher::MatcherConfig;
use crate::merge::{MergeOptionsInput, MergeOutput};
use crate::types::{ExecutionId, RepositoryId, RollupId, ScanId, TenantId};

/// Caller-supplied rollup definition, validated before it is stored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollupInput {
    /// Display name, 1..=255 characters.
    pub name: String,
    /// Free text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Repositories whose latest scans are merged.
    pub repository_ids: Vec<RepositoryId>,
    /// How nodes are matched across repositories.
    pub matchers: Vec<MatcherConfig>,
    /// How matched nodes are merged.
    #[serde(default)]
    pub merge_options: MergeOptionsInput,
}

/// A stored rollup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rollup {
    /// Identifier.
    pub id: RollupId,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Display name.
    pub name: String,
    /// Free text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Merged repositories, in merge order.
    pub repository_ids: Vec<RepositoryId>,
    /// Matchers.
    pub matchers: Vec<MatcherConfig>,
    /// Merge options.
    pub merge_options: MergeOptionsInput,
    /// Starts at 1, incremented on every update.
    pub version: u32,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
}

/// State of a rollup execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Matching and merging in progress.
    Running,
    /// Merged graph available.
    Completed,
    /// Matching or merging failed.
    Failed,
}

impl ExecutionStatus {
    /// Stored representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Why an execution failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionError {
    /// Stable error code.
    pub code: String,
    /// Caller-safe message.
    pub message: String,
}

impl From<&Error> for ExecutionError {
    fn from(error: &Error) -> Self {
        let payload = error.to_payload();
        Self {
            code: payload.code.to_string(),
            message: payload.message,
        }
    }
}

/// One run of a rollup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollupExecution {
    /// Identifier.
    pub execution_id: ExecutionId,
    /// Rollup that ran.
    pub rollup_id: RollupId,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Current state.
    pub status: ExecutionStatus,
    /// Scans that were merged, in merge order.
    pub scan_ids: Vec<ScanId>,
    /// Matches found across the scans.
    pub match_count: usize,
    /// Merged graph, once completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<MergeOutput>,
    /// Failure, once failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// End time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

//! Error types for Nereus operations.
//!
//! Errors fall into three groups:
//!
//! - **Client errors** (4xx-style): bad configuration, limits, unknown ids,
//!   oversized inputs. The caller can fix these.
//! - **Server errors** (5xx-style): database, cache, and index infrastructure.
//! - **Lifecycle conflicts**: a build already running or cancelled.
//!
//! Validation problems are never reported one at a time: they are collected
//! into a [`ValidationIssue`] list (see [`crate::validation`]) and surfaced as
//! [`Error::Validation`] so every configuration problem is visible at once.
//!
//! `NotFound` is used both for absent resources and for resources owned by
//! another tenant. The two cases produce identical errors.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::validation::ValidationIssue;

/// Result type for Nereus operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Which configured ceiling a request ran into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitType {
    /// Repositories per rollup.
    Repositories,
    /// Matchers per rollup.
    Matchers,
    /// Total input nodes for a merge.
    Nodes,
    /// Items in one batch lookup.
    BatchItems,
    /// Concurrent executions per tenant.
    ConcurrentExecutions,
}

impl LimitType {
    /// Wire representation of the limit type.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Repositories => "repositories",
            Self::Matchers => "matchers",
            Self::Nodes => "nodes",
            Self::BatchItems => "batch_items",
            Self::ConcurrentExecutions => "concurrent_executions",
        }
    }
}

impl fmt::Display for LimitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level error type for Nereus operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Database operation failed
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// File system operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration file or arguments
    #[error("configuration error: {0}")]
    Config(String),

    /// One or more validation problems; all of them are listed
    #[error("validation failed: {}", join_issues(.0))]
    Validation(Vec<ValidationIssue>),

    /// Fewer input graphs than a merge needs
    #[error("at least {minimum} graphs are required, got {actual}")]
    InsufficientGraphs {
        /// Graphs supplied.
        actual: usize,
        /// Graphs required.
        minimum: usize,
    },

    /// Fewer repositories than a rollup needs
    #[error("at least {minimum} repositories are required, got {actual}")]
    InsufficientRepositories {
        /// Repositories supplied.
        actual: usize,
        /// Repositories required.
        minimum: usize,
    },

    /// Conflict resolution strategy is not one of `merge`, `first`, `last`
    #[error("unknown conflict resolution strategy: {0}")]
    InvalidConflictResolution(String),

    /// `maxNodes` must be positive
    #[error("max nodes must be positive, got {0}")]
    InvalidMaxNodes(i64),

    /// A tenant-configured ceiling was exceeded
    #[error("{limit_type} limit exceeded: {current} > {maximum}")]
    LimitExceeded {
        /// Which ceiling.
        limit_type: LimitType,
        /// Requested amount.
        current: usize,
        /// Configured maximum.
        maximum: usize,
    },

    /// Resource is absent or belongs to another tenant
    #[error("{resource} not found: {id}")]
    NotFound {
        /// Kind of resource (`scan`, `rollup`, `build`, ...).
        resource: &'static str,
        /// Identifier the caller asked for.
        id: String,
    },

    /// Operation exceeded a hard time budget
    #[error("{operation} exceeded its {budget_ms}ms budget")]
    Timeout {
        /// Name of the operation.
        operation: &'static str,
        /// Budget in milliseconds.
        budget_ms: u64,
    },

    /// Diff input has more nodes than allowed
    #[error("snapshot has {actual} nodes, maximum is {maximum}")]
    MaxNodesExceeded {
        /// Node count after filtering.
        actual: usize,
        /// Configured cap.
        maximum: usize,
    },

    /// Diff input has more edges than allowed
    #[error("snapshot has {actual} edges, maximum is {maximum}")]
    MaxEdgesExceeded {
        /// Edge count after filtering.
        actual: usize,
        /// Configured cap.
        maximum: usize,
    },

    /// Persisted index data failed to decode
    #[error("index corrupted: {0}")]
    IndexCorrupted(String),

    /// Distributed cache could not be reached
    #[error("cache unavailable: {0}")]
    CacheUnavailable(String),

    /// Distributed cache refused a write because it is full
    #[error("cache full: capacity {capacity} reached")]
    CacheFull {
        /// Configured entry capacity.
        capacity: usize,
    },

    /// The tenant already has a build in progress
    #[error("build {build_id} is already running")]
    BuildAlreadyRunning {
        /// The running build.
        build_id: String,
    },

    /// The build was cancelled before completion
    #[error("build {build_id} was cancelled")]
    BuildCancelled {
        /// The cancelled build.
        build_id: String,
    },

    /// Invariant violation inside Nereus itself
    #[error("internal error: {0}")]
    Internal(String),
}

fn join_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Error shape handed to an API layer.
///
/// Server errors carry only a generic message so that SQL text and other
/// internal state never leave the process.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorPayload {
    /// Stable machine-readable code.
    pub code: &'static str,
    /// Human-readable message.
    pub message: String,
    /// Validation issues, when the error is a validation failure.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<ValidationIssue>,
    /// Whether retrying the same request may succeed.
    pub retryable: bool,
}

impl Error {
    /// Stable code for this error kind.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Database(_) => "DATABASE_ERROR",
            Self::Io(_) => "IO_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Config(_) => "CONFIGURATION_ERROR",
            Self::Validation(_) => "VALIDATION_FAILED",
            Self::InsufficientGraphs { .. } => "INSUFFICIENT_GRAPHS",
            Self::InsufficientRepositories { .. } => "INSUFFICIENT_REPOSITORIES",
            Self::InvalidConflictResolution(_) => "INVALID_CONFLICT_RESOLUTION",
            Self::InvalidMaxNodes(_) => "INVALID_MAX_NODES",
            Self::LimitExceeded { .. } => "LIMIT_EXCEEDED",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Timeout { .. } => "TIMEOUT",
            Self::MaxNodesExceeded { .. } => "MAX_NODES_EXCEEDED",
            Self::MaxEdgesExceeded { .. } => "MAX_EDGES_EXCEEDED",
            Self::IndexCorrupted(_) => "INDEX_CORRUPTED",
            Self::CacheUnavailable(_) => "CACHE_UNAVAILABLE",
            Self::CacheFull { .. } => "CACHE_FULL",
            Self::BuildAlreadyRunning { .. } => "BUILD_ALREADY_RUNNING",
            Self::BuildCancelled { .. } => "BUILD_CANCELLED",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Returns `true` for problems the caller can fix (4xx-style).
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::Validation(_)
                | Self::InsufficientGraphs { .. }
                | Self::InsufficientRepositories { .. }
                | Self::InvalidConflictResolution(_)
                | Self::InvalidMaxNodes(_)
                | Self::LimitExceeded { .. }
                | Self::NotFound { .. }
                | Self::MaxNodesExceeded { .. }
                | Self::MaxEdgesExceeded { .. }
                | Self::BuildAlreadyRunning { .. }
                | Self::BuildCancelled { .. }
        )
    }

    /// Returns `true` for infrastructure problems (5xx-style).
    #[must_use]
    pub fn is_server_error(&self) -> bool {
        !self.is_client_error()
    }

    /// Returns `true` when repeating the request may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::CacheUnavailable(_)
                | Self::Timeout { .. }
                | Self::Database(_)
                | Self::LimitExceeded {
                    limit_type: LimitType::ConcurrentExecutions,
                    ..
                }
                | Self::BuildAlreadyRunning { .. }
        )
    }

    /// Convert into the payload an API layer returns to its caller.
    #[must_use]
    pub fn to_payload(&self) -> ErrorPayload {
        let message = if self.is_server_error() {
            match self {
                Self::Timeout { .. } | Self::CacheUnavailable(_) | Self::CacheFull { .. } => {
                    self.to_string()
                }
                _ => "internal server error".to_string(),
            }
        } else {
            self.to_string()
        };
        let issues = match self {
            Self::Validation(issues) => issues.clone(),
            _ => Vec::new(),
        };
        ErrorPayload {
            code: self.code(),
            message,
            issues,
            retryable: self.is_retryable(),
        }
    }

    /// Shorthand for [`Error::NotFound`].
    #[must_use]
    pub fn not_found(resource: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource,
            id: id.into(),
        }
    }

    /// Map a poisoned mutex into an internal error.
    pub(crate) fn poisoned<T>(e: &std::sync::PoisonError<T>) -> Self {
        Self::Internal(format!(
            "mutex poisoned (a thread panicked while holding the lock): {e}"
        ))
    }
}

//! Structured validation results.
//!
//! Validation never stops at the first problem. Checks push
//! [`ValidationIssue`]s into a [`ValidationResult`], and callers decide
//! whether to report them or turn them into [`Error::Validation`].

use std::fmt;

use serde::Serialize;

use crate::error::{Error, Result};

/// Machine-readable validation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationCode {
    /// Fewer than two graphs handed to a merge.
    InsufficientGraphs,
    /// Conflict resolution is not `merge`, `first` or `last`.
    InvalidConflictResolution,
    /// `maxNodes` is zero or negative.
    InvalidMaxNodes,
    /// Rollup name is empty.
    NameRequired,
    /// Rollup name exceeds the configured length.
    NameTooLong,
    /// Rollup covers fewer than two repositories.
    InsufficientRepositories,
    /// No matcher configured.
    NoMatchers,
    /// A matcher pattern does not compile.
    InvalidMatcherPattern,
    /// A confidence value is outside its range.
    InvalidConfidence,
    /// A match references a node that no input graph contains.
    UnknownMatchNode,
    /// An index build names neither scans nor repositories.
    NoBuildTargets,
    /// A batch lookup carries no items.
    EmptyBatch,
}

impl ValidationCode {
    /// Wire representation of the code.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InsufficientGraphs => "INSUFFICIENT_GRAPHS",
            Self::InvalidConflictResolution => "INVALID_CONFLICT_RESOLUTION",
            Self::InvalidMaxNodes => "INVALID_MAX_NODES",
            Self::NameRequired => "NAME_REQUIRED",
            Self::NameTooLong => "NAME_TOO_LONG",
            Self::InsufficientRepositories => "INSUFFICIENT_REPOSITORIES",
            Self::NoMatchers => "NO_MATCHERS",
            Self::InvalidMatcherPattern => "INVALID_MATCHER_PATTERN",
            Self::InvalidConfidence => "INVALID_CONFIDENCE",
            Self::UnknownMatchNode => "UNKNOWN_MATCH_NODE",
            Self::NoBuildTargets => "NO_BUILD_TARGETS",
            Self::EmptyBatch => "EMPTY_BATCH",
        }
    }
}

impl fmt::Display for ValidationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single validation problem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationIssue {
    /// What went wrong.
    pub code: ValidationCode,
    /// Input field the problem refers to.
    pub field: String,
    /// Human-readable explanation.
    pub message: String,
}

impl ValidationIssue {
    /// Create a new issue.
    #[must_use]
    pub fn new(code: ValidationCode, field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.code, self.field, self.message)
    }
}

/// Outcome of a validation pass: blocking errors plus advisory warnings.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationResult {
    /// Problems that block execution.
    pub errors: Vec<ValidationIssue>,
    /// Problems that are reported but do not block execution.
    pub warnings: Vec<ValidationIssue>,
}

impl ValidationResult {
    /// `true` when no blocking error was found.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Record a blocking error.
    pub fn error(&mut self, code: ValidationCode, field: &str, message: impl Into<String>) {
        self.errors.push(ValidationIssue::new(code, field, message));
    }

    /// Record an advisory warning.
    pub fn warn(&mut self, code: ValidationCode, field: &str, message: impl Into<String>) {
        self.warnings.push(ValidationIssue::new(code, field, message));
    }

    /// `true` if any blocking error carries `code`.
    #[must_use]
    pub fn has_error(&self, code: ValidationCode) -> bool {
        self.errors.iter().any(|issue| issue.code == code)
    }

    /// Fold another result into this one.
    pub fn extend(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    /// Convert into `Err(Error::Validation)` when there are blocking errors.
    pub fn into_result(self) -> Result<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation(self.errors))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warnings_do_not_invalidate() {
        let mut result = ValidationResult::default();
        result.warn(ValidationCode::UnknownMatchNode, "matches[0]", "unknown node");

        assert!(result.is_valid());
        assert!(result.into_result().is_ok());
    }

    #[test]
    fn into_result_keeps_all_errors() {
        let mut result = ValidationResult::default();
        result.error(ValidationCode::NameRequired, "name", "name is required");
        result.error(ValidationCode::NoMatchers, "matchers", "at least one matcher");

        let Err(Error::Validation(issues)) = result.into_result() else {
            panic!("expected validation error");
        };
        assert_eq!(issues.len(), 2);
    }
}

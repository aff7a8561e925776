//! Configuration for Nereus.
//!
//! Configuration is a YAML file (`config.yaml` in the data directory by
//! default). Every field has a default, so an empty file or no file at all is
//! a valid configuration.
//!
//! ```yaml
//! cache:
//!   l1-capacity: 10000
//!   l1-ttl-secs: 300
//!   l2-ttl-secs: 3600
//! index:
//!   batch-size: 500
//! limits:
//!   max-repositories-per-rollup: 10
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Name of the configuration file inside the data directory.
pub const CONFIG_FILE_NAME: &str = "config.yaml";

/// Name of the `SQLite` database file inside the data directory.
pub const DATABASE_FILE_NAME: &str = "nereus.db";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct NereusConfig {
    /// Tiered lookup cache.
    pub cache: CacheConfig,
    /// External object index and builds.
    pub index: IndexConfig,
    /// Graph diffing.
    pub diff: DiffConfig,
    /// Tenant ceilings.
    pub limits: LimitsConfig,
    /// Blast radius traversal.
    pub blast_radius: BlastRadiusConfig,
}

/// Tiered cache configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct CacheConfig {
    /// Maximum entries in the in-process LRU (L1).
    pub l1_capacity: usize,
    /// Time to live of L1 entries.
    pub l1_ttl_secs: u64,
    /// Time to live of distributed cache (L2) entries.
    pub l2_ttl_secs: u64,
    /// Maximum entries the in-process L2 implementation accepts.
    pub l2_max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1_capacity: 10_000,
            l1_ttl_secs: 300,
            l2_ttl_secs: 3_600,
            l2_max_entries: 1_000_000,
        }
    }
}

impl CacheConfig {
    /// L1 time to live.
    #[must_use]
    pub fn l1_ttl(&self) -> Duration {
        Duration::from_secs(self.l1_ttl_secs)
    }

    /// L2 time to live.
    #[must_use]
    pub fn l2_ttl(&self) -> Duration {
        Duration::from_secs(self.l2_ttl_secs)
    }
}

/// External object index configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct IndexConfig {
    /// Junction entries per write transaction.
    pub batch_size: usize,
    /// Hard budget for one build. Derived from `batch-size` when absent.
    pub build_timeout_secs: Option<u64>,
    /// Soft warning threshold for single lookups.
    pub lookup_warn_ms: u64,
    /// Soft warning threshold for reverse lookups.
    pub reverse_lookup_warn_ms: u64,
    /// Maximum items in one batch lookup.
    pub max_batch_lookup: usize,
    /// Default minimum extraction confidence for builds (0.0..=1.0).
    pub default_min_confidence: f64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            build_timeout_secs: None,
            lookup_warn_ms: 20,
            reverse_lookup_warn_ms: 200,
            max_batch_lookup: 100,
            default_min_confidence: 0.5,
        }
    }
}

impl IndexConfig {
    /// Seconds budgeted per full batch when no explicit timeout is set.
    const SECS_PER_BATCH: u64 = 30;

    /// Lower bound of the derived build timeout.
    const MIN_BUILD_TIMEOUT_SECS: u64 = 60;

    /// Build timeout for a build expected to write `expected_entries`.
    ///
    /// Uses `build-timeout-secs` when set; otherwise budgets
    /// [`Self::SECS_PER_BATCH`] per batch, never less than one minute.
    #[must_use]
    pub fn build_timeout(&self, expected_entries: usize) -> Duration {
        if let Some(secs) = self.build_timeout_secs {
            return Duration::from_secs(secs);
        }
        let batches = expected_entries.div_ceil(self.batch_size.max(1)) as u64;
        Duration::from_secs(
            (batches * Self::SECS_PER_BATCH).max(Self::MIN_BUILD_TIMEOUT_SECS),
        )
    }
}

/// Graph diff configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct DiffConfig {
    /// Default node cap per snapshot.
    pub max_nodes: usize,
    /// Default edge cap per snapshot.
    pub max_edges: usize,
    /// Default hard time budget.
    pub timeout_ms: u64,
    /// Lifetime of cached diff results.
    pub cache_ttl_secs: u64,
    /// Number of diff results kept in memory.
    pub cache_capacity: usize,
    /// Overall change ratio above which a diff is significant.
    pub significant_change_threshold: f64,
}

impl Default for DiffConfig {
    fn default() -> Self {
        Self {
            max_nodes: 100_000,
            max_edges: 500_000,
            timeout_ms: 30_000,
            cache_ttl_secs: 3_600,
            cache_capacity: 256,
            significant_change_threshold: 0.1,
        }
    }
}

/// Per-tenant ceilings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct LimitsConfig {
    /// Repositories one rollup may aggregate.
    pub max_repositories_per_rollup: usize,
    /// Matchers one rollup may configure.
    pub max_matchers_per_rollup: usize,
    /// Concurrent rollup executions, diffs and builds per tenant.
    pub max_concurrent_executions: usize,
    /// Maximum rollup name length in characters.
    pub max_rollup_name_length: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_repositories_per_rollup: 10,
            max_matchers_per_rollup: 20,
            max_concurrent_executions: 5,
            max_rollup_name_length: 255,
        }
    }
}

/// Blast radius defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct BlastRadiusConfig {
    /// Traversal depth when the caller gives none.
    pub default_max_depth: u32,
    /// Number of critical paths reported.
    pub critical_path_limit: usize,
}

impl Default for BlastRadiusConfig {
    fn default() -> Self {
        Self {
            default_max_depth: 5,
            critical_path_limit: 5,
        }
    }
}

impl NereusConfig {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self =
            serde_yaml::from_str(&content).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        tracing::debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Load `config.yaml` from `data_dir` if it exists, defaults otherwise.
    pub fn load_or_default(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(CONFIG_FILE_NAME);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration as YAML.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            serde_yaml::to_string(self).map_err(|e| Error::Config(format!("YAML error: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject values that would make the engines misbehave.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.cache.l1_capacity == 0 {
            problems.push("cache.l1-capacity must be at least 1");
        }
        if self.cache.l2_ttl_secs < self.cache.l1_ttl_secs {
            problems.push("cache.l2-ttl-secs must not be shorter than cache.l1-ttl-secs");
        }
        if self.index.batch_size == 0 {
            problems.push("index.batch-size must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.index.default_min_confidence) {
            problems.push("index.default-min-confidence must be within 0.0..=1.0");
        }
        if self.diff.cache_capacity == 0 {
            problems.push("diff.cache-capacity must be at least 1");
        }
        if self.limits.max_concurrent_executions == 0 {
            problems.push("limits.max-concurrent-executions must be at least 1");
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::Config(problems.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = NereusConfig::default();

        assert_eq!(config.cache.l1_capacity, 10_000);
        assert_eq!(config.cache.l1_ttl(), Duration::from_secs(300));
        assert_eq!(config.cache.l2_ttl(), Duration::from_secs(3_600));
        assert_eq!(config.index.batch_size, 500);
        assert_eq!(config.limits.max_repositories_per_rollup, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_yaml_fills_in_defaults() {
        let config: NereusConfig = serde_yaml::from_str(
            "limits:\n  max-repositories-per-rollup: 3\ndiff:\n  timeout-ms: 100\n",
        )
        .expect("yaml should parse");

        assert_eq!(config.limits.max_repositories_per_rollup, 3);
        assert_eq!(config.limits.max_matchers_per_rollup, 20);
        assert_eq!(config.diff.timeout_ms, 100);
        assert_eq!(config.diff.max_nodes, 100_000);
    }

    #[test]
    fn build_timeout_is_derived_from_batch_size() {
        let config = IndexConfig::default();

        assert_eq!(config.build_timeout(0), Duration::from_secs(60));
        assert_eq!(config.build_timeout(5_000), Duration::from_secs(300));

        let explicit = IndexConfig {
            build_timeout_secs: Some(5),
            ..IndexConfig::default()
        };
        assert_eq!(explicit.build_timeout(1_000_000), Duration::from_secs(5));
    }

    #[test]
    fn validate_reports_every_problem() {
        let mut config = NereusConfig::default();
        config.index.batch_size = 0;
        config.limits.max_concurrent_executions = 0;

        let Err(Error::Config(message)) = config.validate() else {
            panic!("expected configuration error");
        };
        assert!(message.contains("batch-size"));
        assert!(message.contains("max-concurrent-executions"));
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join(CONFIG_FILE_NAME);
        let mut config = NereusConfig::default();
        config.cache.l1_capacity = 42;

        config.save(&path).expect("save should succeed");
        let loaded = NereusConfig::load(&path).expect("load should succeed");

        assert_eq!(loaded, config);
    }
}

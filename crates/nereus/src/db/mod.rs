//! `SQLite` storage layer for Nereus.
//!
//! One database file holds the local graph store tables (`scans`,
//! `graph_nodes`, `graph_edges`) and the external object index tables
//! (`external_object_index`, `node_external_objects`, `indexed_scans`,
//! `index_builds`), plus saved rollups (`rollups`, `rollup_executions`).
//!
//! ## Module Structure
//!
//! - `schema` - Database schema (DDL)
//!
//! Table-specific queries live next to their owners: the graph store in
//! `crate::store::sqlite`, the index in [`crate::index::IndexRepository`]
//! and rollups in [`crate::rollup::RollupRepository`].

mod schema;

pub(crate) use schema::SCHEMA;

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::Connection;

use crate::error::{Error, Result};

/// How long a statement waits on a locked database before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// `SQLite` database shared by the graph store and the index.
///
/// The connection is wrapped in a `Mutex` so the database can be shared
/// across threads (background builds, async diffs) behind an `Arc`.
pub struct Database {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl Database {
    /// Open or create the database file.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::configure(conn, Some(path.to_path_buf()))
    }

    /// Open a private in-memory database (tests, one-shot CLI runs).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::configure(conn, None)
    }

    fn configure(conn: Connection, path: Option<PathBuf>) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA)?;

        tracing::debug!(
            path = path
                .as_ref()
                .map_or_else(|| ":memory:".to_string(), |p| p.display().to_string()),
            "Opened database"
        );

        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    /// Location of the database file, `None` for in-memory databases.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Acquire the connection lock.
    pub(crate) fn connection(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| Error::poisoned(&e))
    }

    /// Update `SQLite` query planner statistics.
    ///
    /// Worth calling after a full index rebuild.
    pub fn analyze(&self) -> Result<()> {
        let conn = self.connection()?;
        conn.execute_batch("ANALYZE")?;
        Ok(())
    }
}

/// Current time as unix milliseconds, the storage format for timestamps.
pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Decode a stored unix-millisecond timestamp.
pub(crate) fn millis_to_datetime(ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Integer,
            format!("timestamp {ms} is out of range").into(),
        )
    })
}

/// Convert a `COUNT(*)` result.
// COUNT(*) is never negative
#[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
pub(crate) fn count_to_usize(count: i64) -> usize {
    count.max(0) as usize
}

/// Bind a count or offset, saturating at `i64::MAX`.
pub(crate) fn usize_to_sql(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

/// Decode a JSON text column.
pub(crate) fn json_column<T: serde::de::DeserializeOwned>(
    idx: usize,
    text: &str,
) -> rusqlite::Result<T> {
    serde_json::from_str(text).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

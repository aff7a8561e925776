//! `SQLite` persistence of the external object index.
//!
//! Every query is scoped by tenant. The hot path is
//! [`IndexRepository::find_by_reference_hash`], served entirely from the
//! covering index `idx_neo_lookup`.

use std::collections::BTreeMap;
use std::sync::Arc;

use rusqlite::types::Value as SqlValue;
use rusqlite::{OptionalExtension, Transaction, params, params_from_iter};
use tracing::{debug, trace};

use super::extract::ReferenceType;
use super::types::{
    BuildRecord, BuildRequest, BuildResult, BuildStatus, EntryPage, ExternalReference, IndexEntry,
    InsertStats, Pagination, PartialProgress, UpsertStats,
};
use crate::db::{Database, count_to_usize, json_column, millis_to_datetime, usize_to_sql};
use crate::error::Result;
use crate::types::{NodeId, RepositoryId, ScanId, TenantId};

/// Junction rows per write transaction when unspecified.
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// SQL column list for the `node_external_objects` table.
///
/// Use with `row_to_entry` for consistent column ordering.
const ENTRY_COLUMNS: &str = "tenant_id, node_id, external_object_id, scan_id, repository_id, \
                             reference_hash, ref_type, confidence, context, created_at";

/// SQL column list for the `index_builds` table.
///
/// Use with `row_to_build` for consistent column ordering.
const BUILD_COLUMNS: &str =
    "build_id, tenant_id, status, started_at, completed_at, request, result";

fn parse_column<T: std::str::FromStr>(idx: usize, text: &str) -> rusqlite::Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    text.parse().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn row_to_entry(row: &rusqlite::Row) -> rusqlite::Result<IndexEntry> {
    Ok(IndexEntry {
        tenant_id: TenantId::new(row.get::<_, String>(0)?),
        node_id: NodeId::new(row.get::<_, String>(1)?),
        external_object_id: row.get(2)?,
        scan_id: ScanId::new(row.get::<_, String>(3)?),
        repository_id: RepositoryId::new(row.get::<_, String>(4)?),
        reference_hash: row.get(5)?,
        ref_type: parse_column(6, &row.get::<_, String>(6)?)?,
        confidence: row.get(7)?,
        context: row.get(8)?,
        created_at: millis_to_datetime(row.get(9)?)?,
    })
}

fn status_from_str(idx: usize, text: &str) -> rusqlite::Result<BuildStatus> {
    [
        BuildStatus::Pending,
        BuildStatus::Running,
        BuildStatus::Completed,
        BuildStatus::Failed,
        BuildStatus::Cancelled,
    ]
    .into_iter()
    .find(|status| status.as_str() == text)
    .ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("unknown build status {text}").into(),
        )
    })
}

fn row_to_build(row: &rusqlite::Row) -> rusqlite::Result<BuildRecord> {
    let result: Option<BuildResult> = row
        .get::<_, Option<String>>(6)?
        .map(|text| json_column(6, &text))
        .transpose()?;
    Ok(BuildRecord {
        build_id: row.get(0)?,
        tenant_id: TenantId::new(row.get::<_, String>(1)?),
        status: status_from_str(2, &row.get::<_, String>(2)?)?,
        started_at: millis_to_datetime(row.get(3)?)?,
        completed_at: row
            .get::<_, Option<i64>>(4)?
            .map(millis_to_datetime)
            .transpose()?,
        request: json_column::<BuildRequest>(5, &row.get::<_, String>(5)?)?,
        partial_progress: result
            .as_ref()
            .map_or_else(PartialProgress::default, |r| r.partial_progress),
        result,
    })
}

/// An entry followed by a trailing `COUNT(*) OVER ()` column.
fn row_to_counted_entry(row: &rusqlite::Row) -> rusqlite::Result<(IndexEntry, i64)> {
    Ok((row_to_entry(row)?, row.get(10)?))
}

fn insert_junction_rows(tx: &Transaction<'_>, entries: &[IndexEntry]) -> Result<InsertStats> {
    let mut stmt = tx.prepare_cached(
        "INSERT OR IGNORE INTO node_external_objects
         (tenant_id, node_id, external_object_id, scan_id, repository_id,
          reference_hash, ref_type, confidence, context, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
    )?;
    let mut stats = InsertStats::default();
    for entry in entries {
        let written = stmt.execute(params![
            entry.tenant_id.as_str(),
            entry.node_id.as_str(),
            entry.external_object_id,
            entry.scan_id.as_str(),
            entry.repository_id.as_str(),
            entry.reference_hash,
            entry.ref_type.as_str(),
            entry.confidence,
            entry.context,
            entry.created_at.timestamp_millis(),
        ])?;
        if written > 0 {
            stats.inserted += 1;
        } else {
            stats.skipped += 1;
        }
    }
    Ok(stats)
}

fn upsert_reference_rows(
    tx: &Transaction<'_>,
    references: &[ExternalReference],
) -> Result<UpsertStats> {
    let mut exists = tx.prepare_cached(
        "SELECT 1 FROM external_object_index
         WHERE tenant_id = ?1 AND scan_id = ?2 AND node_id = ?3 AND external_id = ?4",
    )?;
    let mut upsert = tx.prepare_cached(
        "INSERT INTO external_object_index
         (tenant_id, external_id, reference_type, normalized_id, reference_hash,
          repository_id, scan_id, node_id, components, indexed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT (tenant_id, scan_id, node_id, external_id) DO UPDATE SET
            reference_type = excluded.reference_type,
            normalized_id = excluded.normalized_id,
            reference_hash = excluded.reference_hash,
            repository_id = excluded.repository_id,
            components = excluded.components,
            indexed_at = excluded.indexed_at",
    )?;
    let mut stats = UpsertStats::default();
    for reference in references {
        let existed = exists
            .query_row(
                params![
                    reference.tenant_id.as_str(),
                    reference.scan_id.as_str(),
                    reference.node_id.as_str(),
                    reference.external_id
                ],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        upsert.execute(params![
            reference.tenant_id.as_str(),
            reference.external_id,
            reference.reference_type.as_str(),
            reference.normalized_id,
            super::extract::reference_hash(reference.reference_type, &reference.normalized_id),
            reference.repository_id.as_str(),
            reference.scan_id.as_str(),
            reference.node_id.as_str(),
            serde_json::to_string(&reference.components)?,
            reference.indexed_at.timestamp_millis(),
        ])?;
        if existed {
            stats.updated += 1;
        } else {
            stats.created += 1;
        }
    }
    Ok(stats)
}

/// Filters of a reverse lookup.
#[derive(Debug, Clone, Default)]
pub struct NodeReferenceFilter {
    /// Only these reference types.
    pub types: Option<Vec<ReferenceType>>,
    /// Only references at least this confident.
    pub min_confidence: Option<f64>,
}

impl NodeReferenceFilter {
    /// WHERE clause and its parameters, starting at `?1`.
    fn clause(
        &self,
        tenant_id: &TenantId,
        scan_id: &ScanId,
        node_id: &NodeId,
    ) -> (String, Vec<SqlValue>) {
        let mut sql = String::from("tenant_id = ?1 AND scan_id = ?2 AND node_id = ?3");
        let mut values = vec![
            SqlValue::Text(tenant_id.to_string()),
            SqlValue::Text(scan_id.to_string()),
            SqlValue::Text(node_id.to_string()),
        ];
        if let Some(min) = self.min_confidence {
            values.push(SqlValue::Real(min));
            sql.push_str(&format!(" AND confidence >= ?{}", values.len()));
        }
        if let Some(types) = &self.types {
            let mut placeholders = Vec::with_capacity(types.len());
            for reference_type in types {
                values.push(SqlValue::Text(reference_type.as_str().to_string()));
                placeholders.push(format!("?{}", values.len()));
            }
            if placeholders.is_empty() {
                sql.push_str(" AND 0");
            } else {
                sql.push_str(&format!(" AND ref_type IN ({})", placeholders.join(", ")));
            }
        }
        (sql, values)
    }
}

/// One page of a node's references plus per-type totals.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeReferencePage {
    /// Entries on this page.
    pub entries: Vec<IndexEntry>,
    /// Matching entries across all pages.
    pub total: usize,
    /// Matching entries per type across all pages.
    pub count_by_type: BTreeMap<ReferenceType, usize>,
}

/// Tenant-scoped queries and writes against the index tables.
pub struct IndexRepository {
    db: Arc<Database>,
    batch_size: usize,
}

impl IndexRepository {
    /// Wrap an open database, writing `batch_size` junction rows per transaction.
    #[must_use]
    pub fn new(db: Arc<Database>, batch_size: usize) -> Self {
        Self {
            db,
            batch_size: batch_size.max(1),
        }
    }

    /// Rows per write transaction.
    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// First junction row for a reference hash, optionally within one repository.
    pub fn find_by_reference_hash(
        &self,
        tenant_id: &TenantId,
        repository_id: Option<&RepositoryId>,
        reference_hash: &str,
    ) -> Result<Option<IndexEntry>> {
        Ok(self
            .find_all_by_reference_hash(tenant_id, repository_id, reference_hash)?
            .into_iter()
            .next())
    }

    /// Every junction row for a reference hash, oldest first.
    pub fn find_all_by_reference_hash(
        &self,
        tenant_id: &TenantId,
        repository_id: Option<&RepositoryId>,
        reference_hash: &str,
    ) -> Result<Vec<IndexEntry>> {
        let conn = self.db.connection()?;
        let entries = match repository_id {
            Some(repository_id) => {
                let mut stmt = conn.prepare_cached(&format!(
                    "SELECT {ENTRY_COLUMNS} FROM node_external_objects
                     WHERE tenant_id = ?1 AND repository_id = ?2 AND reference_hash = ?3
                     ORDER BY created_at, node_id"
                ))?;
                stmt.query_map(
                    params![tenant_id.as_str(), repository_id.as_str(), reference_hash],
                    row_to_entry,
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?
            }
            None => {
                let mut stmt = conn.prepare_cached(&format!(
                    "SELECT {ENTRY_COLUMNS} FROM node_external_objects
                     WHERE tenant_id = ?1 AND reference_hash = ?2
                     ORDER BY created_at, node_id"
                ))?;
                stmt.query_map(params![tenant_id.as_str(), reference_hash], row_to_entry)?
                    .collect::<std::result::Result<Vec<_>, _>>()?
            }
        };
        trace!(tenant_id = %tenant_id, reference_hash, rows = entries.len(), "Hash lookup");
        Ok(entries)
    }

    /// Nodes referencing an external object, one page at a time.
    pub fn find_nodes_by_external_object(
        &self,
        tenant_id: &TenantId,
        external_object_id: &str,
        pagination: &Pagination,
    ) -> Result<EntryPage> {
        let conn = self.db.connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ENTRY_COLUMNS}, COUNT(*) OVER () AS total
             FROM node_external_objects
             WHERE tenant_id = ?1 AND external_object_id = ?2
             ORDER BY {} {}, id ASC
             LIMIT ?3 OFFSET ?4",
            pagination.sort.column(),
            pagination.order.keyword()
        ))?;
        let rows = stmt
            .query_map(
                params![
                    tenant_id.as_str(),
                    external_object_id,
                    usize_to_sql(pagination.limit()),
                    usize_to_sql(pagination.offset())
                ],
                row_to_counted_entry,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let total = match rows.first() {
            Some((_, total)) => count_to_usize(*total),
            // past the last page the window function has no row to report on
            None if pagination.offset() > 0 => count_to_usize(conn.query_row(
                "SELECT COUNT(*) FROM node_external_objects
                 WHERE tenant_id = ?1 AND external_object_id = ?2",
                params![tenant_id.as_str(), external_object_id],
                |row| row.get(0),
            )?),
            None => 0,
        };
        Ok(EntryPage {
            entries: rows.into_iter().map(|(entry, _)| entry).collect(),
            total,
        })
    }

    /// References of one node, one page at a time.
    pub fn find_references_for_node(
        &self,
        tenant_id: &TenantId,
        scan_id: &ScanId,
        node_id: &NodeId,
        filter: &NodeReferenceFilter,
        pagination: &Pagination,
    ) -> Result<NodeReferencePage> {
        let (clause, values) = filter.clause(tenant_id, scan_id, node_id);
        let conn = self.db.connection()?;

        let mut page_values = values.clone();
        page_values.push(SqlValue::Integer(usize_to_sql(pagination.limit())));
        page_values.push(SqlValue::Integer(usize_to_sql(pagination.offset())));
        let mut stmt = conn.prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM node_external_objects
             WHERE {clause}
             ORDER BY {} {}, id ASC
             LIMIT ?{} OFFSET ?{}",
            pagination.sort.column(),
            pagination.order.keyword(),
            page_values.len() - 1,
            page_values.len()
        ))?;
        let entries = stmt
            .query_map(params_from_iter(page_values.iter()), row_to_entry)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare(&format!(
            "SELECT ref_type, COUNT(*) FROM node_external_objects
             WHERE {clause} GROUP BY ref_type"
        ))?;
        let counts = stmt
            .query_map(params_from_iter(values.iter()), |row| {
                Ok((
                    parse_column::<ReferenceType>(0, &row.get::<_, String>(0)?)?,
                    count_to_usize(row.get(1)?),
                ))
            })?
            .collect::<std::result::Result<BTreeMap<_, _>, _>>()?;

        Ok(NodeReferencePage {
            entries,
            total: counts.values().sum(),
            count_by_type: counts,
        })
    }

    /// Insert junction rows, one transaction per batch.
    ///
    /// Rows that already exist (same scan, node and external object) are
    /// skipped, including duplicates within `entries`.
    pub fn bulk_insert_junction(&self, entries: &[IndexEntry]) -> Result<InsertStats> {
        let mut total = InsertStats::default();
        for batch in entries.chunks(self.batch_size) {
            let mut conn = self.db.connection()?;
            let tx = conn.transaction()?;
            let stats = insert_junction_rows(&tx, batch)?;
            tx.commit()?;
            total.inserted += stats.inserted;
            total.skipped += stats.skipped;
        }
        debug!(
            inserted = total.inserted,
            skipped = total.skipped,
            "Bulk inserted junction rows"
        );
        Ok(total)
    }

    /// Upsert references and insert their junction rows in one transaction.
    pub fn write_batch(
        &self,
        references: &[ExternalReference],
        entries: &[IndexEntry],
    ) -> Result<(UpsertStats, InsertStats)> {
        let mut conn = self.db.connection()?;
        let tx = conn.transaction()?;
        let upserted = upsert_reference_rows(&tx, references)?;
        let inserted = insert_junction_rows(&tx, entries)?;
        tx.commit()?;
        Ok((upserted, inserted))
    }

    /// Upsert external references, one transaction per batch.
    pub fn upsert_references(&self, references: &[ExternalReference]) -> Result<UpsertStats> {
        let mut total = UpsertStats::default();
        for batch in references.chunks(self.batch_size) {
            let mut conn = self.db.connection()?;
            let tx = conn.transaction()?;
            let stats = upsert_reference_rows(&tx, batch)?;
            tx.commit()?;
            total.created += stats.created;
            total.updated += stats.updated;
        }
        Ok(total)
    }

    /// Remove every index row of a scan. Returns the junction rows deleted.
    pub fn delete_for_scan(
        &self,
        tenant_id: &TenantId,
        repository_id: &RepositoryId,
        scan_id: &ScanId,
    ) -> Result<usize> {
        let mut conn = self.db.connection()?;
        let tx = conn.transaction()?;
        let args = (tenant_id.as_str(), repository_id.as_str(), scan_id.as_str());
        let deleted = tx.execute(
            "DELETE FROM node_external_objects
             WHERE tenant_id = ?1 AND repository_id = ?2 AND scan_id = ?3",
            args,
        )?;
        tx.execute(
            "DELETE FROM external_object_index
             WHERE tenant_id = ?1 AND repository_id = ?2 AND scan_id = ?3",
            args,
        )?;
        tx.execute(
            "DELETE FROM indexed_scans
             WHERE tenant_id = ?1 AND repository_id = ?2 AND scan_id = ?3",
            args,
        )?;
        tx.commit()?;
        debug!(tenant_id = %tenant_id, scan_id = %scan_id, deleted, "Deleted scan from index");
        Ok(deleted)
    }

    /// Record that a scan is fully indexed.
    pub fn mark_scan_indexed(
        &self,
        tenant_id: &TenantId,
        repository_id: &RepositoryId,
        scan_id: &ScanId,
        entries: usize,
    ) -> Result<()> {
        let conn = self.db.connection()?;
        conn.execute(
            "INSERT OR REPLACE INTO indexed_scans
             (tenant_id, scan_id, repository_id, entries, indexed_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                tenant_id.as_str(),
                scan_id.as_str(),
                repository_id.as_str(),
                usize_to_sql(entries),
                crate::db::now_millis()
            ],
        )?;
        Ok(())
    }

    /// Whether a scan has been fully indexed.
    pub fn is_scan_indexed(&self, tenant_id: &TenantId, scan_id: &ScanId) -> Result<bool> {
        let conn = self.db.connection()?;
        let found = conn
            .query_row(
                "SELECT 1 FROM indexed_scans WHERE tenant_id = ?1 AND scan_id = ?2",
                [tenant_id.as_str(), scan_id.as_str()],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Junction rows per reference type.
    pub fn counts_by_type(&self, tenant_id: &TenantId) -> Result<BTreeMap<ReferenceType, usize>> {
        let conn = self.db.connection()?;
        let mut stmt = conn.prepare(
            "SELECT ref_type, COUNT(*) FROM node_external_objects
             WHERE tenant_id = ?1 GROUP BY ref_type",
        )?;
        let counts = stmt
            .query_map([tenant_id.as_str()], |row| {
                Ok((
                    parse_column::<ReferenceType>(0, &row.get::<_, String>(0)?)?,
                    count_to_usize(row.get(1)?),
                ))
            })?
            .collect::<std::result::Result<BTreeMap<_, _>, _>>()?;
        Ok(counts)
    }

    /// Distinct external objects of a tenant.
    pub fn count_unique_objects(&self, tenant_id: &TenantId) -> Result<usize> {
        let conn = self.db.connection()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(DISTINCT external_object_id) FROM node_external_objects
             WHERE tenant_id = ?1",
            [tenant_id.as_str()],
            |row| row.get(0),
        )?;
        Ok(count_to_usize(count))
    }

    /// Persist the current state of a build.
    pub fn save_build(&self, record: &BuildRecord) -> Result<()> {
        let request = serde_json::to_string(&record.request)?;
        let result = record.result.as_ref().map(serde_json::to_string).transpose()?;
        let conn = self.db.connection()?;
        conn.execute(
            "INSERT OR REPLACE INTO index_builds
             (build_id, tenant_id, status, started_at, completed_at, request, result)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.build_id,
                record.tenant_id.as_str(),
                record.status.as_str(),
                record.started_at.timestamp_millis(),
                record.completed_at.map(|t| t.timestamp_millis()),
                request,
                result,
            ],
        )?;
        Ok(())
    }

    /// A persisted build of a tenant.
    pub fn get_build(&self, tenant_id: &TenantId, build_id: &str) -> Result<Option<BuildRecord>> {
        let conn = self.db.connection()?;
        let build = conn
            .query_row(
                &format!(
                    "SELECT {BUILD_COLUMNS} FROM index_builds
                     WHERE tenant_id = ?1 AND build_id = ?2"
                ),
                [tenant_id.as_str(), build_id],
                row_to_build,
            )
            .optional()?;
        Ok(build)
    }

    /// Most recently finished build of a tenant.
    pub fn last_build(&self, tenant_id: &TenantId) -> Result<Option<BuildRecord>> {
        let conn = self.db.connection()?;
        let build = conn
            .query_row(
                &format!(
                    "SELECT {BUILD_COLUMNS} FROM index_builds
                     WHERE tenant_id = ?1 AND completed_at IS NOT NULL
                     ORDER BY completed_at DESC, build_id DESC
                     LIMIT 1"
                ),
                [tenant_id.as_str()],
                row_to_build,
            )
            .optional()?;
        Ok(build)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::extract::reference_hash;
    use chrono::{Duration, Utc};

    fn repository() -> IndexRepository {
        IndexRepository::new(Arc::new(Database::open_in_memory().unwrap()), 10)
    }

    fn entry(node: &str, object: &str) -> IndexEntry {
        IndexEntry {
            tenant_id: "acme".into(),
            node_id: node.into(),
            external_object_id: object.to_string(),
            scan_id: "scan-1".into(),
            repository_id: "infra".into(),
            reference_hash: reference_hash(ReferenceType::Arn, object),
            ref_type: ReferenceType::Arn,
            confidence: 1.0,
            context: Some("arn".to_string()),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn inserted_entry_is_found_by_hash() {
        let repo = repository();
        let e = entry("n1", "arn:aws:s3:::logs");

        repo.bulk_insert_junction(std::slice::from_ref(&e)).unwrap();

        let found = repo
            .find_by_reference_hash(&"acme".into(), None, &e.reference_hash)
            .unwrap()
            .expect("entry should be found");
        assert_eq!(found.node_id, e.node_id);

        let in_repo = repo
            .find_by_reference_hash(&"acme".into(), Some(&"infra".into()), &e.reference_hash)
            .unwrap();
        assert!(in_repo.is_some());
        let other_repo = repo
            .find_by_reference_hash(&"acme".into(), Some(&"apps".into()), &e.reference_hash)
            .unwrap();
        assert!(other_repo.is_none());
    }

    #[test]
    fn lookups_are_tenant_scoped() {
        let repo = repository();
        let e = entry("n1", "arn:aws:s3:::logs");
        repo.bulk_insert_junction(std::slice::from_ref(&e)).unwrap();

        let found = repo
            .find_by_reference_hash(&"globex".into(), None, &e.reference_hash)
            .unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn duplicate_inserts_are_skipped() {
        let repo = repository();
        let e = entry("n1", "arn:aws:s3:::logs");

        let first = repo.bulk_insert_junction(std::slice::from_ref(&e)).unwrap();
        let second = repo.bulk_insert_junction(std::slice::from_ref(&e)).unwrap();
        let same_call = repository()
            .bulk_insert_junction(&[e.clone(), e.clone()])
            .unwrap();

        assert_eq!(first, InsertStats { inserted: 1, skipped: 0 });
        assert_eq!(second, InsertStats { inserted: 0, skipped: 1 });
        assert_eq!(same_call, InsertStats { inserted: 1, skipped: 1 });
    }

    #[test]
    fn pagination_reports_total() {
        let repo = repository();
        let object = "arn:aws:s3:::shared";
        let base = Utc::now();
        let entries: Vec<IndexEntry> = (0..25)
            .map(|i| IndexEntry {
                created_at: base + Duration::milliseconds(i),
                ..entry(&format!("n{i:02}"), object)
            })
            .collect();
        repo.bulk_insert_junction(&entries).unwrap();

        let page = repo
            .find_nodes_by_external_object(&"acme".into(), object, &Pagination::new(2, 10))
            .unwrap();
        assert_eq!(page.entries.len(), 10);
        assert_eq!(page.total, 25);
        // newest first by default
        assert_eq!(page.entries[0].node_id.as_str(), "n14");

        let beyond = repo
            .find_nodes_by_external_object(&"acme".into(), object, &Pagination::new(9, 10))
            .unwrap();
        assert!(beyond.entries.is_empty());
        assert_eq!(beyond.total, 25);
    }

    #[test]
    fn huge_page_numbers_return_an_empty_page() {
        let repo = repository();
        let object = "arn:aws:s3:::shared";
        repo.bulk_insert_junction(&[entry("n1", object), entry("n2", object)])
            .unwrap();
        let far = Pagination::new(usize::MAX, Pagination::MAX_PAGE_SIZE);

        let page = repo
            .find_nodes_by_external_object(&"acme".into(), object, &far)
            .unwrap();
        assert!(page.entries.is_empty());
        assert_eq!(page.total, 2);

        let references = repo
            .find_references_for_node(
                &"acme".into(),
                &"scan-1".into(),
                &"n1".into(),
                &NodeReferenceFilter::default(),
                &far,
            )
            .unwrap();
        assert!(references.entries.is_empty());
        assert_eq!(references.total, 1);
    }

    #[test]
    fn node_references_filter_and_count_by_type() {
        let repo = repository();
        let mut low = entry("n1", "vpc-0a1b2c3d");
        low.ref_type = ReferenceType::ResourceId;
        low.confidence = 0.8;
        repo.bulk_insert_junction(&[
            entry("n1", "arn:aws:s3:::a"),
            entry("n1", "arn:aws:s3:::b"),
            low,
        ])
        .unwrap();

        let all = repo
            .find_references_for_node(
                &"acme".into(),
                &"scan-1".into(),
                &"n1".into(),
                &NodeReferenceFilter::default(),
                &Pagination::new(1, 2),
            )
            .unwrap();
        assert_eq!(all.entries.len(), 2);
        assert_eq!(all.total, 3);
        assert_eq!(all.count_by_type[&ReferenceType::Arn], 2);
        assert_eq!(all.count_by_type[&ReferenceType::ResourceId], 1);

        let confident = repo
            .find_references_for_node(
                &"acme".into(),
                &"scan-1".into(),
                &"n1".into(),
                &NodeReferenceFilter {
                    types: Some(vec![ReferenceType::ResourceId, ReferenceType::Arn]),
                    min_confidence: Some(0.9),
                },
                &Pagination::default(),
            )
            .unwrap();
        assert_eq!(confident.total, 2);
    }

    #[test]
    fn delete_for_scan_removes_rows_and_marker() {
        let repo = repository();
        let tenant = TenantId::from("acme");
        repo.bulk_insert_junction(&[entry("n1", "arn:aws:s3:::a"), entry("n2", "arn:aws:s3:::b")])
            .unwrap();
        repo.mark_scan_indexed(&tenant, &"infra".into(), &"scan-1".into(), 2)
            .unwrap();
        assert!(repo.is_scan_indexed(&tenant, &"scan-1".into()).unwrap());

        let deleted = repo
            .delete_for_scan(&tenant, &"infra".into(), &"scan-1".into())
            .unwrap();

        assert_eq!(deleted, 2);
        assert!(!repo.is_scan_indexed(&tenant, &"scan-1".into()).unwrap());
        assert_eq!(repo.count_unique_objects(&tenant).unwrap(), 0);
    }

    #[test]
    fn upsert_counts_created_and_updated() {
        let repo = repository();
        let reference = ExternalReference {
            external_id: "arn:aws:s3:::logs".to_string(),
            reference_type: ReferenceType::Arn,
            normalized_id: "arn:aws:s3:::logs".to_string(),
            tenant_id: "acme".into(),
            repository_id: "infra".into(),
            scan_id: "scan-1".into(),
            node_id: "n1".into(),
            components: BTreeMap::new(),
            indexed_at: Utc::now(),
        };

        let first = repo.upsert_references(std::slice::from_ref(&reference)).unwrap();
        let second = repo.upsert_references(std::slice::from_ref(&reference)).unwrap();

        assert_eq!(first, UpsertStats { created: 1, updated: 0 });
        assert_eq!(second, UpsertStats { created: 0, updated: 1 });
    }

    #[test]
    fn builds_round_trip() {
        let repo = repository();
        let tenant = TenantId::from("acme");
        let mut record = BuildRecord {
            build_id: "build-1".to_string(),
            tenant_id: tenant.clone(),
            status: BuildStatus::Running,
            request: BuildRequest::default(),
            result: None,
            partial_progress: PartialProgress::default(),
            started_at: Utc::now(),
            completed_at: None,
        };
        repo.save_build(&record).unwrap();
        assert!(repo.last_build(&tenant).unwrap().is_none());

        record.status = BuildStatus::Completed;
        record.completed_at = Some(Utc::now());
        record.result = Some(BuildResult::new("build-1", BuildStatus::Completed));
        repo.save_build(&record).unwrap();

        let last = repo.last_build(&tenant).unwrap().expect("completed build");
        assert_eq!(last.status, BuildStatus::Completed);
        assert_eq!(last.request, record.request);
        assert_eq!(last.result.unwrap().build_id, "build-1");
        assert!(repo.get_build(&"globex".into(), "build-1").unwrap().is_none());
    }
}

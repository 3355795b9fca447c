//! Catalog operations over the `datasets` and `files` collections.

use chrono::{DateTime, SecondsFormat, Utc};
use futures_util::TryStreamExt;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use tracing::{debug, instrument, warn};

use super::record::{
    DatasetRecord, DatasetStatus, DatasetSummary, FileKind, FileMeta, FileRecord, ModalityModel,
    NewDataset, Stage,
};
use super::{Result, StoreError};
use crate::db::Database;

/// Hard bound on how many stuck datasets recovery will re-enqueue.
const RECOVERY_SCAN_LIMIT: i64 = 200;

/// Outcome of one unordered bulk upsert flush.
///
/// Individual operation failures are reported here, not raised: duplicate
/// re-runs of the same descriptor set must converge rather than abort.
#[derive(Debug, Default)]
pub struct BulkUpsertOutcome {
    /// Operations attempted.
    pub attempted: usize,
    /// Rows updated in place.
    pub updated: usize,
    /// Rows newly inserted.
    pub inserted: usize,
    /// Operations that failed.
    pub failed: usize,
    /// First failure message, when any op failed.
    pub first_error: Option<String>,
}

/// A dataset stuck in `processing`, eligible for re-enqueue after restart.
#[derive(Debug, Clone)]
pub struct RecoveryCandidate {
    /// Stable external handle.
    pub dataset_id: String,
    /// Stored source URL to re-run with.
    pub source_url: String,
}

/// Catalog over the dataset/file collections.
///
/// Cloning is cheap; all clones share the same connection pool.
#[derive(Debug, Clone)]
pub struct Catalog {
    db: Database,
}

impl Catalog {
    /// Creates a catalog over the given database connection.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Returns the underlying database handle.
    #[must_use]
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Inserts a new dataset row with `status=processing, stage=enqueued`.
    ///
    /// Callers create this row before enqueueing the ingest job so that a
    /// restart can recover the dataset from persisted state alone.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the insert fails (including
    /// uniqueness violations on `dataset_id`).
    #[instrument(skip(self, dataset), fields(dataset_id = %dataset.dataset_id))]
    pub async fn insert_dataset(&self, dataset: &NewDataset) -> Result<()> {
        sqlx::query(
            "INSERT INTO datasets \
             (dataset_id, name, source_url, original_request_url, team_id, owner_user_id, \
              status, stage, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, 'processing', 'enqueued', ?)",
        )
        .bind(&dataset.dataset_id)
        .bind(&dataset.name)
        .bind(&dataset.source_url)
        .bind(&dataset.original_request_url)
        .bind(&dataset.team_id)
        .bind(&dataset.owner_user_id)
        .bind(format_timestamp(Utc::now()))
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Marks the prepare stage as started.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DatasetNotFound`] if no row matches.
    #[instrument(skip(self))]
    pub async fn begin_processing(&self, dataset_id: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE datasets SET status = 'processing', stage = 'prepare' WHERE dataset_id = ?",
        )
        .bind(dataset_id)
        .execute(self.db.pool())
        .await?;
        check_affected(dataset_id, result.rows_affected())
    }

    /// Records the provider resolution and advances to the analyze stage.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DatasetNotFound`] if no row matches.
    #[instrument(skip(self, provider, original_url, resolved_url))]
    pub async fn record_resolution(
        &self,
        dataset_id: &str,
        provider: &str,
        original_url: &str,
        resolved_url: &str,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE datasets SET provider = ?, resolution_original_url = ?, resolved_url = ?, \
             stage = 'analyze_files' WHERE dataset_id = ?",
        )
        .bind(provider)
        .bind(original_url)
        .bind(resolved_url)
        .bind(dataset_id)
        .execute(self.db.pool())
        .await?;
        check_affected(dataset_id, result.rows_affected())
    }

    /// Publishes the summary and flips the dataset to `ready` in one write.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DatasetNotFound`] if no row matches. A summary
    /// that fails to serialize is a programming error and is reported as a
    /// payload error.
    #[instrument(skip(self, summary))]
    pub async fn finalize_dataset(&self, dataset_id: &str, summary: &DatasetSummary) -> Result<()> {
        let payload = serde_json::to_string(summary).map_err(|source| StoreError::Payload {
            column: "summary",
            key: dataset_id.to_string(),
            source,
        })?;
        let result = sqlx::query(
            "UPDATE datasets SET stage = 'finalize', status = 'ready', summary = ? \
             WHERE dataset_id = ?",
        )
        .bind(payload)
        .bind(dataset_id)
        .execute(self.db.pool())
        .await?;
        check_affected(dataset_id, result.rows_affected())
    }

    /// Marks the dataset failed with a diagnostic, in one write.
    ///
    /// No partial summary is written on the failure path.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DatasetNotFound`] if no row matches.
    #[instrument(skip(self, error))]
    pub async fn mark_dataset_failed(&self, dataset_id: &str, error: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE datasets SET status = 'failed', stage = 'failed', last_error = ? \
             WHERE dataset_id = ?",
        )
        .bind(error)
        .bind(dataset_id)
        .execute(self.db.pool())
        .await?;
        check_affected(dataset_id, result.rows_affected())
    }

    /// Reads a dataset row by external id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on query failure, or a payload error
    /// when the stored summary cannot be decoded.
    #[instrument(skip(self))]
    pub async fn get_dataset(&self, dataset_id: &str) -> Result<Option<DatasetRecord>> {
        let row = sqlx::query(
            "SELECT dataset_id, name, source_url, original_request_url, team_id, owner_user_id, \
             status, stage, created_at, summary, provider, resolution_original_url, resolved_url, \
             last_error FROM datasets WHERE dataset_id = ? LIMIT 1",
        )
        .bind(dataset_id)
        .fetch_optional(self.db.pool())
        .await?;

        row.map(|row| dataset_from_row(&row)).transpose()
    }

    /// Deletes all file rows for a dataset.
    ///
    /// Called at the start of the analyze stage so restarted runs converge
    /// to the same terminal state.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the delete fails.
    #[instrument(skip(self))]
    pub async fn delete_dataset_files(&self, dataset_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM files WHERE dataset_id = ?")
            .bind(dataset_id)
            .execute(self.db.pool())
            .await?;
        debug!(rows = result.rows_affected(), "deleted prior file rows");
        Ok(result.rows_affected())
    }

    /// Upserts a batch of descriptors keyed by `(dataset_id, relpath)`.
    ///
    /// Unordered and infallible at the batch level: each op stands alone,
    /// failures (serialization or database) are recorded in the outcome and
    /// the batch continues, so duplicate re-runs converge rather than
    /// abort. Rows whose relpath is empty are skipped.
    #[instrument(skip(self, records), fields(batch = records.len()))]
    pub async fn bulk_upsert_files(&self, records: &[FileRecord]) -> BulkUpsertOutcome {
        let mut outcome = BulkUpsertOutcome::default();

        for record in records {
            if record.relpath.is_empty() {
                continue;
            }
            outcome.attempted += 1;

            match self.upsert_file(record).await {
                Ok(true) => outcome.inserted += 1,
                Ok(false) => outcome.updated += 1,
                Err(error) => {
                    outcome.failed += 1;
                    if outcome.first_error.is_none() {
                        outcome.first_error = Some(error.to_string());
                    }
                }
            }
        }

        outcome
    }

    /// Upserts one descriptor; returns true when a new row was inserted.
    ///
    /// Update-then-insert keeps idempotence even when the unique index on
    /// `(dataset_id, relpath)` fell back to non-unique.
    async fn upsert_file(&self, record: &FileRecord) -> Result<bool> {
        let modality_model = encode_payload("modality_model", &record.relpath, &record.modality_model)?;
        let meta = encode_payload("meta", &record.relpath, &record.meta)?;
        let dims = record
            .dims
            .as_ref()
            .map(|dims| encode_payload("dims", &record.relpath, dims))
            .transpose()?;
        let created_at = format_timestamp(record.created_at);

        let updated = sqlx::query(
            "UPDATE files SET abspath = ?, kind = ?, modality = ?, modality_model = ?, \
             ndim = ?, dims = ?, size_bytes = ?, created_at = ?, meta = ? \
             WHERE dataset_id = ? AND relpath = ?",
        )
        .bind(&record.abspath)
        .bind(record.kind.as_str())
        .bind(&record.modality)
        .bind(&modality_model)
        .bind(record.ndim)
        .bind(&dims)
        .bind(record.size_bytes)
        .bind(&created_at)
        .bind(&meta)
        .bind(&record.dataset_id)
        .bind(&record.relpath)
        .execute(self.db.pool())
        .await?;

        if updated.rows_affected() > 0 {
            return Ok(false);
        }

        sqlx::query(
            "INSERT INTO files \
             (dataset_id, relpath, abspath, kind, modality, modality_model, ndim, dims, \
              size_bytes, created_at, meta) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.dataset_id)
        .bind(&record.relpath)
        .bind(&record.abspath)
        .bind(record.kind.as_str())
        .bind(&record.modality)
        .bind(&modality_model)
        .bind(record.ndim)
        .bind(&dims)
        .bind(record.size_bytes)
        .bind(&created_at)
        .bind(&meta)
        .execute(self.db.pool())
        .await?;

        Ok(true)
    }

    /// Counts file rows for a dataset.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn count_files(&self, dataset_id: &str) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM files WHERE dataset_id = ?")
            .bind(dataset_id)
            .fetch_one(self.db.pool())
            .await?;
        Ok(count)
    }

    /// Reads all file rows for a dataset ordered by relpath.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on query failure, or a payload error
    /// when a stored descriptor cannot be decoded.
    #[instrument(skip(self))]
    pub async fn list_files(&self, dataset_id: &str) -> Result<Vec<FileRecord>> {
        let rows = sqlx::query(
            "SELECT dataset_id, relpath, abspath, kind, modality, modality_model, ndim, dims, \
             size_bytes, created_at, meta FROM files WHERE dataset_id = ? ORDER BY relpath",
        )
        .bind(dataset_id)
        .fetch_all(self.db.pool())
        .await?;

        rows.iter().map(file_from_row).collect()
    }

    /// Streams datasets stuck in `processing`, newest first, up to the
    /// recovery scan limit. Rows without a stored source URL are skipped
    /// (there is nothing to re-run).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn find_processing(&self) -> Result<Vec<RecoveryCandidate>> {
        let mut rows = sqlx::query(
            "SELECT dataset_id, source_url FROM datasets WHERE status = 'processing' \
             ORDER BY created_at DESC LIMIT ?",
        )
        .bind(RECOVERY_SCAN_LIMIT)
        .fetch(self.db.pool());

        let mut candidates = Vec::new();
        while let Some(row) = rows.try_next().await? {
            let dataset_id: String = row.try_get("dataset_id")?;
            let source_url: Option<String> = row.try_get("source_url")?;
            match source_url.filter(|url| !url.is_empty()) {
                Some(source_url) => candidates.push(RecoveryCandidate {
                    dataset_id,
                    source_url,
                }),
                None => warn!(dataset_id = %dataset_id, "processing dataset has no source_url, skipping recovery"),
            }
        }
        Ok(candidates)
    }
}

/// Returns `Ok(())` if at least one row was affected; otherwise
/// [`StoreError::DatasetNotFound`].
fn check_affected(dataset_id: &str, rows_affected: u64) -> Result<()> {
    if rows_affected == 0 {
        Err(StoreError::DatasetNotFound(dataset_id.to_string()))
    } else {
        Ok(())
    }
}

/// Fixed-width UTC timestamp so lexicographic order matches time order.
fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_default()
}

fn encode_payload<T: serde::Serialize>(
    column: &'static str,
    key: &str,
    value: &T,
) -> Result<String> {
    serde_json::to_string(value).map_err(|source| StoreError::Payload {
        column,
        key: key.to_string(),
        source,
    })
}

fn decode_payload<T: serde::de::DeserializeOwned>(
    column: &'static str,
    key: &str,
    raw: &str,
) -> Result<T> {
    serde_json::from_str(raw).map_err(|source| StoreError::Payload {
        column,
        key: key.to_string(),
        source,
    })
}

fn dataset_from_row(row: &SqliteRow) -> Result<DatasetRecord> {
    let dataset_id: String = row.try_get("dataset_id")?;
    let status_raw: String = row.try_get("status")?;
    let stage_raw: String = row.try_get("stage")?;
    let created_at: String = row.try_get("created_at")?;
    let summary_raw: Option<String> = row.try_get("summary")?;

    let summary = summary_raw
        .map(|raw| decode_payload::<DatasetSummary>("summary", &dataset_id, &raw))
        .transpose()?;

    Ok(DatasetRecord {
        name: row.try_get("name")?,
        source_url: row.try_get("source_url")?,
        original_request_url: row.try_get("original_request_url")?,
        team_id: row.try_get("team_id")?,
        owner_user_id: row.try_get("owner_user_id")?,
        status: status_raw
            .parse::<DatasetStatus>()
            .unwrap_or(DatasetStatus::Failed),
        stage: stage_raw.parse::<Stage>().unwrap_or(Stage::Failed),
        created_at: parse_timestamp(&created_at),
        summary,
        provider: row.try_get("provider")?,
        resolution_original_url: row.try_get("resolution_original_url")?,
        resolved_url: row.try_get("resolved_url")?,
        last_error: row.try_get("last_error")?,
        dataset_id,
    })
}

fn file_from_row(row: &SqliteRow) -> Result<FileRecord> {
    let relpath: String = row.try_get("relpath")?;
    let kind_raw: String = row.try_get("kind")?;
    let modality_model_raw: String = row.try_get("modality_model")?;
    let dims_raw: Option<String> = row.try_get("dims")?;
    let meta_raw: String = row.try_get("meta")?;
    let created_at: String = row.try_get("created_at")?;

    Ok(FileRecord {
        dataset_id: row.try_get("dataset_id")?,
        abspath: row.try_get("abspath")?,
        kind: kind_raw.parse::<FileKind>().unwrap_or(FileKind::Unknown),
        modality: row.try_get("modality")?,
        modality_model: decode_payload::<ModalityModel>("modality_model", &relpath, &modality_model_raw)?,
        ndim: row.try_get("ndim")?,
        dims: dims_raw
            .map(|raw| decode_payload::<Vec<i64>>("dims", &relpath, &raw))
            .transpose()?,
        size_bytes: row.try_get("size_bytes")?,
        created_at: parse_timestamp(&created_at),
        meta: decode_payload::<FileMeta>("meta", &relpath, &meta_raw)?,
        relpath,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::store::ensure_catalog_indexes;

    fn sample_record(dataset_id: &str, relpath: &str) -> FileRecord {
        FileRecord {
            dataset_id: dataset_id.to_string(),
            relpath: relpath.to_string(),
            abspath: format!("/tmp/{relpath}"),
            kind: FileKind::Image,
            modality: "unknown".to_string(),
            modality_model: ModalityModel::fallback("unknown"),
            ndim: Some(2),
            dims: Some(vec![128, 128]),
            size_bytes: 42,
            created_at: Utc::now(),
            meta: FileMeta::Image,
        }
    }

    async fn test_catalog() -> Catalog {
        let db = Database::in_memory().await.unwrap();
        ensure_catalog_indexes(&db).await;
        Catalog::new(db)
    }

    #[tokio::test]
    async fn test_insert_and_get_dataset() {
        let catalog = test_catalog().await;
        catalog
            .insert_dataset(&NewDataset::new("ds-1", "demo", "https://example.com/a.zip"))
            .await
            .unwrap();

        let record = catalog.get_dataset("ds-1").await.unwrap().unwrap();
        assert_eq!(record.status, DatasetStatus::Processing);
        assert_eq!(record.stage, Stage::Enqueued);
        assert!(record.summary.is_none());
        assert!(catalog.get_dataset("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_dataset_id_rejected() {
        let catalog = test_catalog().await;
        let new = NewDataset::new("ds-1", "demo", "https://example.com/a.zip");
        catalog.insert_dataset(&new).await.unwrap();
        assert!(catalog.insert_dataset(&new).await.is_err());
    }

    #[tokio::test]
    async fn test_stage_transitions_are_observable() {
        let catalog = test_catalog().await;
        catalog
            .insert_dataset(&NewDataset::new("ds-1", "demo", "https://example.com/a.zip"))
            .await
            .unwrap();

        catalog.begin_processing("ds-1").await.unwrap();
        assert_eq!(
            catalog.get_dataset("ds-1").await.unwrap().unwrap().stage,
            Stage::Prepare
        );

        catalog
            .record_resolution("ds-1", "http", "https://example.com/a.zip", "https://example.com/a.zip")
            .await
            .unwrap();
        let record = catalog.get_dataset("ds-1").await.unwrap().unwrap();
        assert_eq!(record.stage, Stage::AnalyzeFiles);
        assert_eq!(record.provider.as_deref(), Some("http"));

        catalog
            .finalize_dataset("ds-1", &DatasetSummary::default())
            .await
            .unwrap();
        let record = catalog.get_dataset("ds-1").await.unwrap().unwrap();
        assert_eq!(record.status, DatasetStatus::Ready);
        assert_eq!(record.stage, Stage::Finalize);
        assert!(record.summary.is_some());
    }

    #[tokio::test]
    async fn test_mark_failed_sets_diagnostic() {
        let catalog = test_catalog().await;
        catalog
            .insert_dataset(&NewDataset::new("ds-1", "demo", "https://example.com/a.zip"))
            .await
            .unwrap();
        catalog
            .mark_dataset_failed("ds-1", "Download too large: exceeded 2000000000 bytes")
            .await
            .unwrap();

        let record = catalog.get_dataset("ds-1").await.unwrap().unwrap();
        assert_eq!(record.status, DatasetStatus::Failed);
        assert_eq!(record.stage, Stage::Failed);
        assert!(record.last_error.unwrap().contains("Download too large"));
    }

    #[tokio::test]
    async fn test_update_on_missing_dataset_reports_not_found() {
        let catalog = test_catalog().await;
        let err = catalog.begin_processing("ghost").await.unwrap_err();
        assert!(matches!(err, StoreError::DatasetNotFound(_)));
    }

    #[tokio::test]
    async fn test_bulk_upsert_inserts_then_updates() {
        let catalog = test_catalog().await;
        let first = vec![sample_record("ds-1", "a.png"), sample_record("ds-1", "b.png")];
        let outcome = catalog.bulk_upsert_files(&first).await;
        assert_eq!(outcome.attempted, 2);
        assert_eq!(outcome.inserted, 2);
        assert_eq!(outcome.failed, 0);

        // Re-running the same descriptors converges instead of duplicating.
        let mut second = first.clone();
        second[0].size_bytes = 99;
        let outcome = catalog.bulk_upsert_files(&second).await;
        assert_eq!(outcome.updated, 2);
        assert_eq!(outcome.inserted, 0);

        assert_eq!(catalog.count_files("ds-1").await.unwrap(), 2);
        let files = catalog.list_files("ds-1").await.unwrap();
        assert_eq!(files[0].size_bytes, 99);
    }

    #[tokio::test]
    async fn test_bulk_upsert_skips_empty_relpath() {
        let catalog = test_catalog().await;
        let mut record = sample_record("ds-1", "a.png");
        record.relpath = String::new();
        let outcome = catalog.bulk_upsert_files(&[record]).await;
        assert_eq!(outcome.attempted, 0);
        assert_eq!(catalog.count_files("ds-1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_file_record_round_trips_through_catalog() {
        let catalog = test_catalog().await;
        let mut record = sample_record("ds-1", "series/slice1.dcm");
        record.kind = FileKind::Dicom;
        record.modality = "CT".to_string();
        record.meta = FileMeta::Dicom {
            sop_class_uid: None,
            series_instance_uid: Some("1.2.3".to_string()),
            study_instance_uid: None,
            body_part_examined: None,
        };

        catalog.bulk_upsert_files(std::slice::from_ref(&record)).await;
        let files = catalog.list_files("ds-1").await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].kind, FileKind::Dicom);
        assert_eq!(files[0].meta.series_instance_uid(), Some("1.2.3"));
        assert_eq!(files[0].dims, Some(vec![128, 128]));
    }

    #[tokio::test]
    async fn test_delete_dataset_files_scoped_to_dataset() {
        let catalog = test_catalog().await;
        catalog
            .bulk_upsert_files(&[sample_record("ds-1", "a.png"), sample_record("ds-2", "b.png")])
            .await;

        let deleted = catalog.delete_dataset_files("ds-1").await.unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(catalog.count_files("ds-1").await.unwrap(), 0);
        assert_eq!(catalog.count_files("ds-2").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_find_processing_orders_newest_first_and_skips_blank_urls() {
        let catalog = test_catalog().await;
        catalog
            .insert_dataset(&NewDataset::new("ds-old", "old", "https://example.com/old.zip"))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        catalog
            .insert_dataset(&NewDataset::new("ds-new", "new", "https://example.com/new.zip"))
            .await
            .unwrap();
        catalog
            .insert_dataset(&NewDataset::new("ds-done", "done", "https://example.com/done.zip"))
            .await
            .unwrap();
        catalog
            .finalize_dataset("ds-done", &DatasetSummary::default())
            .await
            .unwrap();

        let candidates = catalog.find_processing().await.unwrap();
        let ids: Vec<_> = candidates.iter().map(|c| c.dataset_id.as_str()).collect();
        assert_eq!(ids, vec!["ds-new", "ds-old"]);
    }
}

//! Three-stage controller driving one dataset through the pipeline.
//!
//! Stages:
//! 1. prepare       - download and extract the dataset via providers
//! 2. analyze_files - bounded per-file analysis fanout feeding a batch writer
//! 3. finalize      - compose the summary and mark the dataset ready
//!
//! Every stage transition is persisted before the stage's work begins; any
//! error at the controller boundary flips the dataset to `failed` with a
//! diagnostic and writes no partial summary.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, instrument, warn};

use super::{PipelineContext, PipelineError, PipelineJob};
use crate::analyze::analyze_file;
use crate::store::{Catalog, DatasetSummary, FileKind, FileRecord, ModalityShare};
use crate::walker::{file_ext, iter_files};
use crate::workspace::{PrepareResult, prepare_dataset_workspace};

/// Runs one dataset job to a terminal status.
///
/// Errors are absorbed here: the dataset is marked failed and the worker
/// moves on to the next job.
#[instrument(skip(ctx, job), fields(dataset_id = %job.dataset_id))]
pub(super) async fn run_dataset_job(ctx: &PipelineContext, job: &PipelineJob) {
    let mut controller = Controller::new(ctx.clone(), job.clone());
    if let Err(pipeline_error) = controller.execute().await {
        error!(error = %pipeline_error, "pipeline failed");
        if let Err(store_error) = ctx
            .catalog
            .mark_dataset_failed(&job.dataset_id, &pipeline_error.to_string())
            .await
        {
            error!(error = %store_error, "could not record dataset failure");
        }
    }
}

/// Per-dataset state machine. All counters are confined to this task; no
/// cross-task mutation.
struct Controller {
    ctx: PipelineContext,
    dataset_id: String,
    url: String,

    modality_counts: BTreeMap<String, u64>,
    kind_counts: BTreeMap<String, u64>,
    ext_counts: BTreeMap<String, u64>,
    scheduled_ext_counts: BTreeMap<String, u64>,
    duplicate_basename_ext_counts: BTreeMap<String, u64>,
    duplicate_basename_count: u64,
    seen_basenames: HashSet<(String, String)>,
    dicom_series_counts: HashMap<String, u64>,
    image_2d_count: u64,
    volume_3d_count: u64,
    total_files: u64,
    scheduled: u64,

    /// Shared analysis timestamp for every descriptor in this run.
    now: DateTime<Utc>,
}

impl Controller {
    fn new(ctx: PipelineContext, job: PipelineJob) -> Self {
        Self {
            ctx,
            dataset_id: job.dataset_id,
            url: job.url,
            modality_counts: BTreeMap::new(),
            kind_counts: BTreeMap::new(),
            ext_counts: BTreeMap::new(),
            scheduled_ext_counts: BTreeMap::new(),
            duplicate_basename_ext_counts: BTreeMap::new(),
            duplicate_basename_count: 0,
            seen_basenames: HashSet::new(),
            dicom_series_counts: HashMap::new(),
            image_2d_count: 0,
            volume_3d_count: 0,
            total_files: 0,
            scheduled: 0,
            now: Utc::now(),
        }
    }

    async fn execute(&mut self) -> Result<(), PipelineError> {
        let prep = self.stage_prepare().await?;
        self.stage_analyze(&prep).await?;
        self.stage_finalize().await
    }

    /// Stage 1: download and extract the dataset.
    async fn stage_prepare(&mut self) -> Result<PrepareResult, PipelineError> {
        info!(dataset_id = %self.dataset_id, url = %self.url, "stage=prepare starting");
        self.ctx.catalog.begin_processing(&self.dataset_id).await?;

        let prep = prepare_dataset_workspace(
            &self.ctx.settings,
            &self.ctx.providers,
            &self.dataset_id,
            &self.url,
        )
        .await?;
        info!(
            dataset_id = %self.dataset_id,
            provider = %prep.provider,
            scan_root = %prep.scan_root.display(),
            "stage=prepare completed"
        );

        self.ctx
            .catalog
            .record_resolution(
                &self.dataset_id,
                &prep.provider,
                &prep.original_url,
                &prep.resolved_url,
            )
            .await?;
        Ok(prep)
    }

    /// Stage 2: analyze all files under the scan root.
    async fn stage_analyze(&mut self, prep: &PrepareResult) -> Result<(), PipelineError> {
        info!(dataset_id = %self.dataset_id, "stage=analyze_files starting");

        // Clear any existing file records for this dataset (idempotent restart).
        self.ctx
            .catalog
            .delete_dataset_files(&self.dataset_id)
            .await?;

        let batch_size = self.ctx.settings.pipeline_batch_size.max(1);
        let (record_tx, record_rx) = mpsc::channel::<FileRecord>(batch_size * 4);
        let writer = tokio::spawn(batch_writer(
            self.ctx.catalog.clone(),
            self.dataset_id.clone(),
            record_rx,
            batch_size,
            self.ctx.settings.pipeline_batch_flush,
        ));

        let concurrency = self.ctx.settings.pipeline_file_concurrency.max(1);
        let semaphore = Arc::new(tokio::sync::Semaphore::new(concurrency));
        let mut tasks: JoinSet<Result<FileRecord, tokio::task::JoinError>> = JoinSet::new();

        for path in iter_files(&prep.scan_root, self.ctx.settings.max_files_per_dataset) {
            self.scheduled += 1;
            let ext = file_ext(&path);
            bump(&mut self.scheduled_ext_counts, &ext);
            self.track_duplicate_basename(&path, &ext);

            let semaphore = Arc::clone(&semaphore);
            let classifier = Arc::clone(&self.ctx.classifier);
            let prediction_log = self.ctx.prediction_log.clone();
            let scan_root = prep.scan_root.clone();
            let dataset_id = self.dataset_id.clone();
            let created_at = self.now;
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                tokio::task::spawn_blocking(move || {
                    analyze_file(
                        &path,
                        &scan_root,
                        &dataset_id,
                        created_at,
                        classifier.as_ref(),
                        prediction_log.as_deref(),
                    )
                })
                .await
            });

            if self.scheduled % 100 == 0 {
                debug!(
                    dataset_id = %self.dataset_id,
                    scheduled = self.scheduled,
                    "stage=analyze_files scheduling"
                );
            }

            // Backpressure: keep at most 2x the analyzer width outstanding.
            while tasks.len() >= concurrency * 2 {
                self.reap_one(&mut tasks, &record_tx, &writer).await?;
            }
        }

        // Drain remaining tasks.
        while !tasks.is_empty() {
            self.reap_one(&mut tasks, &record_tx, &writer).await?;
        }

        // Closing the channel is the writer's stop sentinel.
        drop(record_tx);
        let stats = writer.await.map_err(|_| PipelineError::WriterCrashed)?;

        info!(
            dataset_id = %self.dataset_id,
            total = self.total_files,
            scheduled = self.scheduled,
            flushes = stats.flushes,
            upserted = stats.upserted,
            "stage=analyze_files completed"
        );
        Ok(())
    }

    /// Stage 3: compute final summary and mark dataset ready.
    async fn stage_finalize(&mut self) -> Result<(), PipelineError> {
        info!(dataset_id = %self.dataset_id, "stage=finalize starting");

        // A DICOM series with multiple instances counts as one 3D volume.
        let dicom_volume_count = self
            .dicom_series_counts
            .values()
            .filter(|&&instances| instances >= 2)
            .count() as u64;
        self.volume_3d_count += dicom_volume_count;

        let summary = self.build_summary();
        self.ctx
            .catalog
            .finalize_dataset(&self.dataset_id, &summary)
            .await?;
        info!(dataset_id = %self.dataset_id, "stage=finalize completed status=ready");
        Ok(())
    }

    /// Awaits one analyzer completion, folds it into the counters, and
    /// publishes the descriptor to the writer.
    async fn reap_one(
        &mut self,
        tasks: &mut JoinSet<Result<FileRecord, tokio::task::JoinError>>,
        record_tx: &mpsc::Sender<FileRecord>,
        writer: &JoinHandle<WriterStats>,
    ) -> Result<(), PipelineError> {
        let Some(joined) = tasks.join_next().await else {
            return Ok(());
        };
        let record = match joined {
            Ok(Ok(record)) => record,
            // Analyzer task loss is tolerated like any per-file fault; the
            // walk already counted it as scheduled.
            Ok(Err(join_error)) | Err(join_error) => {
                warn!(
                    dataset_id = %self.dataset_id,
                    error = %join_error,
                    "analyzer task lost"
                );
                return Ok(());
            }
        };

        self.total_files += 1;
        bump(&mut self.modality_counts, &record.modality);
        bump(&mut self.kind_counts, record.kind.as_str());
        bump(&mut self.ext_counts, &file_ext(Path::new(&record.relpath)));

        if record.kind == FileKind::Dicom {
            if let Some(series_uid) = record.meta.series_instance_uid() {
                *self
                    .dicom_series_counts
                    .entry(series_uid.to_string())
                    .or_default() += 1;
            }
        }

        match record.ndim {
            Some(ndim) if ndim >= 3 => self.volume_3d_count += 1,
            Some(2) => self.image_2d_count += 1,
            _ => {}
        }

        // A writer that is already done while descriptors still flow has
        // crashed; abort the dataset rather than silently dropping rows.
        if writer.is_finished() {
            return Err(PipelineError::WriterCrashed);
        }
        record_tx
            .send(record)
            .await
            .map_err(|_| PipelineError::WriterCrashed)?;

        if self.total_files % 100 == 0 {
            debug!(
                dataset_id = %self.dataset_id,
                completed = self.total_files,
                scheduled = self.scheduled,
                "stage=analyze_files progress"
            );
        }
        Ok(())
    }

    /// Duplicate basenames per extension across subdirectories often
    /// indicate label leakage or copy artifacts.
    fn track_duplicate_basename(&mut self, path: &Path, ext: &str) {
        let basename = path
            .file_name()
            .map(|name| name.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if !self.seen_basenames.insert((ext.to_string(), basename)) {
            self.duplicate_basename_count += 1;
            bump(&mut self.duplicate_basename_ext_counts, ext);
        }
    }

    fn build_summary(&self) -> DatasetSummary {
        let denom = self.total_files.max(1);
        let modalities: BTreeMap<String, ModalityShare> = self
            .modality_counts
            .iter()
            .map(|(label, count)| {
                (
                    label.clone(),
                    ModalityShare {
                        percent: (*count as f64 / denom as f64) * 100.0,
                        confidence: None,
                    },
                )
            })
            .collect();
        let mixed_modality = self
            .modality_counts
            .iter()
            .filter(|(label, count)| **count > 0 && label.as_str() != "unknown")
            .count()
            > 1;

        DatasetSummary {
            total_files: self.total_files,
            scheduled_files: self.scheduled,
            modality_counts: self.modality_counts.clone(),
            modalities,
            mixed_modality,
            outliers: 0,
            kind_counts: self.kind_counts.clone(),
            ext_counts: self.ext_counts.clone(),
            scheduled_ext_counts: self.scheduled_ext_counts.clone(),
            duplicate_basename_count: self.duplicate_basename_count,
            duplicate_basename_ext_counts: self.duplicate_basename_ext_counts.clone(),
            image_2d_count: self.image_2d_count,
            volume_3d_count: self.volume_3d_count,
        }
    }
}

fn bump(counter: &mut BTreeMap<String, u64>, key: &str) {
    *counter.entry(key.to_string()).or_default() += 1;
}

/// Statistics from one batch writer run.
#[derive(Debug, Default)]
struct WriterStats {
    flushes: u64,
    upserted: u64,
    failed_ops: u64,
}

/// Single cooperative consumer draining descriptors into bounded upserts.
///
/// Flushes when the batch fills, when no descriptor arrives within the
/// flush timeout, or on channel close (final flush). Partial upsert
/// failures are logged and swallowed; the writer only signals trouble by
/// terminating, which the controller observes via the join handle.
async fn batch_writer(
    catalog: Catalog,
    dataset_id: String,
    mut record_rx: mpsc::Receiver<FileRecord>,
    batch_size: usize,
    flush_after: Duration,
) -> WriterStats {
    let mut batch: Vec<FileRecord> = Vec::with_capacity(batch_size);
    let mut stats = WriterStats::default();

    loop {
        match tokio::time::timeout(flush_after, record_rx.recv()).await {
            // Quiet period: flush whatever is pending.
            Err(_elapsed) => flush_batch(&catalog, &dataset_id, &mut batch, &mut stats).await,
            Ok(Some(record)) => {
                batch.push(record);
                if batch.len() >= batch_size {
                    flush_batch(&catalog, &dataset_id, &mut batch, &mut stats).await;
                }
            }
            Ok(None) => {
                flush_batch(&catalog, &dataset_id, &mut batch, &mut stats).await;
                return stats;
            }
        }
    }
}

async fn flush_batch(
    catalog: &Catalog,
    dataset_id: &str,
    batch: &mut Vec<FileRecord>,
    stats: &mut WriterStats,
) {
    if batch.is_empty() {
        return;
    }

    let outcome = catalog.bulk_upsert_files(batch).await;
    stats.flushes += 1;
    stats.upserted += (outcome.inserted + outcome.updated) as u64;
    if outcome.failed > 0 {
        stats.failed_ops += outcome.failed as u64;
        warn!(
            dataset_id = %dataset_id,
            ops = outcome.attempted,
            failed = outcome.failed,
            first = outcome.first_error.as_deref().unwrap_or("unknown"),
            "bulk upsert partial failure (continuing)"
        );
    }
    batch.clear();
}

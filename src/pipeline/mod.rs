//! Dataset ingestion pipeline: job queue, worker, controller, recovery.
//!
//! Process-wide there is one unbounded FIFO of `{dataset_id, url}` jobs and
//! one consumer task. The consumer pops a job and drives the three-stage
//! controller to completion (successful or failed) before taking the next,
//! so datasets are strictly serialised while files within a dataset fan out
//! under bounded concurrency.
//!
//! # Overview
//!
//! - [`DatasetPipeline`] - Queue plus worker lifecycle (idempotent start/stop)
//! - [`PipelineContext`] - Shared collaborators handed to the controller
//! - [`PipelineJob`] - One queued dataset
//! - [`requeue_processing_datasets`] - Startup crash recovery
//! - [`PipelineError`] - Operation error types

mod controller;
mod recovery;

pub use recovery::requeue_processing_datasets;

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::analyze::{ModalityClassifier, PredictionLogger};
use crate::config::Settings;
use crate::provider::ProviderRegistry;
use crate::store::{Catalog, StoreError};
use crate::workspace::WorkspaceError;

/// Errors raised by pipeline operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Enqueue attempted while the pipeline is disabled by configuration.
    #[error("pipeline is disabled")]
    Disabled,

    /// The job queue is gone; the pipeline was torn down.
    #[error("pipeline queue is closed")]
    QueueClosed,

    /// The batch writer terminated while descriptors were still flowing.
    #[error("batch-writer crashed")]
    WriterCrashed,

    /// Workspace preparation failed.
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    /// Catalog operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One queued dataset ingest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineJob {
    /// Stable external dataset handle.
    pub dataset_id: String,
    /// URL to ingest.
    pub url: String,
}

/// Collaborators shared by every controller run.
///
/// Created once at startup and passed by reference; there is no hidden
/// module-level state.
pub struct PipelineContext {
    /// Runtime configuration.
    pub settings: Arc<Settings>,
    /// Dataset/file catalog.
    pub catalog: Catalog,
    /// Fetch strategy registry.
    pub providers: Arc<ProviderRegistry>,
    /// Modality classifier backbone.
    pub classifier: Arc<dyn ModalityClassifier>,
    /// Optional prediction logger.
    pub prediction_log: Option<Arc<PredictionLogger>>,
}

impl Clone for PipelineContext {
    fn clone(&self) -> Self {
        Self {
            settings: Arc::clone(&self.settings),
            catalog: self.catalog.clone(),
            providers: Arc::clone(&self.providers),
            classifier: Arc::clone(&self.classifier),
            prediction_log: self.prediction_log.clone(),
        }
    }
}

/// Worker lifecycle state guarded by the pipeline mutex.
struct WorkerState {
    worker: Option<JoinHandle<()>>,
    stop_tx: Option<watch::Sender<bool>>,
}

/// In-process dataset job queue with a single consumer.
pub struct DatasetPipeline {
    ctx: PipelineContext,
    job_tx: mpsc::UnboundedSender<PipelineJob>,
    // The receiver outlives worker restarts: each worker locks it for the
    // duration of its loop, so queued jobs survive stop/start cycles.
    job_rx: Arc<Mutex<mpsc::UnboundedReceiver<PipelineJob>>>,
    state: Mutex<WorkerState>,
}

impl DatasetPipeline {
    /// Creates the pipeline around its collaborators. The worker is not
    /// started until [`start`](Self::start) is called.
    #[must_use]
    pub fn new(ctx: PipelineContext) -> Self {
        let (job_tx, job_rx) = mpsc::unbounded_channel();
        Self {
            ctx,
            job_tx,
            job_rx: Arc::new(Mutex::new(job_rx)),
            state: Mutex::new(WorkerState {
                worker: None,
                stop_tx: None,
            }),
        }
    }

    /// Starts the consumer task. Idempotent; a no-op while a worker is
    /// already running or when the pipeline is disabled.
    #[instrument(skip(self))]
    pub async fn start(&self) {
        if !self.ctx.settings.pipeline_enabled {
            info!("pipeline disabled, worker not started");
            return;
        }

        let mut state = self.state.lock().await;
        if state
            .worker
            .as_ref()
            .is_some_and(|worker| !worker.is_finished())
        {
            debug!("worker already running");
            return;
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let ctx = self.ctx.clone();
        let job_rx = Arc::clone(&self.job_rx);
        state.worker = Some(tokio::spawn(worker_loop(ctx, job_rx, stop_rx)));
        state.stop_tx = Some(stop_tx);
        info!("pipeline worker started");
    }

    /// Stops the consumer task cooperatively, cancelling any in-flight
    /// controller. Idempotent; queued jobs remain for the next start.
    #[instrument(skip(self))]
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        let Some(worker) = state.worker.take() else {
            return;
        };
        if let Some(stop_tx) = state.stop_tx.take() {
            let _ = stop_tx.send(true);
        }
        if let Err(error) = worker.await {
            warn!(error = %error, "pipeline worker ended abnormally");
        }
        info!("pipeline worker stopped");
    }

    /// Enqueues a dataset job.
    ///
    /// The caller must have created the dataset row
    /// (`status=processing, stage=enqueued`) beforehand.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Disabled`] when the pipeline is disabled by
    /// configuration, or [`PipelineError::QueueClosed`] when the queue has
    /// been torn down.
    #[instrument(skip(self), fields(dataset_id = %dataset_id))]
    pub fn enqueue(&self, dataset_id: &str, url: &str) -> Result<(), PipelineError> {
        if !self.ctx.settings.pipeline_enabled {
            return Err(PipelineError::Disabled);
        }
        self.job_tx
            .send(PipelineJob {
                dataset_id: dataset_id.to_string(),
                url: url.to_string(),
            })
            .map_err(|_| PipelineError::QueueClosed)
    }

    /// Returns the shared context (used by recovery and the binary).
    #[must_use]
    pub fn context(&self) -> &PipelineContext {
        &self.ctx
    }
}

/// Consumer loop: strictly FIFO across datasets, cancellation-aware at both
/// the dequeue point and around the in-flight controller.
async fn worker_loop(
    ctx: PipelineContext,
    job_rx: Arc<Mutex<mpsc::UnboundedReceiver<PipelineJob>>>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut rx = job_rx.lock().await;
    loop {
        let job = tokio::select! {
            () = stop_requested(&mut stop_rx) => break,
            maybe_job = rx.recv() => match maybe_job {
                Some(job) => job,
                None => break,
            },
        };

        debug!(dataset_id = %job.dataset_id, url = %job.url, "job dequeued");
        tokio::select! {
            () = stop_requested(&mut stop_rx) => {
                info!(dataset_id = %job.dataset_id, "in-flight job cancelled by stop");
                break;
            }
            () = controller::run_dataset_job(&ctx, &job) => {}
        }
    }
}

/// Resolves when stop is signalled. A dropped sender also resolves, so a
/// torn-down pipeline cannot leave the worker spinning.
async fn stop_requested(stop_rx: &mut watch::Receiver<bool>) {
    let _ = stop_rx.wait_for(|stop| *stop).await;
}

//! Best-effort recovery for the in-process queue.
//!
//! The job queue is in-memory, so a process restart can leave datasets in
//! `status=processing` without a running job. On startup we re-enqueue
//! those datasets from their persisted `source_url`. This is safe because
//! the analyze stage begins by deleting the dataset's prior file rows and
//! finalize overwrites the summary, so a replayed run converges to the same
//! terminal state.

use tracing::{info, instrument, warn};

use super::{DatasetPipeline, PipelineError};

/// Re-enqueues datasets stuck in `processing`, newest first (bounded by the
/// catalog's recovery scan limit). Returns how many were re-enqueued.
///
/// A disabled pipeline recovers nothing; the datasets stay `processing`
/// until a worker is allowed to run again.
///
/// # Errors
///
/// Returns [`PipelineError::Store`] when the catalog scan fails, or
/// [`PipelineError::QueueClosed`] when the queue has been torn down.
#[instrument(skip(pipeline))]
pub async fn requeue_processing_datasets(
    pipeline: &DatasetPipeline,
) -> Result<usize, PipelineError> {
    let ctx = pipeline.context();
    if !ctx.settings.pipeline_enabled {
        warn!("pipeline disabled, skipping recovery");
        return Ok(0);
    }

    let candidates = ctx.catalog.find_processing().await?;
    let mut requeued = 0;
    for candidate in candidates {
        pipeline.enqueue(&candidate.dataset_id, &candidate.source_url)?;
        requeued += 1;
    }

    if requeued > 0 {
        info!(requeued, "re-enqueued datasets stuck in processing");
    }
    Ok(requeued)
}

//! CLI entry point for the datascan service.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use datascan_core::analyze::{ModalityClassifier, PredictionLogger, UniformClassifier};
use datascan_core::pipeline::requeue_processing_datasets;
use datascan_core::store::{Catalog, NewDataset, ensure_catalog_indexes};
use datascan_core::{
    Database, DatasetPipeline, PipelineContext, Settings, build_default_provider_registry,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

mod cli;

use cli::Args;

/// Poll interval while waiting for submitted datasets to reach a terminal
/// status.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Determine log level based on verbose/quiet flags
    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    debug!(?args, "CLI arguments parsed");
    info!("DataScan starting");

    let settings = Arc::new(Settings::from_env());
    if !settings.pipeline_enabled && !args.urls.is_empty() {
        bail!("pipeline is disabled (DATASCAN_PIPELINE_ENABLED=false), cannot ingest URLs");
    }

    tokio::fs::create_dir_all(&settings.data_root)
        .await
        .with_context(|| format!("creating data root {}", settings.data_root.display()))?;

    let db = Database::open(&settings.db_path).await?;
    let catalog = Catalog::new(db);

    let classifier: Arc<dyn ModalityClassifier> = Arc::new(UniformClassifier);
    let prediction_log = if settings.prediction_log_enabled {
        match PredictionLogger::new(
            &settings.prediction_log_path,
            settings.prediction_log_low_confidence_threshold,
        ) {
            Ok(logger) => Some(Arc::new(logger)),
            Err(error) => {
                warn!(error = %error, "prediction logging unavailable, continuing without it");
                None
            }
        }
    } else {
        None
    };

    let providers = Arc::new(build_default_provider_registry(&settings));
    let pipeline = DatasetPipeline::new(PipelineContext {
        settings: Arc::clone(&settings),
        catalog: catalog.clone(),
        providers,
        classifier,
        prediction_log,
    });

    // Startup order: worker, indexes, then recovery of datasets the previous
    // process left in flight (the in-memory queue does not survive restarts).
    pipeline.start().await;
    let indexes = ensure_catalog_indexes(catalog.database()).await;
    if !indexes.files_unique {
        warn!("file catalog uniqueness unavailable, relying on upsert semantics");
    }
    let recovered = requeue_processing_datasets(&pipeline).await?;

    // Submit one dataset per URL.
    let mut submitted: Vec<String> = Vec::new();
    for url in &args.urls {
        let dataset_id = Uuid::new_v4().to_string();
        let name = args
            .name
            .clone()
            .filter(|_| args.urls.len() == 1)
            .unwrap_or_else(|| default_dataset_name(url));

        let mut dataset = NewDataset::new(&dataset_id, &name, url);
        dataset.team_id = args.team.clone();
        catalog.insert_dataset(&dataset).await?;
        pipeline.enqueue(&dataset_id, url)?;

        info!(dataset_id = %dataset_id, name = %name, url = %url, "dataset enqueued");
        submitted.push(dataset_id);
    }

    if submitted.is_empty() && recovered == 0 {
        info!("Nothing to do. Pass dataset URLs as arguments.");
        info!("Example: datascan https://example.com/chest-xrays.zip");
        pipeline.stop().await;
        return Ok(());
    }

    wait_for_terminal(&catalog, &submitted, recovered).await?;

    let mut failures = 0usize;
    for dataset_id in &submitted {
        let Some(record) = catalog.get_dataset(dataset_id).await? else {
            continue;
        };
        match record.summary {
            Some(summary) => info!(
                dataset_id = %record.dataset_id,
                name = %record.name,
                status = %record.status,
                total_files = summary.total_files,
                image_2d = summary.image_2d_count,
                volume_3d = summary.volume_3d_count,
                duplicates = summary.duplicate_basename_count,
                mixed_modality = summary.mixed_modality,
                "dataset finished"
            ),
            None => {
                failures += 1;
                warn!(
                    dataset_id = %record.dataset_id,
                    name = %record.name,
                    status = %record.status,
                    error = record.last_error.as_deref().unwrap_or("unknown"),
                    "dataset did not complete"
                );
            }
        }
    }

    pipeline.stop().await;
    if failures > 0 {
        bail!("{failures} dataset(s) failed");
    }
    Ok(())
}

/// Waits until every submitted dataset (and anything recovered at startup)
/// has reached a terminal status.
async fn wait_for_terminal(
    catalog: &Catalog,
    submitted: &[String],
    recovered: usize,
) -> Result<()> {
    loop {
        let mut pending = 0usize;
        for dataset_id in submitted {
            if let Some(record) = catalog.get_dataset(dataset_id).await? {
                if !record.status.is_terminal() {
                    pending += 1;
                }
            }
        }
        // Recovered datasets are tracked through the processing scan.
        if recovered > 0 {
            pending += catalog.find_processing().await?.len();
        }
        if pending == 0 {
            return Ok(());
        }
        debug!(pending, "waiting for datasets to finish");
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Derives a readable dataset name from the URL (last path segment, else
/// host, else a constant).
fn default_dataset_name(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    let candidate = trimmed
        .rsplit('/')
        .next()
        .unwrap_or("")
        .split(['?', '#'])
        .next()
        .unwrap_or("");
    if candidate.is_empty() || candidate.starts_with("http") {
        url::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(ToString::to_string))
            .unwrap_or_else(|| "dataset".to_string())
    } else {
        candidate.to_string()
    }
}

//! Environment-driven configuration for the ingestion pipeline.
//!
//! All keys use the `DATASCAN_` prefix. Values are read once at startup via
//! [`Settings::from_env`]; unparseable values fall back to the default with a
//! warning rather than aborting startup.

use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

/// Environment variable prefix for all settings.
const ENV_PREFIX: &str = "DATASCAN_";

/// Default workspace root for downloaded/extracted datasets.
const DEFAULT_DATA_ROOT: &str = "/tmp/datascan";

/// Default per-download byte cap (2 GB).
const DEFAULT_MAX_DOWNLOAD_BYTES: u64 = 2_000_000_000;

/// Default per-archive uncompressed byte cap (5 GB).
const DEFAULT_MAX_EXTRACTED_BYTES: u64 = 5_000_000_000;

/// Default file walk cap per dataset.
const DEFAULT_MAX_FILES_PER_DATASET: usize = 50_000;

/// Default analyzer semaphore width.
const DEFAULT_FILE_CONCURRENCY: usize = 32;

/// Default batch writer flush size.
const DEFAULT_BATCH_SIZE: usize = 10;

/// Default batch writer flush timeout in seconds.
const DEFAULT_BATCH_FLUSH_SECS: f64 = 1.0;

/// Default network fetch timeout in seconds.
const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 120;

/// Default HTML preview timeout in seconds.
const DEFAULT_PREVIEW_TIMEOUT_SECS: u64 = 30;

/// Default host matched by the archive-hosting dataset provider.
const DEFAULT_DATASET_HOST: &str = "kaggle.com";

/// Default threshold below which predictions are mirrored for review.
const DEFAULT_LOW_CONFIDENCE_THRESHOLD: f64 = 0.6;

/// Runtime configuration resolved from the environment.
///
/// Immutable after startup; shared by reference across the pipeline.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Workspace root; each dataset gets `<data_root>/<dataset_id>/`.
    pub data_root: PathBuf,
    /// Path to the catalog database file.
    pub db_path: PathBuf,
    /// Per-download byte cap.
    pub max_download_bytes: u64,
    /// Per-archive cumulative uncompressed byte cap.
    pub max_extracted_bytes: u64,
    /// Maximum number of files walked per dataset.
    pub max_files_per_dataset: usize,
    /// Gate for the pipeline worker; enqueue fails when false.
    pub pipeline_enabled: bool,
    /// Analyzer semaphore width within a dataset.
    pub pipeline_file_concurrency: usize,
    /// Batch writer flush size.
    pub pipeline_batch_size: usize,
    /// Batch writer flush timeout.
    pub pipeline_batch_flush: Duration,
    /// Timeout applied to provider downloads.
    pub fetch_timeout: Duration,
    /// Timeout applied to HTML preview fetches.
    pub preview_timeout: Duration,
    /// Host matched by the archive-hosting dataset provider.
    pub dataset_host: String,
    /// Archive-host API username.
    pub kaggle_username: Option<String>,
    /// Archive-host API key.
    pub kaggle_key: Option<String>,
    /// Bearer token for the source-repository provider.
    pub github_token: Option<String>,
    /// JSON object of extra HTTP headers for the authenticated provider.
    pub http_headers_json: Option<String>,
    /// Basic-auth username for the authenticated provider.
    pub http_basic_user: Option<String>,
    /// Basic-auth password for the authenticated provider.
    pub http_basic_pass: Option<String>,
    /// Whether modality predictions are logged for retraining.
    pub prediction_log_enabled: bool,
    /// Directory receiving JSONL prediction logs.
    pub prediction_log_path: PathBuf,
    /// Predictions below this confidence are mirrored to `needs_review/`.
    pub prediction_log_low_confidence_threshold: f64,
}

impl Settings {
    /// Reads settings from `DATASCAN_*` environment variables, applying
    /// defaults for anything unset or unparseable.
    #[must_use]
    pub fn from_env() -> Self {
        let data_root = PathBuf::from(
            env_string("DATA_ROOT").unwrap_or_else(|| DEFAULT_DATA_ROOT.to_string()),
        );
        let db_path = env_string("DB_PATH")
            .map_or_else(|| data_root.join("datascan.db"), PathBuf::from);
        let prediction_log_path = env_string("PREDICTION_LOG_PATH")
            .map_or_else(|| data_root.join("prediction_logs"), PathBuf::from);

        Self {
            db_path,
            max_download_bytes: env_parsed("MAX_DOWNLOAD_BYTES", DEFAULT_MAX_DOWNLOAD_BYTES),
            max_extracted_bytes: env_parsed("MAX_EXTRACTED_BYTES", DEFAULT_MAX_EXTRACTED_BYTES),
            max_files_per_dataset: env_parsed(
                "MAX_FILES_PER_DATASET",
                DEFAULT_MAX_FILES_PER_DATASET,
            ),
            pipeline_enabled: env_parsed("PIPELINE_ENABLED", true),
            pipeline_file_concurrency: env_parsed(
                "PIPELINE_FILE_CONCURRENCY",
                DEFAULT_FILE_CONCURRENCY,
            )
            .max(1),
            pipeline_batch_size: env_parsed("PIPELINE_BATCH_SIZE", DEFAULT_BATCH_SIZE).max(1),
            pipeline_batch_flush: Duration::from_secs_f64(
                env_parsed("PIPELINE_BATCH_FLUSH_SECS", DEFAULT_BATCH_FLUSH_SECS).max(0.01),
            ),
            fetch_timeout: Duration::from_secs(env_parsed(
                "FETCH_TIMEOUT_SECS",
                DEFAULT_FETCH_TIMEOUT_SECS,
            )),
            preview_timeout: Duration::from_secs(env_parsed(
                "PREVIEW_TIMEOUT_SECS",
                DEFAULT_PREVIEW_TIMEOUT_SECS,
            )),
            dataset_host: env_string("DATASET_HOST")
                .unwrap_or_else(|| DEFAULT_DATASET_HOST.to_string()),
            kaggle_username: env_string("KAGGLE_USERNAME"),
            kaggle_key: env_string("KAGGLE_KEY"),
            github_token: env_string("GITHUB_TOKEN"),
            http_headers_json: env_string("HTTP_HEADERS_JSON"),
            http_basic_user: env_string("HTTP_BASIC_USER"),
            http_basic_pass: env_string("HTTP_BASIC_PASS"),
            prediction_log_enabled: env_parsed("PREDICTION_LOG_ENABLED", true),
            prediction_log_path,
            prediction_log_low_confidence_threshold: env_parsed(
                "PREDICTION_LOG_LOW_CONFIDENCE_THRESHOLD",
                DEFAULT_LOW_CONFIDENCE_THRESHOLD,
            ),
            data_root,
        }
    }

    /// Returns defaults rooted at the given directory.
    ///
    /// Used by tests and embedders that manage their own workspace layout.
    #[must_use]
    pub fn with_data_root(data_root: impl Into<PathBuf>) -> Self {
        let data_root = data_root.into();
        Self {
            db_path: data_root.join("datascan.db"),
            max_download_bytes: DEFAULT_MAX_DOWNLOAD_BYTES,
            max_extracted_bytes: DEFAULT_MAX_EXTRACTED_BYTES,
            max_files_per_dataset: DEFAULT_MAX_FILES_PER_DATASET,
            pipeline_enabled: true,
            pipeline_file_concurrency: DEFAULT_FILE_CONCURRENCY,
            pipeline_batch_size: DEFAULT_BATCH_SIZE,
            pipeline_batch_flush: Duration::from_secs_f64(DEFAULT_BATCH_FLUSH_SECS),
            fetch_timeout: Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS),
            preview_timeout: Duration::from_secs(DEFAULT_PREVIEW_TIMEOUT_SECS),
            dataset_host: DEFAULT_DATASET_HOST.to_string(),
            kaggle_username: None,
            kaggle_key: None,
            github_token: None,
            http_headers_json: None,
            http_basic_user: None,
            http_basic_pass: None,
            prediction_log_enabled: false,
            prediction_log_path: data_root.join("prediction_logs"),
            prediction_log_low_confidence_threshold: DEFAULT_LOW_CONFIDENCE_THRESHOLD,
            data_root,
        }
    }
}

/// Reads a trimmed, non-empty string value for the prefixed key.
fn env_string(key: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}{key}"))
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parses a typed value for the prefixed key, warning and defaulting on
/// parse failure.
fn env_parsed<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    match env_string(key) {
        None => default,
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(key = %format!("{ENV_PREFIX}{key}"), value = %raw, "unparseable setting, using default");
            default
        }),
    }
}

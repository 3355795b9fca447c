//! Per-dataset workspace preparation.
//!
//! Materialises a dataset URL under `<data_root>/<dataset_id>/`:
//! `download.bin` holds the raw fetch, `extracted/` holds the files the
//! analyzer walks. Archives are extracted with zip-slip defence and a
//! cumulative uncompressed-size cap; single files are copied under a
//! sanitised name.

use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, instrument, warn};

use crate::config::Settings;
use crate::provider::{ProviderError, ProviderRegistry};

/// Zip local-file-header signature.
const ZIP_MAGIC: [u8; 4] = [0x50, 0x4B, 0x03, 0x04];

/// Fallback name for single-file downloads.
const DEFAULT_DOWNLOAD_NAME: &str = "download.bin";

/// Errors raised while preparing a dataset workspace.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    /// Provider selection or fetch failed.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Local filesystem failure.
    #[error("IO error at {path}: {source}")]
    Io {
        /// Path involved in the failure.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The archive could not be read.
    #[error("invalid archive: {0}")]
    Archive(#[from] zip::result::ZipError),

    /// Cumulative uncompressed member sizes exceeded the configured cap.
    #[error("Extracted data too large: exceeded {limit_bytes} bytes")]
    ExtractTooLarge {
        /// The configured cap.
        limit_bytes: u64,
    },

    /// The blocking extraction task was cancelled or panicked.
    #[error("extraction task failed: {0}")]
    ExtractionTask(String),
}

impl WorkspaceError {
    fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Output of workspace preparation; `scan_root` is what the walker scans.
#[derive(Debug, Clone)]
pub struct PrepareResult {
    /// Provider that fetched the dataset.
    pub provider: String,
    /// URL the fetch was requested with.
    pub original_url: String,
    /// URL that was actually downloaded.
    pub resolved_url: String,
    /// Directory holding the extracted (or copied) files.
    pub scan_root: PathBuf,
}

/// Prepares the local workspace for a dataset.
///
/// Downloads the URL via the registry, extracts archives (or copies single
/// files) under `extracted/`, and returns the scan root.
///
/// # Errors
///
/// Returns [`WorkspaceError`] on provider failures, cap violations, invalid
/// archives, and filesystem failures. Unsafe archive members (absolute
/// paths, `..` segments) are skipped, not fatal.
#[instrument(skip(settings, registry), fields(dataset_id = %dataset_id, url = %url))]
pub async fn prepare_dataset_workspace(
    settings: &Settings,
    registry: &ProviderRegistry,
    dataset_id: &str,
    url: &str,
) -> Result<PrepareResult, WorkspaceError> {
    let root = settings.data_root.join(dataset_id);
    let download_path = root.join(DEFAULT_DOWNLOAD_NAME);
    let extracted_root = root.join("extracted");

    tokio::fs::create_dir_all(&extracted_root)
        .await
        .map_err(|e| WorkspaceError::io(&extracted_root, e))?;

    let fetch = registry.fetch(url, &download_path).await?;

    let is_zip = looks_like_zip(&download_path).await
        || fetch.resolved_url.to_ascii_lowercase().ends_with(".zip");

    if is_zip {
        let zip_path = download_path.clone();
        let dest = extracted_root.clone();
        let max_bytes = settings.max_extracted_bytes;
        let outcome = tokio::task::spawn_blocking(move || safe_extract_zip(&zip_path, &dest, max_bytes))
            .await
            .map_err(|e| WorkspaceError::ExtractionTask(e.to_string()))??;
        info!(
            files = outcome.files,
            bytes = outcome.bytes,
            skipped = outcome.skipped_members,
            "archive extracted"
        );
    } else {
        let target = extracted_root.join(safe_name_from_url(&fetch.resolved_url));
        tokio::fs::copy(&download_path, &target)
            .await
            .map_err(|e| WorkspaceError::io(&target, e))?;
        debug!(target = %target.display(), "single file staged");
    }

    Ok(PrepareResult {
        provider: fetch.provider,
        original_url: fetch.original_url,
        resolved_url: fetch.resolved_url,
        scan_root: extracted_root,
    })
}

/// Checks the leading bytes for the zip signature. Unreadable files are
/// simply not zips.
async fn looks_like_zip(path: &Path) -> bool {
    let Ok(mut file) = tokio::fs::File::open(path).await else {
        return false;
    };
    let mut signature = [0u8; 4];
    match file.read_exact(&mut signature).await {
        Ok(_) => signature == ZIP_MAGIC,
        Err(_) => false,
    }
}

/// Counters from one archive extraction.
#[derive(Debug, Default)]
struct ExtractOutcome {
    files: usize,
    bytes: u64,
    skipped_members: usize,
}

/// Extracts an archive under `dest`, skipping unsafe member paths and
/// enforcing the cumulative uncompressed-size cap (equality passes).
fn safe_extract_zip(
    zip_path: &Path,
    dest: &Path,
    max_bytes: u64,
) -> Result<ExtractOutcome, WorkspaceError> {
    let file = std::fs::File::open(zip_path).map_err(|e| WorkspaceError::io(zip_path, e))?;
    let mut archive = zip::ZipArchive::new(file)?;

    let mut outcome = ExtractOutcome::default();
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        let member_path = PathBuf::from(entry.name());

        if member_path.is_absolute()
            || member_path
                .components()
                .any(|c| matches!(c, Component::ParentDir))
        {
            warn!(member = %member_path.display(), "skipping unsafe archive member");
            outcome.skipped_members += 1;
            continue;
        }

        outcome.bytes += entry.size();
        if outcome.bytes > max_bytes {
            return Err(WorkspaceError::ExtractTooLarge {
                limit_bytes: max_bytes,
            });
        }

        let target = dest.join(&member_path);
        if entry.is_dir() {
            std::fs::create_dir_all(&target).map_err(|e| WorkspaceError::io(&target, e))?;
            continue;
        }

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| WorkspaceError::io(parent, e))?;
        }
        let mut out = std::fs::File::create(&target).map_err(|e| WorkspaceError::io(&target, e))?;
        std::io::copy(&mut entry, &mut out).map_err(|e| WorkspaceError::io(&target, e))?;
        outcome.files += 1;
    }

    Ok(outcome)
}

/// Derives a filesystem-safe name from the final URL path segment.
///
/// Query/fragment are stripped and only `[A-Za-z0-9_.+-]` survives.
fn safe_name_from_url(url: &str) -> String {
    let segment = url.rsplit('/').next().unwrap_or(DEFAULT_DOWNLOAD_NAME);
    let segment = segment.split(['?', '#']).next().unwrap_or("");
    let name: String = segment
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '+'))
        .collect();
    if name.is_empty() {
        DEFAULT_DOWNLOAD_NAME.to_string()
    } else {
        name
    }
}

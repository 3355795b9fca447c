//! Shared streaming download plumbing for providers.
//!
//! All providers stream response bodies chunk-by-chunk to disk and enforce
//! the cumulative download byte cap; a download whose size equals the cap
//! succeeds, one byte more fails.

use std::path::Path;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::Client;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::debug;

use super::error::ProviderError;

/// HTTP connect timeout for provider fetches.
const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Builds the HTTP client shared by all providers.
///
/// # Panics
///
/// Panics if the HTTP client builder fails to build with the static
/// configuration. This should never happen in practice.
#[must_use]
#[allow(clippy::expect_used)]
pub(crate) fn build_fetch_client(fetch_timeout: Duration) -> Client {
    Client::builder()
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .timeout(fetch_timeout)
        .gzip(true)
        .user_agent(concat!("datascan/", env!("CARGO_PKG_VERSION")))
        .build()
        .expect("failed to build HTTP client with static configuration")
}

/// Maps non-success statuses to [`ProviderError::HttpStatus`].
pub(crate) fn ensure_success(
    response: reqwest::Response,
    url: &str,
) -> Result<reqwest::Response, ProviderError> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(ProviderError::http_status(url, response.status().as_u16()))
    }
}

/// Streams a response body to `out_path` under the byte cap.
///
/// Returns the number of bytes written. On any failure the partial file is
/// removed so retried fetches start clean.
pub(crate) async fn stream_response_to_path(
    response: reqwest::Response,
    out_path: &Path,
    max_bytes: u64,
    url: &str,
) -> Result<u64, ProviderError> {
    if let Some(parent) = out_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ProviderError::io(parent, e))?;
    }

    let file = File::create(out_path)
        .await
        .map_err(|e| ProviderError::io(out_path, e))?;

    let result = stream_body(response, file, out_path, max_bytes, url).await;
    if result.is_err() {
        let _ = tokio::fs::remove_file(out_path).await;
    }
    result
}

async fn stream_body(
    response: reqwest::Response,
    file: File,
    out_path: &Path,
    max_bytes: u64,
    url: &str,
) -> Result<u64, ProviderError> {
    let mut writer = BufWriter::new(file);
    let mut stream = response.bytes_stream();
    let mut total: u64 = 0;

    while let Some(chunk_result) = stream.next().await {
        let chunk = chunk_result.map_err(|e| ProviderError::network(url, e))?;
        if chunk.is_empty() {
            continue;
        }

        total += chunk.len() as u64;
        if total > max_bytes {
            return Err(ProviderError::DownloadTooLarge {
                limit_bytes: max_bytes,
            });
        }

        writer
            .write_all(&chunk)
            .await
            .map_err(|e| ProviderError::io(out_path, e))?;
    }

    writer
        .flush()
        .await
        .map_err(|e| ProviderError::io(out_path, e))?;

    debug!(bytes = total, path = %out_path.display(), "download streamed");
    Ok(total)
}

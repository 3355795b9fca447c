//! Archive-hosting dataset provider (Kaggle-style).
//!
//! Matches `https://<dataset_host>/datasets/<owner>/<name>` pages and fetches
//! the zipped archive through the host's versioned download API with basic
//! credentials.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{info, instrument};
use url::Url;

use super::error::ProviderError;
use super::stream::{ensure_success, stream_response_to_path};
use super::{FetchResult, IngestProvider};
use crate::config::Settings;

/// Provider for archive-hosting dataset pages.
pub struct ArchiveHostProvider {
    settings: Arc<Settings>,
    client: Client,
}

impl ArchiveHostProvider {
    /// Creates the provider with shared settings and HTTP client.
    #[must_use]
    pub fn new(settings: Arc<Settings>, client: Client) -> Self {
        Self { settings, client }
    }

    fn host_matches(&self, host: &str) -> bool {
        let configured = self.settings.dataset_host.to_ascii_lowercase();
        let host = host.to_ascii_lowercase();
        host == configured || host == format!("www.{configured}")
    }
}

#[async_trait]
impl IngestProvider for ArchiveHostProvider {
    fn name(&self) -> &'static str {
        "kaggle"
    }

    fn can_handle(&self, url: &str) -> bool {
        let Ok(parsed) = Url::parse(url) else {
            return false;
        };
        if !matches!(parsed.scheme(), "http" | "https") {
            return false;
        }
        let Some(host) = parsed.host_str() else {
            return false;
        };
        if !self.host_matches(host) {
            return false;
        }
        parse_dataset_ref(&parsed).is_some()
    }

    #[instrument(skip(self, out_path), fields(url = %url))]
    async fn fetch(&self, url: &str, out_path: &Path) -> Result<FetchResult, ProviderError> {
        let parsed = Url::parse(url).map_err(|_| ProviderError::invalid_url(url))?;
        let Some((owner, name)) = parse_dataset_ref(&parsed) else {
            return Err(ProviderError::invalid_url(url));
        };

        let (Some(username), Some(key)) = (
            self.settings.kaggle_username.as_deref(),
            self.settings.kaggle_key.as_deref(),
        ) else {
            return Err(ProviderError::MissingCredentials {
                provider: "kaggle",
                hint: "set DATASCAN_KAGGLE_USERNAME and DATASCAN_KAGGLE_KEY",
            });
        };

        let api_url = format!(
            "{}://{}/api/v1/datasets/download/{owner}/{name}",
            parsed.scheme(),
            self.settings.dataset_host
        );

        let response = self
            .client
            .get(&api_url)
            .basic_auth(username, Some(key))
            .send()
            .await
            .map_err(|e| ProviderError::network(&api_url, e))?;
        let response = ensure_success(response, &api_url)?;

        let bytes = stream_response_to_path(
            response,
            out_path,
            self.settings.max_download_bytes,
            &api_url,
        )
        .await?;
        info!(owner = %owner, dataset = %name, bytes, "archive fetched");

        Ok(FetchResult {
            provider: self.name().to_string(),
            original_url: url.to_string(),
            resolved_url: api_url,
        })
    }
}

/// Extracts `(owner, name)` from a `/datasets/<owner>/<name>` path.
fn parse_dataset_ref(url: &Url) -> Option<(String, String)> {
    let mut segments = url.path_segments()?.filter(|s| !s.is_empty());
    if segments.next()? != "datasets" {
        return None;
    }
    let owner = segments.next()?;
    let name = segments.next()?;
    Some((owner.to_string(), name.to_string()))
}

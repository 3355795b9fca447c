//! Source-repository provider (GitHub-style).
//!
//! Matches `https://github.com/<owner>/<repo>[/tree/<ref>]` and streams the
//! repository zipball from the API, with an optional bearer token for
//! private repositories and higher rate limits.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use tracing::{info, instrument};
use url::Url;

use super::error::ProviderError;
use super::stream::{ensure_success, stream_response_to_path};
use super::{FetchResult, IngestProvider};
use crate::config::Settings;

/// Host matched by this provider.
const REPO_HOST: &str = "github.com";

/// API base used to resolve zipball downloads.
const API_BASE: &str = "https://api.github.com";

/// Provider for source repository URLs.
pub struct SourceRepoProvider {
    settings: Arc<Settings>,
    client: Client,
    api_base: String,
}

impl SourceRepoProvider {
    /// Creates the provider with shared settings and HTTP client.
    #[must_use]
    pub fn new(settings: Arc<Settings>, client: Client) -> Self {
        Self {
            settings,
            client,
            api_base: API_BASE.to_string(),
        }
    }

    /// Overrides the API base URL; used by tests with a mock server.
    #[cfg(test)]
    fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }
}

#[async_trait]
impl IngestProvider for SourceRepoProvider {
    fn name(&self) -> &'static str {
        "github"
    }

    fn can_handle(&self, url: &str) -> bool {
        let Ok(parsed) = Url::parse(url) else {
            return false;
        };
        if !matches!(parsed.scheme(), "http" | "https") {
            return false;
        }
        if parsed
            .host_str()
            .is_none_or(|host| !host.eq_ignore_ascii_case(REPO_HOST))
        {
            return false;
        }
        parse_repo_url(&parsed).is_some()
    }

    #[instrument(skip(self, out_path), fields(url = %url))]
    async fn fetch(&self, url: &str, out_path: &Path) -> Result<FetchResult, ProviderError> {
        let parsed = Url::parse(url).map_err(|_| ProviderError::invalid_url(url))?;
        let Some((owner, repo, reference)) = parse_repo_url(&parsed) else {
            return Err(ProviderError::invalid_url(url));
        };

        let mut api_url = format!("{}/repos/{owner}/{repo}/zipball", self.api_base);
        if let Some(reference) = &reference {
            api_url = format!("{api_url}/{reference}");
        }

        let mut request = self
            .client
            .get(&api_url)
            .header(ACCEPT, "application/vnd.github+json");
        if let Some(token) = self.settings.github_token.as_deref() {
            request = request.header(AUTHORIZATION, format!("Bearer {token}"));
        }

        let response = request
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
        info!(owner = %owner, repo = %repo, reference = ?reference, bytes, "zipball fetched");

        Ok(FetchResult {
            provider: self.name().to_string(),
            original_url: url.to_string(),
            resolved_url: api_url,
        })
    }
}

/// Extracts `(owner, repo, ref)` from a repository URL path.
fn parse_repo_url(url: &Url) -> Option<(String, String, Option<String>)> {
    let parts: Vec<&str> = url.path_segments()?.filter(|s| !s.is_empty()).collect();
    if parts.len() < 2 {
        return None;
    }
    let owner = parts[0].to_string();
    let repo = parts[1].strip_suffix(".git").unwrap_or(parts[1]).to_string();
    if owner.is_empty() || repo.is_empty() {
        return None;
    }

    let reference = (parts.len() >= 4 && parts[2] == "tree").then(|| parts[3].to_string());
    Some((owner, repo, reference))
}

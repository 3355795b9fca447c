//! Generic HTTP providers.
//!
//! Two registrations of the same machinery: [`AuthenticatedHttpProvider`]
//! claims any `http(s)` URL when extra headers or basic credentials are
//! configured; [`HttpProvider`] is the unconditional fallback.
//!
//! URLs that do not already point at a known data suffix get a bounded HTML
//! preview; anchor hrefs are scored by suffix priority (`zip > nii.gz > nii
//! > dcm > image`, plus a bonus for `download` in the URL) and the best
//! same-host candidate replaces the original URL.

use std::path::Path;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use reqwest::header::{ACCEPT, HeaderMap, HeaderName, HeaderValue};
use tracing::{debug, instrument, warn};
use url::Url;

use super::error::ProviderError;
use super::stream::{ensure_success, stream_response_to_path};
use super::{FetchResult, IngestProvider};
use crate::config::Settings;

/// Suffixes treated as directly downloadable data (no preview needed).
const KNOWN_DATA_SUFFIXES: &[&str] = &[".zip", ".nii", ".nii.gz", ".dcm", ".png", ".jpeg", ".jpg"];

/// Maximum bytes read from an HTML preview.
const PREVIEW_MAX_BYTES: usize = 512 * 1024;

/// Score bonus for candidate URLs containing `download`.
const DOWNLOAD_BONUS: i64 = 10;

/// Regex pattern for anchor hrefs in previewed HTML.
#[allow(clippy::expect_used)]
static HREF_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)<a\s[^>]*?href\s*=\s*["']([^"']+)["']"#).expect("href regex is valid") // Static pattern, safe to panic
});

/// Credentials applied to authenticated preview and download requests.
#[derive(Debug, Clone, Default)]
struct AuthContext {
    headers: HeaderMap,
    basic: Option<(String, String)>,
}

impl AuthContext {
    fn from_settings(settings: &Settings) -> Self {
        let mut headers = HeaderMap::new();
        if let Some(raw) = settings.http_headers_json.as_deref() {
            match serde_json::from_str::<std::collections::HashMap<String, String>>(raw) {
                Ok(parsed) => {
                    for (key, value) in parsed {
                        let name = HeaderName::try_from(key.as_str());
                        let value = HeaderValue::try_from(value.as_str());
                        match (name, value) {
                            (Ok(name), Ok(value)) => {
                                headers.insert(name, value);
                            }
                            _ => warn!(header = %key, "skipping invalid configured header"),
                        }
                    }
                }
                Err(error) => warn!(error = %error, "http_headers_json is not a JSON object, ignoring"),
            }
        }

        let basic = match (
            settings.http_basic_user.clone(),
            settings.http_basic_pass.clone(),
        ) {
            (Some(user), Some(pass)) => Some((user, pass)),
            _ => None,
        };

        Self { headers, basic }
    }

    fn is_empty(&self) -> bool {
        self.headers.is_empty() && self.basic.is_none()
    }

    fn apply(&self, mut request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if !self.headers.is_empty() {
            request = request.headers(self.headers.clone());
        }
        if let Some((user, pass)) = &self.basic {
            request = request.basic_auth(user, Some(pass));
        }
        request
    }
}

/// Plain HTTP provider; unconditional fallback for `http(s)` URLs.
pub struct HttpProvider {
    settings: Arc<Settings>,
    client: Client,
}

impl HttpProvider {
    /// Creates the provider with shared settings and HTTP client.
    #[must_use]
    pub fn new(settings: Arc<Settings>, client: Client) -> Self {
        Self { settings, client }
    }
}

#[async_trait]
impl IngestProvider for HttpProvider {
    fn name(&self) -> &'static str {
        "http"
    }

    fn can_handle(&self, url: &str) -> bool {
        is_http_url(url)
    }

    #[instrument(skip(self, out_path), fields(url = %url))]
    async fn fetch(&self, url: &str, out_path: &Path) -> Result<FetchResult, ProviderError> {
        let auth = AuthContext::default();
        let resolved = resolve_dataset_url(&self.client, &self.settings, url, &auth).await;
        download(&self.client, &self.settings, &resolved, out_path, &auth).await?;
        Ok(FetchResult {
            provider: self.name().to_string(),
            original_url: url.to_string(),
            resolved_url: resolved,
        })
    }
}

/// Authenticated HTTP provider; claims `http(s)` URLs when credentials or
/// extra headers are configured.
pub struct AuthenticatedHttpProvider {
    settings: Arc<Settings>,
    client: Client,
}

impl AuthenticatedHttpProvider {
    /// Creates the provider with shared settings and HTTP client.
    #[must_use]
    pub fn new(settings: Arc<Settings>, client: Client) -> Self {
        Self { settings, client }
    }
}

#[async_trait]
impl IngestProvider for AuthenticatedHttpProvider {
    fn name(&self) -> &'static str {
        "auth_http"
    }

    fn can_handle(&self, url: &str) -> bool {
        is_http_url(url) && !AuthContext::from_settings(&self.settings).is_empty()
    }

    #[instrument(skip(self, out_path), fields(url = %url))]
    async fn fetch(&self, url: &str, out_path: &Path) -> Result<FetchResult, ProviderError> {
        let auth = AuthContext::from_settings(&self.settings);
        let resolved = resolve_dataset_url(&self.client, &self.settings, url, &auth).await;
        download(&self.client, &self.settings, &resolved, out_path, &auth).await?;
        Ok(FetchResult {
            provider: self.name().to_string(),
            original_url: url.to_string(),
            resolved_url: resolved,
        })
    }
}

fn is_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

fn has_data_suffix(url: &str) -> bool {
    let lowered = url.to_ascii_lowercase();
    KNOWN_DATA_SUFFIXES
        .iter()
        .any(|suffix| lowered.ends_with(suffix))
}

/// Streams the resolved URL to `out_path` under the download byte cap.
async fn download(
    client: &Client,
    settings: &Settings,
    url: &str,
    out_path: &Path,
    auth: &AuthContext,
) -> Result<u64, ProviderError> {
    let request = auth.apply(client.get(url));
    let response = request
        .send()
        .await
        .map_err(|e| ProviderError::network(url, e))?;
    let response = ensure_success(response, url)?;
    stream_response_to_path(response, out_path, settings.max_download_bytes, url).await
}

/// Resolves a page URL to its best same-host download candidate.
///
/// Returns the original URL when it already names data, when the preview is
/// not HTML, or when no candidate scores positively. Resolution never fails
/// the fetch: any error falls back to the original URL.
async fn resolve_dataset_url(
    client: &Client,
    settings: &Settings,
    url: &str,
    auth: &AuthContext,
) -> String {
    if has_data_suffix(url) {
        return url.to_string();
    }

    let Some(html) = fetch_text_preview(client, settings, url, auth).await else {
        return url.to_string();
    };

    let Ok(base) = Url::parse(url) else {
        return url.to_string();
    };
    let Some(base_host) = base.host_str().map(ToString::to_string) else {
        return url.to_string();
    };

    let mut candidates = Vec::new();
    for capture in HREF_PATTERN.captures_iter(&html) {
        let Some(href) = capture.get(1) else { continue };
        let Ok(absolute) = base.join(href.as_str()) else {
            continue;
        };
        if !matches!(absolute.scheme(), "http" | "https") {
            continue;
        }
        if absolute.host_str() != Some(base_host.as_str()) {
            continue;
        }
        candidates.push(absolute.to_string());
    }

    match pick_best_download_candidate(&candidates) {
        Some(best) => {
            debug!(original = %url, resolved = %best, "download candidate selected");
            best
        }
        None => url.to_string(),
    }
}

/// Fetches up to 512 KiB of the URL and returns it when it looks like HTML.
async fn fetch_text_preview(
    client: &Client,
    settings: &Settings,
    url: &str,
    auth: &AuthContext,
) -> Option<String> {
    use futures_util::StreamExt;

    let request = auth
        .apply(client.get(url))
        .header(ACCEPT, "text/html,application/xhtml+xml")
        .timeout(settings.preview_timeout);
    let response = request.send().await.ok()?;
    if !response.status().is_success() {
        return None;
    }

    let mut blob: Vec<u8> = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.ok()?;
        blob.extend_from_slice(&chunk);
        if blob.len() >= PREVIEW_MAX_BYTES {
            blob.truncate(PREVIEW_MAX_BYTES);
            break;
        }
    }

    if !looks_like_html(&blob) {
        return None;
    }
    Some(String::from_utf8_lossy(&blob).into_owned())
}

fn looks_like_html(blob: &[u8]) -> bool {
    let trimmed = blob
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .map_or(&[] as &[u8], |start| &blob[start..]);
    let head = trimmed[..trimmed.len().min(200)].to_ascii_lowercase();
    if head.windows(5).any(|w| w == b"<html") {
        return true;
    }
    if head.windows(14).any(|w| w == b"<!doctype html") {
        return true;
    }
    let prefix = blob[..blob.len().min(4096)].to_ascii_lowercase();
    prefix.windows(3).any(|w| w == b"<a ")
}

/// Scores a candidate URL by suffix priority plus the download bonus.
fn score_candidate(url: &str) -> i64 {
    let lowered = url.to_ascii_lowercase();
    let mut score = if lowered.ends_with(".zip") {
        100
    } else if lowered.ends_with(".nii.gz") {
        90
    } else if lowered.ends_with(".nii") {
        85
    } else if lowered.ends_with(".dcm") {
        80
    } else if lowered.ends_with(".png") || lowered.ends_with(".jpeg") || lowered.ends_with(".jpg") {
        70
    } else {
        0
    };
    if lowered.contains("download") {
        score += DOWNLOAD_BONUS;
    }
    score
}

/// Picks the highest-scoring candidate, breaking ties on the shortest URL
/// and then on discovery order (earliest href wins). max_by_key keeps the
/// last maximum, so the candidates are walked back-to-front.
fn pick_best_download_candidate(urls: &[String]) -> Option<String> {
    let best = urls
        .iter()
        .rev()
        .max_by_key(|url| (score_candidate(url), std::cmp::Reverse(url.len())))?;
    (score_candidate(best) > 0).then(|| best.clone())
}

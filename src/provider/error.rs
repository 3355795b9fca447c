//! Error types for provider fetches.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while materialising a dataset URL.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The provided URL is malformed or invalid.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },

    /// No registered provider claimed the URL.
    #[error("no provider found for URL: {url}")]
    NoProviderMatches {
        /// The unmatched URL.
        url: String,
    },

    /// Network-level error (DNS resolution, connection refused, TLS errors, etc.)
    #[error("network error fetching {url}: {source}")]
    Network {
        /// The URL that failed to download.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// Request timed out before completion.
    #[error("timeout fetching {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// HTTP error response (4xx client errors, 5xx server errors).
    #[error("HTTP {status} fetching {url}")]
    HttpStatus {
        /// The URL that returned an error status.
        url: String,
        /// The HTTP status code.
        status: u16,
    },

    /// Cumulative downloaded bytes exceeded the configured cap.
    #[error("Download too large: exceeded {limit_bytes} bytes")]
    DownloadTooLarge {
        /// The configured cap.
        limit_bytes: u64,
    },

    /// File system error while writing the download.
    #[error("IO error writing to {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The provider needs credentials that are not configured.
    #[error("{provider} provider requires credentials: {hint}")]
    MissingCredentials {
        /// Provider name.
        provider: &'static str,
        /// Which settings are missing.
        hint: &'static str,
    },
}

impl ProviderError {
    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Creates a no-provider-matches error.
    pub fn no_provider_matches(url: impl Into<String>) -> Self {
        Self::NoProviderMatches { url: url.into() }
    }

    /// Creates a network error from a reqwest error, promoting timeouts.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        let url = url.into();
        if source.is_timeout() {
            Self::Timeout { url }
        } else {
            Self::Network { url, source }
        }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
        }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

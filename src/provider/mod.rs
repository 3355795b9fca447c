//! Fetch strategy registry for dataset URLs.
//!
//! This module provides an extensible provider system that materialises a
//! dataset URL onto local storage through a priority-ordered registry where
//! the first provider whose `can_handle` returns true wins.
//!
//! # Architecture
//!
//! - [`IngestProvider`] - Async trait that individual providers implement
//! - [`ProviderRegistry`] - Ordered collection of providers with first-match fetch
//! - [`FetchResult`] - Provider name plus original/resolved URLs
//! - [`ArchiveHostProvider`] - Archive-hosting dataset pages (Kaggle-style)
//! - [`SourceRepoProvider`] - Source repository zipballs (GitHub-style)
//! - [`AuthenticatedHttpProvider`] - Any `http(s)` URL with configured credentials
//! - [`HttpProvider`] - Any `http(s)` URL, with HTML download-candidate scoring
//!
//! # Example
//!
//! ```no_run
//! use datascan_core::config::Settings;
//! use datascan_core::provider::build_default_provider_registry;
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = Arc::new(Settings::from_env());
//! let registry = build_default_provider_registry(&settings);
//! let fetch = registry
//!     .fetch("https://example.com/tiny.zip", Path::new("/tmp/download.bin"))
//!     .await?;
//! println!("fetched via {}", fetch.provider);
//! # Ok(())
//! # }
//! ```

mod error;
mod github;
mod http;
mod kaggle;
mod stream;

pub use error::ProviderError;
pub use github::SourceRepoProvider;
pub use http::{AuthenticatedHttpProvider, HttpProvider};
pub use kaggle::ArchiveHostProvider;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::config::Settings;

/// A successfully materialised download.
#[derive(Debug, Clone)]
pub struct FetchResult {
    /// Name of the provider that handled the fetch.
    pub provider: String,
    /// URL the fetch was requested with.
    pub original_url: String,
    /// URL that was actually downloaded.
    pub resolved_url: String,
}

/// Trait that all ingest providers must implement.
///
/// Providers stream a dataset URL to a local path, applying the configured
/// download byte cap.
///
/// # Object Safety
///
/// This trait uses `async_trait` to support dynamic dispatch via
/// `Box<dyn IngestProvider>`. Rust 2024 native async traits are not
/// object-safe, so `async_trait` is required for the registry pattern.
#[async_trait]
pub trait IngestProvider: Send + Sync {
    /// Returns the provider's name (e.g., "kaggle", "github", "http").
    fn name(&self) -> &'static str;

    /// Returns true if this provider can handle the given URL.
    fn can_handle(&self, url: &str) -> bool;

    /// Streams the URL to `out_path`.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] on invalid URLs, network or HTTP failures,
    /// byte-cap violations, and local IO failures.
    async fn fetch(&self, url: &str, out_path: &Path) -> Result<FetchResult, ProviderError>;
}

/// Ordered collection of providers; first match wins.
pub struct ProviderRegistry {
    providers: Vec<Box<dyn IngestProvider>>,
}

impl ProviderRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            providers: Vec::new(),
        }
    }

    /// Appends a provider; registration order is match order.
    pub fn register(&mut self, provider: Box<dyn IngestProvider>) {
        self.providers.push(provider);
    }

    /// Returns the first provider that can handle the URL.
    #[must_use]
    pub fn select(&self, url: &str) -> Option<&dyn IngestProvider> {
        self.providers
            .iter()
            .map(AsRef::as_ref)
            .find(|provider| provider.can_handle(url))
    }

    /// Fetches the URL via the first matching provider.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::NoProviderMatches`] when nothing claims the
    /// URL, otherwise whatever the selected provider returns.
    pub async fn fetch(&self, url: &str, out_path: &Path) -> Result<FetchResult, ProviderError> {
        let Some(provider) = self.select(url) else {
            return Err(ProviderError::no_provider_matches(url));
        };
        debug!(provider = provider.name(), url = %url, "provider selected");
        provider.fetch(url, out_path).await
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds the default provider registry used by pipeline execution flows.
///
/// Order is deterministic and preserves site-specific priority before the
/// generic HTTP fallbacks.
#[must_use]
pub fn build_default_provider_registry(settings: &Arc<Settings>) -> ProviderRegistry {
    let client = stream::build_fetch_client(settings.fetch_timeout);

    let mut registry = ProviderRegistry::new();
    registry.register(Box::new(ArchiveHostProvider::new(
        Arc::clone(settings),
        client.clone(),
    )));
    registry.register(Box::new(SourceRepoProvider::new(
        Arc::clone(settings),
        client.clone(),
    )));
    registry.register(Box::new(AuthenticatedHttpProvider::new(
        Arc::clone(settings),
        client.clone(),
    )));
    registry.register(Box::new(HttpProvider::new(Arc::clone(settings), client)));
    registry
}

//! Catalog collections for datasets and analysed files.
//!
//! The store models two collections on SQLite:
//! - `datasets` - one row per ingested dataset, keyed by the external
//!   `dataset_id`, carrying status, stage, resolution metadata, and the
//!   aggregated summary (JSON).
//! - `files` - one row per analysed file, keyed by `(dataset_id, relpath)`,
//!   carrying the typed descriptor produced by the analyzer.
//!
//! # Overview
//!
//! - [`Catalog`] - Main interface for catalog operations
//! - [`DatasetRecord`] / [`FileRecord`] - Persisted rows
//! - [`DatasetStatus`] / [`Stage`] / [`FileKind`] - Lifecycle states
//! - [`FileMeta`] - Per-kind descriptor metadata (tagged, closed set)
//! - [`StoreError`] - Operation error types
//!
//! Uniqueness indexes are created best-effort at startup by
//! [`ensure_catalog_indexes`]; when the composite index on
//! `files(dataset_id, relpath)` cannot be made unique (pre-existing
//! duplicates) the catalog relies on upsert semantics instead.

mod catalog;
mod indexes;
mod record;

pub use catalog::{BulkUpsertOutcome, Catalog, RecoveryCandidate};
pub use indexes::{IndexOutcome, ensure_catalog_indexes};
pub use record::{
    DatasetRecord, DatasetStatus, DatasetSummary, FileKind, FileMeta, FileRecord, ModalityModel,
    ModalityModelDetails, ModalityShare, NewDataset, Stage,
};

use thiserror::Error;

/// Result type for catalog operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors raised by catalog operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying database failure.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// No dataset row exists for the given id.
    #[error("dataset not found: {0}")]
    DatasetNotFound(String),

    /// A JSON payload column could not be decoded.
    #[error("corrupt {column} payload for {key}: {source}")]
    Payload {
        /// Column holding the payload.
        column: &'static str,
        /// Row key the payload belongs to.
        key: String,
        /// Decoding failure.
        #[source]
        source: serde_json::Error,
    },
}

//! Best-effort uniqueness index initialisation for the catalog.
//!
//! `files(dataset_id, relpath)` speeds listing and enables idempotent
//! upserts. We *try* to make it unique, but if old data contains duplicates
//! SQLite will reject it; the catalog then falls back to a non-unique index
//! and relies on upsert semantics instead.

use tracing::{debug, instrument, warn};

use crate::db::Database;

/// Which uniqueness guarantees were actually established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexOutcome {
    /// Unique index on `datasets(dataset_id)` exists.
    pub datasets_unique: bool,
    /// Unique index on `files(dataset_id, relpath)` exists.
    pub files_unique: bool,
}

/// Ensures catalog indexes, degrading to non-unique variants when
/// pre-existing duplicates block uniqueness. Never fails startup.
#[instrument(skip(db))]
pub async fn ensure_catalog_indexes(db: &Database) -> IndexOutcome {
    let datasets_unique = create_index(
        db,
        "CREATE UNIQUE INDEX IF NOT EXISTS uniq_datasets_dataset_id ON datasets(dataset_id)",
        "datasets(dataset_id)",
    )
    .await;
    if !datasets_unique {
        create_index(
            db,
            "CREATE INDEX IF NOT EXISTS idx_datasets_dataset_id ON datasets(dataset_id)",
            "datasets(dataset_id) non-unique fallback",
        )
        .await;
    }

    let files_unique = create_index(
        db,
        "CREATE UNIQUE INDEX IF NOT EXISTS uniq_files_dataset_relpath \
         ON files(dataset_id, relpath)",
        "files(dataset_id, relpath)",
    )
    .await;
    if !files_unique {
        create_index(
            db,
            "CREATE INDEX IF NOT EXISTS idx_files_dataset_relpath ON files(dataset_id, relpath)",
            "files(dataset_id, relpath) non-unique fallback",
        )
        .await;
    }

    IndexOutcome {
        datasets_unique,
        files_unique,
    }
}

async fn create_index(db: &Database, sql: &str, label: &str) -> bool {
    match sqlx::query(sql).execute(db.pool()).await {
        Ok(_) => {
            debug!(index = label, "index ensured");
            true
        }
        Err(error) => {
            warn!(index = label, error = %error, "could not create index");
            false
        }
    }
}

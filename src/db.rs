//! SQLite-backed storage handle for the catalog collections.
//!
//! A thin wrapper owning the connection pool. Opening a database also puts
//! it into the shape the pipeline expects: WAL journaling (readers stay
//! unblocked while the batch writer flushes), a busy timeout instead of
//! immediate `SQLITE_BUSY` failures, and the migration set under
//! `migrations/` applied up front.
//!
//! ```no_run
//! use datascan_core::Database;
//! use std::path::Path;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::open(Path::new("catalog.db")).await?;
//! let (datasets,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM datasets")
//!     .fetch_one(db.pool())
//!     .await?;
//! println!("{datasets} datasets catalogued");
//! # Ok(())
//! # }
//! ```

use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use tracing::{debug, instrument};

/// Pool size for file-backed databases. SQLite serialises writers anyway,
/// so a handful of connections covers the single-writer pipeline plus
/// readers.
const FILE_POOL_SIZE: u32 = 4;

/// How long a connection waits on a locked database before reporting
/// `SQLITE_BUSY`.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors opening or migrating the database.
#[derive(Debug, Error)]
pub enum DbError {
    /// The pool could not be established or a pragma failed.
    #[error("could not open database: {0}")]
    Open(#[from] sqlx::Error),

    /// The schema migrations could not be applied.
    #[error("schema migration failed: {0}")]
    Schema(#[from] sqlx::migrate::MigrateError),
}

/// Handle to the catalog database.
///
/// Cloning shares the pool; drop order does not matter. Call
/// [`close`](Self::close) once at shutdown for a clean WAL checkpoint.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Opens the database file at `path`, creating it if absent, and brings
    /// the schema up to date.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Open`] when the pool or pragmas fail, and
    /// [`DbError::Schema`] when a migration cannot be applied.
    #[instrument(skip(path), fields(path = %path.display()))]
    pub async fn open(path: &Path) -> Result<Self, DbError> {
        let url = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(FILE_POOL_SIZE)
            .connect(&url)
            .await?;

        // WAL only makes sense for file-backed databases.
        sqlx::query("PRAGMA journal_mode=WAL").execute(&pool).await?;
        sqlx::query(&format!(
            "PRAGMA busy_timeout={}",
            BUSY_TIMEOUT.as_millis()
        ))
        .execute(&pool)
        .await?;

        let db = Self { pool };
        db.migrate().await?;
        debug!("catalog database ready");
        Ok(db)
    }

    /// Opens a throwaway in-memory database for tests.
    ///
    /// Restricted to a single connection: the database lives inside the
    /// connection, so a wider pool would see independent empty copies.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Open`] or [`DbError::Schema`] as for
    /// [`open`](Self::open).
    #[instrument]
    pub async fn in_memory() -> Result<Self, DbError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }

    /// The shared connection pool, for executing queries.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Reports the active journal mode (`wal` for file-backed databases,
    /// `memory` for in-memory ones).
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Open`] if the pragma query fails.
    pub async fn journal_mode(&self) -> Result<String, DbError> {
        let (mode,): (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&self.pool)
            .await?;
        Ok(mode.to_lowercase())
    }

    /// Closes every pooled connection. The handle (and its clones) must not
    /// be used afterwards.
    #[instrument(skip(self))]
    pub async fn close(self) {
        self.pool.close().await;
    }
}

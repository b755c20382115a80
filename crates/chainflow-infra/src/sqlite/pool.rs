//! Database pool with split reader/writer connections in WAL mode.
//!
//! SQLite allows only one writer at a time. This module provides a `DatabasePool`
//! with a multi-connection reader pool for concurrent reads and a single-connection
//! writer pool for serialized writes. Both use WAL journal mode and enforce foreign keys.

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

/// Reader pool connection count used by [`DatabasePool::new`].
const READER_POOL_SIZE: u32 = 8;

/// How long a connection waits on a locked database before erroring.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Split read/write pool for SQLite with WAL mode.
///
/// - `reader`: Multi-connection pool for concurrent SELECT queries.
/// - `writer`: Single-connection pool for serialized INSERT/UPDATE/DELETE.
#[derive(Clone)]
pub struct DatabasePool {
    pub reader: SqlitePool,
    pub writer: SqlitePool,
}

impl DatabasePool {
    /// Open reader and writer pools with the default reader size.
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        Self::with_reader_pool_size(database_url, READER_POOL_SIZE).await
    }

    /// Open reader and writer pools with an explicit reader size.
    ///
    /// The writer pool is opened first and migrations run on it, so the
    /// read-only reader connections never see a missing schema. Both pools
    /// use WAL journal mode, enforce foreign keys, and wait out short lock
    /// contention via the busy timeout.
    pub async fn with_reader_pool_size(
        database_url: &str,
        readers: u32,
    ) -> Result<Self, sqlx::Error> {
        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_options(database_url)?)
            .await?;
        sqlx::migrate!("../../migrations").run(&writer).await?;

        let reader = SqlitePoolOptions::new()
            .max_connections(readers)
            .connect_with(connect_options(database_url)?.read_only(true))
            .await?;

        tracing::debug!(url = %database_url, readers, "database pool ready");
        Ok(Self { reader, writer })
    }
}

fn connect_options(database_url: &str) -> Result<SqliteConnectOptions, sqlx::Error> {
    Ok(SqliteConnectOptions::from_str(database_url)?
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(BUSY_TIMEOUT)
        .create_if_missing(true))
}

/// Returns the default database URL based on `CHAINFLOW_DATA_DIR` env var,
/// falling back to `~/.chainflow/chainflow.db`.
pub fn default_database_url() -> String {
    let data_dir = std::env::var("CHAINFLOW_DATA_DIR").unwrap_or_else(|_| {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        format!("{home}/.chainflow")
    });
    format!("sqlite://{data_dir}/chainflow.db")
}

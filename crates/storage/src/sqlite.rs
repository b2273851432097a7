//! SQLite database handles.
//!
//! One writable connection per node (the executor serializes all writes
//! through it) and a pool of read-only connections for the gateway. WAL
//! journaling gives readers a consistent snapshot while a block transaction
//! is open on the writer.
//!
//! Pragmas in use: `journal_mode=WAL` (reader/writer isolation),
//! `synchronous=NORMAL` (durability at WAL checkpoint granularity),
//! `busy_timeout` (writer never fails fast on a reader checkpoint),
//! `foreign_keys=OFF` (user DDL may not declare cross-table references).

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::SqlitePool;

use tabledger_core::{Error, Result};

use crate::schema;

/// Configuration for the local database
#[derive(Debug, Clone)]
pub struct SqliteConfig {
    /// Path to the database file
    pub path: String,

    /// Size of the read pool; the write pool is always 1
    pub max_read_connections: u32,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self { path: "database.db".to_string(), max_read_connections: 8 }
    }
}

/// Paired writer/reader handles over one SQLite database
#[derive(Debug, Clone)]
pub struct SqliteDb {
    writer: SqlitePool,
    reader: SqlitePool,
}

impl SqliteDb {
    /// Open (or create) the database at the configured path and apply the
    /// system schema.
    pub async fn open(config: SqliteConfig) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(&config.path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(false);

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options.clone())
            .await
            .map_err(|e| Error::storage(format!("failed to open writer: {e}")))?;

        let reader = SqlitePoolOptions::new()
            .max_connections(config.max_read_connections)
            .connect_with(options.read_only(true))
            .await
            .map_err(|e| Error::storage(format!("failed to open readers: {e}")))?;

        schema::migrate(&writer).await?;
        Ok(Self { writer, reader })
    }

    /// Open an in-memory database. Writer and reader share the single
    /// connection; used by tests.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| Error::storage(format!("bad sqlite options: {e}")))?
            .foreign_keys(false);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| Error::storage(format!("failed to open in-memory db: {e}")))?;

        schema::migrate(&pool).await?;
        Ok(Self { writer: pool.clone(), reader: pool })
    }

    /// The single-writer pool owned by the executor
    pub fn writer(&self) -> &SqlitePool {
        &self.writer
    }

    /// The read-only pool used by the gateway and the state hasher
    pub fn reader(&self) -> &SqlitePool {
        &self.reader
    }
}

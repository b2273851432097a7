//! Read-only gateway store.
//!
//! Executes validated read statements against committed state and serves
//! registry metadata and transaction receipts. Reads go through the
//! read-only pool, so an open block transaction on the writer is never
//! observable: a read started before a commit sees the pre-commit
//! snapshot, one started after sees the post-commit snapshot.

use std::sync::Arc;

use sqlx::{Row, SqlitePool};

use tabledger_core::parser::SqlParser;
use tabledger_core::types::{Column, Receipt, TableData};
use tabledger_core::{Error, Result};

use crate::receipts;
use crate::registry::{entry_from_row, TableEntry};
use crate::rows;

/// Multi-reader access to committed table state
#[derive(Clone)]
pub struct GatewayStore {
    reader: SqlitePool,
    parser: Arc<dyn SqlParser>,
}

impl GatewayStore {
    pub fn new(reader: SqlitePool, parser: Arc<dyn SqlParser>) -> Self {
        Self { reader, parser }
    }

    /// Validate and run a read statement against committed state
    pub async fn run_read(&self, stmt: &str) -> Result<TableData> {
        let read = self.parser.validate_read(stmt)?;

        let result = sqlx::query(&read.statement).fetch_all(&self.reader).await;
        let result_rows = match result {
            Ok(result_rows) => result_rows,
            // A validated statement can still be rejected by the engine,
            // e.g. when it names a table that was never created.
            Err(sqlx::Error::Database(e)) => {
                return Err(Error::validation(e.message().to_string()))
            }
            Err(e) => return Err(Error::storage(format!("read failed: {e}"))),
        };

        let mut data = rows::table_data(&result_rows)?;
        if data.rows.is_empty() {
            // An empty result set still names its columns.
            data.columns = self.describe_columns(&read.statement).await?;
        }
        Ok(data)
    }

    async fn describe_columns(&self, statement: &str) -> Result<Vec<Column>> {
        let describe = sqlx::Executor::describe(&self.reader, statement)
            .await
            .map_err(|e| Error::validation(format!("describe failed: {e}")))?;
        Ok(describe
            .columns()
            .iter()
            .map(|c| Column { name: sqlx::Column::name(c).to_string() })
            .collect())
    }

    /// Fetch the registry entry for a table
    pub async fn get_table(&self, chain_id: u64, table_id: u64) -> Result<TableEntry> {
        let row = sqlx::query(
            "SELECT chain_id, id, prefix, controller, structure, created_at
             FROM registry WHERE chain_id = ?1 AND id = ?2",
        )
        .bind(chain_id as i64)
        .bind(table_id as i64)
        .fetch_optional(&self.reader)
        .await
        .map_err(|e| Error::storage(format!("registry lookup failed: {e}")))?;

        row.as_ref()
            .map(entry_from_row)
            .ok_or_else(|| Error::not_found(format!("table {chain_id}/{table_id} not found")))
    }

    /// Fetch a transaction receipt, `None` when the transaction has not
    /// been processed (yet)
    pub async fn get_receipt(&self, chain_id: u64, txn_hash: &str) -> Result<Option<Receipt>> {
        receipts::get_receipt(&self.reader, chain_id, txn_hash).await
    }

    /// The last fully committed block for a chain
    pub async fn cursor(&self, chain_id: u64) -> Result<Option<u64>> {
        crate::registry::cursor(&self.reader, chain_id).await
    }

    /// The stored DDL of a physical table, as kept by the SQL engine
    pub async fn table_ddl(&self, name: &str) -> Result<String> {
        let row = sqlx::query("SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?1")
            .bind(name)
            .fetch_optional(&self.reader)
            .await
            .map_err(|e| Error::storage(format!("ddl lookup failed: {e}")))?;
        row.map(|r| r.get::<String, _>("sql"))
            .ok_or_else(|| Error::not_found(format!("table {name} not found")))
    }

    /// The parser shared with the executor, used to derive column schemas
    pub fn parser(&self) -> &Arc<dyn SqlParser> {
        &self.parser
    }

    /// The underlying read pool, shared with the state hasher
    pub fn reader_pool(&self) -> &SqlitePool {
        &self.reader
    }
}

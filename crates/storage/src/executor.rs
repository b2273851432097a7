//! The block-scoped executor.
//!
//! A `BlockScope` is one serializable write transaction on the single
//! writer connection. Per-transaction failure isolation uses a savepoint
//! inside the block transaction, never a sibling transaction: a block is
//! either fully applied (all transactions, all receipts, cursor bumped) or
//! not applied at all.

use std::sync::Arc;

use sqlx::sqlite::SqliteConnection;
use sqlx::{Row, Sqlite, Transaction};
use tracing::{debug, warn};

use tabledger_core::parser::{SqlParser, WriteKind, WriteStmts};
use tabledger_core::types::{
    normalize_address, Privileges, Receipt, TableEvent, TableIdent, TxnEvents, TxnExecResult,
    PRIV_DELETE, PRIV_INSERT, PRIV_UPDATE,
};
use tabledger_core::{Error, Result};

use crate::receipts;
use crate::registry::{self, TableEntry};
use crate::sqlite::SqliteDb;

/// Single-writer executor for one node; one open `BlockScope` per chain at
/// a time.
pub struct Executor {
    db: SqliteDb,
    parser: Arc<dyn SqlParser>,
    max_row_count: u64,
}

/// An open per-block write transaction plus its in-block state
pub struct BlockScope {
    tx: Transaction<'static, Sqlite>,
    chain_id: u64,
    block_number: u64,

    /// Block timestamp, used for deterministic `created_at`/`updated_at`
    timestamp: u64,

    /// Index of the next transaction receipt within the block
    next_index: u64,
}

impl std::fmt::Debug for BlockScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockScope")
            .field("chain_id", &self.chain_id)
            .field("block_number", &self.block_number)
            .field("timestamp", &self.timestamp)
            .field("next_index", &self.next_index)
            .finish()
    }
}

impl BlockScope {
    pub fn block_number(&self) -> u64 {
        self.block_number
    }
}

impl Executor {
    pub fn new(db: SqliteDb, parser: Arc<dyn SqlParser>, max_row_count: u64) -> Self {
        Self { db, parser, max_row_count }
    }

    /// Begin the transaction for `block_number` and verify it is exactly
    /// `cursor + 1`. A mismatch is fatal: skipping blocks silently would
    /// fork this node's state.
    pub async fn open_block_scope(
        &self,
        chain_id: u64,
        block_number: u64,
        timestamp: u64,
    ) -> Result<BlockScope> {
        let mut tx = self
            .db
            .writer()
            .begin()
            .await
            .map_err(|e| Error::storage(format!("failed to begin block transaction: {e}")))?;

        if let Some(cursor) = registry::get_cursor(&mut tx, chain_id).await? {
            if block_number != cursor + 1 {
                return Err(Error::OutOfOrder { expected: cursor + 1, got: block_number });
            }
        }

        Ok(BlockScope { tx, chain_id, block_number, timestamp, next_index: 0 })
    }

    /// Apply one transaction's events in log order inside a savepoint.
    ///
    /// The first user-attributable failure rolls the transaction back to
    /// its savepoint and is recorded in the receipt; the block proceeds.
    /// Infrastructure failures abort the whole scope.
    pub async fn execute_txn_events(
        &self,
        scope: &mut BlockScope,
        txn: &TxnEvents,
    ) -> Result<TxnExecResult> {
        if txn.events.is_empty() {
            return Ok(TxnExecResult {
                error: None,
                error_event_idx: None,
                affected_tables: Vec::new(),
            });
        }

        exec_system(&mut scope.tx, "SAVEPOINT txn_scope").await?;

        let mut affected: Vec<u64> = Vec::new();
        let mut failure: Option<(u64, String)> = None;

        for (index, decoded) in txn.events.iter().enumerate() {
            let table_id = decoded.event.table_id();
            if !affected.contains(&table_id) {
                affected.push(table_id);
            }

            match self
                .apply_event(&mut scope.tx, scope.chain_id, scope.timestamp, &decoded.event)
                .await
            {
                Ok(()) => {}
                Err(e) if e.is_user_fault() => {
                    warn!(
                        chain_id = scope.chain_id,
                        txn = %txn.txn_hash,
                        event = index,
                        error = %e,
                        "event failed, rolling back transaction"
                    );
                    failure = Some((index as u64, e.to_string()));
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        if failure.is_some() {
            exec_system(&mut scope.tx, "ROLLBACK TO SAVEPOINT txn_scope").await?;
        }
        exec_system(&mut scope.tx, "RELEASE SAVEPOINT txn_scope").await?;

        let (error, error_event_idx) = match &failure {
            Some((index, message)) => (Some(message.clone()), Some(*index)),
            None => (None, None),
        };

        let receipt = Receipt {
            chain_id: scope.chain_id,
            block_number: scope.block_number,
            index_in_block: scope.next_index,
            txn_hash: txn.txn_hash.clone(),
            table_id: affected.first().copied(),
            table_ids: affected.clone(),
            error: error.clone(),
            error_event_idx,
        };
        receipts::insert_receipt(&mut scope.tx, &receipt).await?;
        scope.next_index += 1;

        Ok(TxnExecResult { error, error_event_idx, affected_tables: affected })
    }

    /// Whether a receipt for this transaction already exists (dedup)
    pub async fn txn_receipt_exists(
        &self,
        scope: &mut BlockScope,
        txn_hash: &str,
    ) -> Result<bool> {
        receipts::receipt_exists(&mut scope.tx, scope.chain_id, txn_hash).await
    }

    /// Write the cursor row for this block and commit the outer
    /// transaction; atomic with every effect of the block.
    pub async fn commit(&self, mut scope: BlockScope) -> Result<()> {
        registry::set_cursor(&mut scope.tx, scope.chain_id, scope.block_number).await?;
        scope
            .tx
            .commit()
            .await
            .map_err(|e| Error::storage(format!("block commit failed: {e}")))?;
        debug!(chain_id = scope.chain_id, block = scope.block_number, "block committed");
        Ok(())
    }

    /// Roll back an uncommitted scope; always safe to call.
    pub async fn close(&self, scope: BlockScope) -> Result<()> {
        scope
            .tx
            .rollback()
            .await
            .map_err(|e| Error::storage(format!("block rollback failed: {e}")))
    }

    async fn apply_event(
        &self,
        conn: &mut SqliteConnection,
        chain_id: u64,
        timestamp: u64,
        event: &TableEvent,
    ) -> Result<()> {
        match event {
            TableEvent::CreateTable { owner, table_id, statement } => {
                self.apply_create(conn, chain_id, timestamp, owner, *table_id, statement)
                    .await
            }
            TableEvent::RunSql { caller, table_id, statement, .. } => {
                self.apply_run_sql(conn, chain_id, timestamp, caller, *table_id, statement)
                    .await
            }
            TableEvent::SetController { caller, table_id, controller } => {
                self.apply_set_controller(conn, chain_id, timestamp, caller, *table_id, controller)
                    .await
            }
            TableEvent::TransferTable { from, to, table_id } => {
                self.apply_transfer(conn, chain_id, timestamp, from, to, *table_id).await
            }
        }
    }

    async fn apply_create(
        &self,
        conn: &mut SqliteConnection,
        chain_id: u64,
        timestamp: u64,
        owner: &str,
        table_id: u64,
        statement: &str,
    ) -> Result<()> {
        let owner = normalize_address(owner)?;
        let create = self.parser.normalize_create(chain_id, statement)?;

        if registry::get_table(&mut *conn, chain_id, table_id).await?.is_some() {
            return Err(Error::constraint(format!("table {table_id} already exists")));
        }

        exec_user_sql(&mut *conn, &create.physical_ddl(table_id)).await?;

        registry::insert_table(
            &mut *conn,
            &TableEntry {
                chain_id,
                id: table_id,
                prefix: create.prefix.clone(),
                controller: owner.clone(),
                structure: create.structure_hash.clone(),
                created_at: timestamp,
            },
        )
        .await?;

        // The owner's full grant is materialized so later self-revokes have
        // their documented effect.
        registry::grant(&mut *conn, chain_id, table_id, &owner, Privileges::all(), timestamp)
            .await
    }

    async fn apply_run_sql(
        &self,
        conn: &mut SqliteConnection,
        chain_id: u64,
        timestamp: u64,
        caller: &str,
        table_id: u64,
        statement: &str,
    ) -> Result<()> {
        let caller = normalize_address(caller)?;
        let batch = self.parser.validate_write_stmts(chain_id, statement)?;

        let (table, stmts) = match batch {
            WriteStmts::Mutations { table, stmts } => (table, stmts),
            WriteStmts::Create(_) => {
                return Err(Error::validation(
                    "tables are created by minting, not by RunSQL",
                ))
            }
        };

        if table.table_id != table_id {
            return Err(Error::validation(format!(
                "statement targets table {} but the event targets {table_id}",
                table.table_id
            )));
        }

        let entry = registry::get_table(&mut *conn, chain_id, table_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("table {table_id} does not exist")))?;
        if entry.prefix != table.prefix {
            return Err(Error::validation(format!(
                "statement names table {} but table {table_id} is {}",
                table,
                entry.ident()
            )));
        }

        for stmt in &stmts {
            match &stmt.kind {
                WriteKind::Grant { grantee, privileges } => {
                    require_controller(&entry, &caller, "grant")?;
                    registry::grant(&mut *conn, chain_id, table_id, grantee, *privileges, timestamp)
                        .await?;
                }
                WriteKind::Revoke { grantee, privileges } => {
                    require_controller(&entry, &caller, "revoke")?;
                    registry::revoke(
                        &mut *conn, chain_id, table_id, grantee, *privileges, timestamp,
                    )
                    .await?;
                }
                WriteKind::Insert | WriteKind::Update | WriteKind::Delete => {
                    let needed = match &stmt.kind {
                        WriteKind::Insert => Privileges(PRIV_INSERT),
                        WriteKind::Update => Privileges(PRIV_UPDATE),
                        _ => Privileges(PRIV_DELETE),
                    };
                    let held =
                        registry::privileges_for(&mut *conn, chain_id, table_id, &caller).await?;
                    if !held.contains(needed) {
                        return Err(Error::acl(format!(
                            "{caller} lacks {needed} on table {table_id}"
                        )));
                    }

                    exec_user_sql(&mut *conn, &stmt.statement).await?;

                    if stmt.kind == WriteKind::Insert {
                        self.check_row_cap(&mut *conn, &entry.ident()).await?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn apply_set_controller(
        &self,
        conn: &mut SqliteConnection,
        chain_id: u64,
        timestamp: u64,
        caller: &str,
        table_id: u64,
        controller: &str,
    ) -> Result<()> {
        let caller = normalize_address(caller)?;
        let controller = normalize_address(controller)?;

        let entry = registry::get_table(&mut *conn, chain_id, table_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("table {table_id} does not exist")))?;
        require_controller(&entry, &caller, "set the controller of")?;

        registry::set_controller(&mut *conn, chain_id, table_id, &controller).await?;
        registry::revoke(
            &mut *conn, chain_id, table_id, &entry.controller, Privileges::all(), timestamp,
        )
        .await?;
        registry::grant(&mut *conn, chain_id, table_id, &controller, Privileges::all(), timestamp)
            .await
    }

    async fn apply_transfer(
        &self,
        conn: &mut SqliteConnection,
        chain_id: u64,
        timestamp: u64,
        from: &str,
        to: &str,
        table_id: u64,
    ) -> Result<()> {
        let from = normalize_address(from)?;
        let to = normalize_address(to)?;

        let entry = registry::get_table(&mut *conn, chain_id, table_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("table {table_id} does not exist")))?;
        if entry.controller != from {
            // The chain is authoritative for token ownership; apply anyway.
            warn!(
                chain_id,
                table_id,
                registered = %entry.controller,
                transferred_from = %from,
                "transfer sender differs from registered controller"
            );
        }

        registry::set_controller(&mut *conn, chain_id, table_id, &to).await?;
        registry::clear_acl(&mut *conn, chain_id, table_id).await?;
        registry::grant(&mut *conn, chain_id, table_id, &to, Privileges::all(), timestamp).await
    }

    /// Fail the event if an insert pushed the table over the row cap
    async fn check_row_cap(
        &self,
        conn: &mut SqliteConnection,
        table: &TableIdent,
    ) -> Result<u64> {
        let row = sqlx::query(&format!("SELECT COUNT(*) AS n FROM {table}"))
            .fetch_one(conn)
            .await
            .map_err(|e| Error::storage(format!("row count failed: {e}")))?;
        let count = row.get::<i64, _>("n") as u64;
        if count > self.max_row_count {
            return Err(Error::constraint(format!(
                "table {table} would exceed the row cap of {}",
                self.max_row_count
            )));
        }
        Ok(count)
    }
}

fn require_controller(entry: &TableEntry, caller: &str, action: &str) -> Result<()> {
    if entry.controller != caller {
        return Err(Error::acl(format!(
            "only the controller may {action} table {}",
            entry.id
        )));
    }
    Ok(())
}

/// Execute a statement derived from user input; database-level rejections
/// are the user's fault, everything else is infrastructure.
async fn exec_user_sql(conn: &mut SqliteConnection, sql: &str) -> Result<u64> {
    match sqlx::query(sql).execute(conn).await {
        Ok(done) => Ok(done.rows_affected()),
        Err(sqlx::Error::Database(e)) => Err(Error::constraint(e.message().to_string())),
        Err(e) => Err(Error::storage(format!("statement execution failed: {e}"))),
    }
}

/// Execute an internal statement (savepoint management)
async fn exec_system(tx: &mut Transaction<'static, Sqlite>, sql: &str) -> Result<()> {
    sqlx::query(sql)
        .execute(&mut **tx)
        .await
        .map_err(|e| Error::storage(format!("{sql} failed: {e}")))?;
    Ok(())
}

//! System table schema.
//!
//! These tables co-reside with user tables in the same database file so the
//! executor can update them inside the block transaction. User statements
//! can never reach them: the parser rejects every reserved prefix.

use sqlx::SqlitePool;

use tabledger_core::{Error, Result};

const SCHEMA: &[&str] = &[
    // Table registry: one row per minted table.
    "CREATE TABLE IF NOT EXISTS registry (
        chain_id   INTEGER NOT NULL,
        id         INTEGER NOT NULL,
        prefix     TEXT    NOT NULL,
        controller TEXT    NOT NULL,
        structure  TEXT    NOT NULL,
        created_at INTEGER NOT NULL,
        PRIMARY KEY (chain_id, id)
    )",
    // ACL grants; the controller's full grant is materialized here so a
    // self-revoke inside a batch really takes effect.
    "CREATE TABLE IF NOT EXISTS system_acl (
        chain_id   INTEGER NOT NULL,
        table_id   INTEGER NOT NULL,
        controller TEXT    NOT NULL,
        privileges INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        PRIMARY KEY (chain_id, table_id, controller)
    )",
    // One receipt per processed chain transaction that carried events.
    "CREATE TABLE IF NOT EXISTS system_txn_receipts (
        chain_id        INTEGER NOT NULL,
        block_number    INTEGER NOT NULL,
        index_in_block  INTEGER NOT NULL,
        txn_hash        TEXT    NOT NULL,
        table_ids       TEXT    NOT NULL,
        error           TEXT,
        error_event_idx INTEGER,
        PRIMARY KEY (chain_id, txn_hash)
    )",
    "CREATE INDEX IF NOT EXISTS system_txn_receipts_block
        ON system_txn_receipts (chain_id, block_number)",
    // Chain cursor: block number of the last fully committed block.
    "CREATE TABLE IF NOT EXISTS system_txn_processor (
        chain_id     INTEGER PRIMARY KEY,
        block_number INTEGER NOT NULL
    )",
    // Raw decoded logs, persisted before execution for audit and replay.
    "CREATE TABLE IF NOT EXISTS system_evm_events (
        chain_id     INTEGER NOT NULL,
        block_number INTEGER NOT NULL,
        tx_hash      TEXT    NOT NULL,
        log_index    INTEGER NOT NULL,
        event_kind   TEXT    NOT NULL,
        payload      TEXT    NOT NULL,
        PRIMARY KEY (chain_id, tx_hash, log_index)
    )",
];

/// Apply the system schema; idempotent.
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    for ddl in SCHEMA {
        sqlx::query(ddl)
            .execute(pool)
            .await
            .map_err(|e| Error::storage(format!("schema migration failed: {e}")))?;
    }
    Ok(())
}

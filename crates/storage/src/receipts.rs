//! Transaction receipt persistence.

use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::{Row, SqlitePool};

use tabledger_core::types::Receipt;
use tabledger_core::{Error, Result};

/// Write one receipt inside the block transaction. Receipts are immutable;
/// a second insert for the same transaction is a logic error surfaced by
/// the primary key.
pub async fn insert_receipt(conn: &mut SqliteConnection, receipt: &Receipt) -> Result<()> {
    let table_ids = serde_json::to_string(&receipt.table_ids)?;
    sqlx::query(
        "INSERT INTO system_txn_receipts
         (chain_id, block_number, index_in_block, txn_hash, table_ids, error, error_event_idx)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )
    .bind(receipt.chain_id as i64)
    .bind(receipt.block_number as i64)
    .bind(receipt.index_in_block as i64)
    .bind(&receipt.txn_hash)
    .bind(table_ids)
    .bind(&receipt.error)
    .bind(receipt.error_event_idx.map(|i| i as i64))
    .execute(conn)
    .await
    .map_err(|e| Error::storage(format!("receipt insert failed: {e}")))?;
    Ok(())
}

/// Whether a receipt already exists for a transaction (dedup support)
pub async fn receipt_exists(
    conn: &mut SqliteConnection,
    chain_id: u64,
    txn_hash: &str,
) -> Result<bool> {
    let row = sqlx::query(
        "SELECT 1 FROM system_txn_receipts WHERE chain_id = ?1 AND txn_hash = ?2",
    )
    .bind(chain_id as i64)
    .bind(txn_hash)
    .fetch_optional(conn)
    .await
    .map_err(|e| Error::storage(format!("receipt lookup failed: {e}")))?;
    Ok(row.is_some())
}

/// Fetch a receipt from committed state
pub async fn get_receipt(
    pool: &SqlitePool,
    chain_id: u64,
    txn_hash: &str,
) -> Result<Option<Receipt>> {
    let row = sqlx::query(
        "SELECT chain_id, block_number, index_in_block, txn_hash, table_ids, error, error_event_idx
         FROM system_txn_receipts WHERE chain_id = ?1 AND txn_hash = ?2",
    )
    .bind(chain_id as i64)
    .bind(txn_hash)
    .fetch_optional(pool)
    .await
    .map_err(|e| Error::storage(format!("receipt lookup failed: {e}")))?;

    row.map(|r| receipt_from_row(&r)).transpose()
}

fn receipt_from_row(row: &SqliteRow) -> Result<Receipt> {
    let table_ids: Vec<u64> = serde_json::from_str(row.get("table_ids"))?;
    Ok(Receipt {
        chain_id: row.get::<i64, _>("chain_id") as u64,
        block_number: row.get::<i64, _>("block_number") as u64,
        index_in_block: row.get::<i64, _>("index_in_block") as u64,
        txn_hash: row.get("txn_hash"),
        // The singular id is derived for backward-compatible consumers; the
        // list is authoritative.
        table_id: table_ids.first().copied(),
        table_ids,
        error: row.get("error"),
        error_event_idx: row.get::<Option<i64>, _>("error_event_idx").map(|i| i as u64),
    })
}

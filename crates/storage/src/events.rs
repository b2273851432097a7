//! Raw event persistence for audit and replay.

use async_trait::async_trait;
use sqlx::SqlitePool;

use tabledger_core::feed::RawEventSink;
use tabledger_core::types::BlockEvents;
use tabledger_core::{Error, Result};

/// Writes decoded logs to `system_evm_events` before they are executed.
///
/// Inserts are idempotent on `(chain_id, tx_hash, log_index)` so a block
/// that is re-fetched after a crash does not duplicate its events.
pub struct RawEventStore {
    writer: SqlitePool,
}

impl RawEventStore {
    pub fn new(writer: SqlitePool) -> Self {
        Self { writer }
    }
}

#[async_trait]
impl RawEventSink for RawEventStore {
    async fn persist_block_events(&self, events: &BlockEvents) -> Result<()> {
        for txn in &events.txns {
            for decoded in &txn.events {
                sqlx::query(
                    "INSERT OR IGNORE INTO system_evm_events
                     (chain_id, block_number, tx_hash, log_index, event_kind, payload)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )
                .bind(events.chain_id as i64)
                .bind(events.block_number as i64)
                .bind(&txn.txn_hash)
                .bind(decoded.log_index as i64)
                .bind(decoded.event.kind())
                .bind(serde_json::to_string(&decoded.event)?)
                .execute(&self.writer)
                .await
                .map_err(|e| Error::storage(format!("event persistence failed: {e}")))?;
            }
        }
        Ok(())
    }
}

//! Periodic state hashing for external audit.
//!
//! Two nodes that have committed the same block prefix must produce the
//! same hash: the digest covers registry rows, ACL rows and the full
//! contents of every user table in insertion order.

use sha3::{Digest, Keccak256};
use sqlx::{Row, SqlitePool};

use tabledger_core::types::TableIdent;
use tabledger_core::{Error, Result};

/// Compute the Keccak-256 state hash of one chain's committed state
pub async fn state_hash(pool: &SqlitePool, chain_id: u64) -> Result<String> {
    let mut hasher = Keccak256::new();

    let tables = sqlx::query(
        "SELECT id, prefix, controller, structure, created_at
         FROM registry WHERE chain_id = ?1 ORDER BY id",
    )
    .bind(chain_id as i64)
    .fetch_all(pool)
    .await
    .map_err(|e| Error::storage(format!("registry scan failed: {e}")))?;

    let mut idents = Vec::with_capacity(tables.len());
    for row in &tables {
        let id = row.get::<i64, _>("id") as u64;
        let prefix: String = row.get("prefix");
        hasher.update(
            format!(
                "registry|{id}|{prefix}|{}|{}|{}\n",
                row.get::<String, _>("controller"),
                row.get::<String, _>("structure"),
                row.get::<i64, _>("created_at"),
            )
            .as_bytes(),
        );
        idents.push(TableIdent::new(prefix, chain_id, id));
    }

    let grants = sqlx::query(
        "SELECT table_id, controller, privileges FROM system_acl
         WHERE chain_id = ?1 ORDER BY table_id, controller",
    )
    .bind(chain_id as i64)
    .fetch_all(pool)
    .await
    .map_err(|e| Error::storage(format!("acl scan failed: {e}")))?;
    for row in &grants {
        hasher.update(
            format!(
                "acl|{}|{}|{}\n",
                row.get::<i64, _>("table_id"),
                row.get::<String, _>("controller"),
                row.get::<i64, _>("privileges"),
            )
            .as_bytes(),
        );
    }

    for ident in idents {
        let rows = sqlx::query(&format!("SELECT * FROM {ident} ORDER BY rowid"))
            .fetch_all(pool)
            .await
            .map_err(|e| Error::storage(format!("table scan of {ident} failed: {e}")))?;

        hasher.update(format!("table|{ident}\n").as_bytes());
        for row in &rows {
            let values = crate::rows::decode_row(row)?;
            hasher.update(serde_json::to_string(&values)?.as_bytes());
            hasher.update(b"\n");
        }
    }

    Ok(hex::encode(hasher.finalize()))
}

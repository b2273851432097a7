//! Registry and ACL row operations.
//!
//! Write-path functions take a `&mut SqliteConnection` so the executor can
//! run them inside the block transaction; the gateway reads through the
//! pool-based variants in `gateway`.

use sqlx::sqlite::SqliteConnection;
use sqlx::Row;

use tabledger_core::types::{Privileges, TableIdent};
use tabledger_core::{Error, Result};

/// One registry row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableEntry {
    pub chain_id: u64,
    pub id: u64,
    pub prefix: String,
    pub controller: String,
    pub structure: String,
    pub created_at: u64,
}

impl TableEntry {
    /// Identity of the physical table
    pub fn ident(&self) -> TableIdent {
        TableIdent::new(self.prefix.clone(), self.chain_id, self.id)
    }
}

pub(crate) fn entry_from_row(row: &sqlx::sqlite::SqliteRow) -> TableEntry {
    TableEntry {
        chain_id: row.get::<i64, _>("chain_id") as u64,
        id: row.get::<i64, _>("id") as u64,
        prefix: row.get("prefix"),
        controller: row.get("controller"),
        structure: row.get("structure"),
        created_at: row.get::<i64, _>("created_at") as u64,
    }
}

/// Insert a new registry row; fails if the id is taken
pub async fn insert_table(conn: &mut SqliteConnection, entry: &TableEntry) -> Result<()> {
    let result = sqlx::query(
        "INSERT INTO registry (chain_id, id, prefix, controller, structure, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )
    .bind(entry.chain_id as i64)
    .bind(entry.id as i64)
    .bind(&entry.prefix)
    .bind(&entry.controller)
    .bind(&entry.structure)
    .bind(entry.created_at as i64)
    .execute(conn)
    .await;

    match result {
        Ok(_) => Ok(()),
        Err(sqlx::Error::Database(e)) if e.message().contains("UNIQUE") => Err(
            Error::constraint(format!("table {} already registered", entry.id)),
        ),
        Err(e) => Err(Error::storage(format!("registry insert failed: {e}"))),
    }
}

/// Fetch a registry row inside the block transaction
pub async fn get_table(
    conn: &mut SqliteConnection,
    chain_id: u64,
    table_id: u64,
) -> Result<Option<TableEntry>> {
    let row = sqlx::query(
        "SELECT chain_id, id, prefix, controller, structure, created_at
         FROM registry WHERE chain_id = ?1 AND id = ?2",
    )
    .bind(chain_id as i64)
    .bind(table_id as i64)
    .fetch_optional(conn)
    .await
    .map_err(|e| Error::storage(format!("registry lookup failed: {e}")))?;

    Ok(row.as_ref().map(entry_from_row))
}

/// Change the controller of a table
pub async fn set_controller(
    conn: &mut SqliteConnection,
    chain_id: u64,
    table_id: u64,
    controller: &str,
) -> Result<()> {
    sqlx::query("UPDATE registry SET controller = ?3 WHERE chain_id = ?1 AND id = ?2")
        .bind(chain_id as i64)
        .bind(table_id as i64)
        .bind(controller)
        .execute(conn)
        .await
        .map_err(|e| Error::storage(format!("controller update failed: {e}")))?;
    Ok(())
}

/// Privileges currently held by an address on a table.
///
/// Only materialized grants count; the controller's full grant is written
/// as a row when the table is created or transferred, so a self-revoke is
/// effective for the remainder of a batch.
pub async fn privileges_for(
    conn: &mut SqliteConnection,
    chain_id: u64,
    table_id: u64,
    address: &str,
) -> Result<Privileges> {
    let row = sqlx::query(
        "SELECT privileges FROM system_acl
         WHERE chain_id = ?1 AND table_id = ?2 AND controller = ?3",
    )
    .bind(chain_id as i64)
    .bind(table_id as i64)
    .bind(address)
    .fetch_optional(conn)
    .await
    .map_err(|e| Error::storage(format!("acl lookup failed: {e}")))?;

    Ok(row
        .map(|r| Privileges(r.get::<i64, _>("privileges") as u8))
        .unwrap_or_else(Privileges::none))
}

/// Add privilege bits for a grantee
pub async fn grant(
    conn: &mut SqliteConnection,
    chain_id: u64,
    table_id: u64,
    grantee: &str,
    privileges: Privileges,
    updated_at: u64,
) -> Result<()> {
    let current = privileges_for(conn, chain_id, table_id, grantee).await?;
    let merged = current.union(privileges);
    sqlx::query(
        "INSERT INTO system_acl (chain_id, table_id, controller, privileges, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT (chain_id, table_id, controller)
         DO UPDATE SET privileges = excluded.privileges, updated_at = excluded.updated_at",
    )
    .bind(chain_id as i64)
    .bind(table_id as i64)
    .bind(grantee)
    .bind(merged.0 as i64)
    .bind(updated_at as i64)
    .execute(conn)
    .await
    .map_err(|e| Error::storage(format!("grant failed: {e}")))?;
    Ok(())
}

/// Remove privilege bits from a grantee; the row is deleted when no bits
/// remain.
pub async fn revoke(
    conn: &mut SqliteConnection,
    chain_id: u64,
    table_id: u64,
    grantee: &str,
    privileges: Privileges,
    updated_at: u64,
) -> Result<()> {
    let current = privileges_for(conn, chain_id, table_id, grantee).await?;
    let remaining = current.difference(privileges);

    if remaining.is_empty() {
        sqlx::query(
            "DELETE FROM system_acl
             WHERE chain_id = ?1 AND table_id = ?2 AND controller = ?3",
        )
        .bind(chain_id as i64)
        .bind(table_id as i64)
        .bind(grantee)
        .execute(conn)
        .await
        .map_err(|e| Error::storage(format!("revoke failed: {e}")))?;
    } else {
        sqlx::query(
            "UPDATE system_acl SET privileges = ?4, updated_at = ?5
             WHERE chain_id = ?1 AND table_id = ?2 AND controller = ?3",
        )
        .bind(chain_id as i64)
        .bind(table_id as i64)
        .bind(grantee)
        .bind(remaining.0 as i64)
        .bind(updated_at as i64)
        .execute(conn)
        .await
        .map_err(|e| Error::storage(format!("revoke failed: {e}")))?;
    }
    Ok(())
}

/// Drop every grant on a table (ownership transfer)
pub async fn clear_acl(
    conn: &mut SqliteConnection,
    chain_id: u64,
    table_id: u64,
) -> Result<()> {
    sqlx::query("DELETE FROM system_acl WHERE chain_id = ?1 AND table_id = ?2")
        .bind(chain_id as i64)
        .bind(table_id as i64)
        .execute(conn)
        .await
        .map_err(|e| Error::storage(format!("acl clear failed: {e}")))?;
    Ok(())
}

/// Read the chain cursor from committed state
pub async fn cursor(pool: &sqlx::SqlitePool, chain_id: u64) -> Result<Option<u64>> {
    let row = sqlx::query("SELECT block_number FROM system_txn_processor WHERE chain_id = ?1")
        .bind(chain_id as i64)
        .fetch_optional(pool)
        .await
        .map_err(|e| Error::storage(format!("cursor lookup failed: {e}")))?;
    Ok(row.map(|r| r.get::<i64, _>("block_number") as u64))
}

/// Read the chain cursor inside the block transaction
pub async fn get_cursor(conn: &mut SqliteConnection, chain_id: u64) -> Result<Option<u64>> {
    let row = sqlx::query("SELECT block_number FROM system_txn_processor WHERE chain_id = ?1")
        .bind(chain_id as i64)
        .fetch_optional(conn)
        .await
        .map_err(|e| Error::storage(format!("cursor lookup failed: {e}")))?;
    Ok(row.map(|r| r.get::<i64, _>("block_number") as u64))
}

/// Write the chain cursor; called exactly once per committed block, inside
/// the block transaction.
pub async fn set_cursor(
    conn: &mut SqliteConnection,
    chain_id: u64,
    block_number: u64,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO system_txn_processor (chain_id, block_number) VALUES (?1, ?2)
         ON CONFLICT (chain_id) DO UPDATE SET block_number = excluded.block_number",
    )
    .bind(chain_id as i64)
    .bind(block_number as i64)
    .execute(conn)
    .await
    .map_err(|e| Error::storage(format!("cursor update failed: {e}")))?;
    Ok(())
}

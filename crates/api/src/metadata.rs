//! Table metadata assembly.
//!
//! The column schema is parsed back from the canonical DDL that the SQL
//! engine stored when the executor created the table, so metadata always
//! reflects committed state.

use tabledger_core::config::GatewayConfig;
use tabledger_core::types::TableMetadata;
use tabledger_core::Result;
use tabledger_storage::{registry::TableEntry, GatewayStore};

/// Build the public metadata document for a table
pub async fn table_metadata(
    store: &GatewayStore,
    config: &GatewayConfig,
    entry: &TableEntry,
) -> Result<TableMetadata> {
    let name = entry.ident().to_string();
    let ddl = store.table_ddl(&name).await?;
    let schema = store.parser().table_schema(&ddl)?;

    Ok(TableMetadata {
        external_url: format!(
            "{}/api/v1/tables/{}/{}",
            config.external_url_prefix, entry.chain_id, entry.id
        ),
        image: config
            .metadata_renderer_uri
            .as_ref()
            .map(|uri| format!("{uri}/{}/{}", entry.chain_id, entry.id)),
        animation_url: config
            .animation_renderer_uri
            .as_ref()
            .map(|uri| format!("{uri}/{}/{}", entry.chain_id, entry.id)),
        created_at: entry.created_at,
        schema,
        name,
    })
}

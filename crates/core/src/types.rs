use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Privilege bits grantable on a table
pub const PRIV_INSERT: u8 = 1;
/// Privilege bit for UPDATE
pub const PRIV_UPDATE: u8 = 2;
/// Privilege bit for DELETE
pub const PRIV_DELETE: u8 = 4;

/// Bitmask of {INSERT, UPDATE, DELETE} privileges on a (chain, table)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Privileges(pub u8);

impl Privileges {
    /// All three privileges
    pub fn all() -> Self {
        Privileges(PRIV_INSERT | PRIV_UPDATE | PRIV_DELETE)
    }

    /// No privileges
    pub fn none() -> Self {
        Privileges(0)
    }

    /// Whether all bits of `other` are held
    pub fn contains(&self, other: Privileges) -> bool {
        self.0 & other.0 == other.0
    }

    /// Union of two masks
    pub fn union(&self, other: Privileges) -> Privileges {
        Privileges(self.0 | other.0)
    }

    /// Mask with the bits of `other` removed
    pub fn difference(&self, other: Privileges) -> Privileges {
        Privileges(self.0 & !other.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Privileges {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(Privileges(PRIV_INSERT)) {
            names.push("insert");
        }
        if self.contains(Privileges(PRIV_UPDATE)) {
            names.push("update");
        }
        if self.contains(Privileges(PRIV_DELETE)) {
            names.push("delete");
        }
        write!(f, "{}", names.join(","))
    }
}

/// Normalize a 0x-prefixed EVM address to its lowercase form.
///
/// Addresses are compared case-insensitively throughout the system, so every
/// address is normalized at the boundary where it enters.
pub fn normalize_address(addr: &str) -> Result<String> {
    let trimmed = addr.trim();
    let hex_part = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .ok_or_else(|| Error::validation(format!("address '{trimmed}' missing 0x prefix")))?;
    if hex_part.len() != 40 || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::validation(format!(
            "address '{trimmed}' is not 40 hex digits"
        )));
    }
    Ok(format!("0x{}", hex_part.to_ascii_lowercase()))
}

/// Identity of a user table.
///
/// The physical SQL name is deterministically `{prefix}_{chain_id}_{table_id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableIdent {
    /// User-chosen name fragment
    pub prefix: String,

    /// Chain the table lives on
    pub chain_id: u64,

    /// Chain-unique numeric id
    pub table_id: u64,
}

impl TableIdent {
    pub fn new(prefix: impl Into<String>, chain_id: u64, table_id: u64) -> Self {
        Self { prefix: prefix.into(), chain_id, table_id }
    }
}

impl fmt::Display for TableIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.prefix, self.chain_id, self.table_id)
    }
}

impl FromStr for TableIdent {
    type Err = Error;

    /// Parse a physical table name of the form `{prefix}_{chain_id}_{table_id}`.
    fn from_str(name: &str) -> Result<Self> {
        let mut parts = name.rsplitn(3, '_');
        let table_id = parts
            .next()
            .and_then(|p| p.parse::<u64>().ok())
            .ok_or_else(|| Error::validation(format!("table name '{name}' has no table id suffix")))?;
        let chain_id = parts
            .next()
            .and_then(|p| p.parse::<u64>().ok())
            .ok_or_else(|| Error::validation(format!("table name '{name}' has no chain id")))?;
        let prefix = parts
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| Error::validation(format!("table name '{name}' has an empty prefix")))?;
        Ok(TableIdent::new(prefix, chain_id, table_id))
    }
}

/// A decoded registry-contract event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TableEvent {
    /// A new table token was minted
    CreateTable {
        /// Minter, becomes the table controller
        owner: String,
        table_id: u64,
        /// The raw CREATE TABLE statement
        statement: String,
    },

    /// A mutation batch was submitted against an existing table
    RunSql {
        caller: String,
        /// Contract-side hint; authorization is re-checked locally
        is_owner: bool,
        table_id: u64,
        statement: String,
    },

    /// The table controller was changed explicitly
    SetController {
        caller: String,
        table_id: u64,
        controller: String,
    },

    /// The table token moved to a new owner
    TransferTable {
        from: String,
        to: String,
        table_id: u64,
    },
}

impl TableEvent {
    /// Short name used in logs and persisted raw events
    pub fn kind(&self) -> &'static str {
        match self {
            TableEvent::CreateTable { .. } => "create_table",
            TableEvent::RunSql { .. } => "run_sql",
            TableEvent::SetController { .. } => "set_controller",
            TableEvent::TransferTable { .. } => "transfer_table",
        }
    }

    /// The table targeted by the event
    pub fn table_id(&self) -> u64 {
        match self {
            TableEvent::CreateTable { table_id, .. }
            | TableEvent::RunSql { table_id, .. }
            | TableEvent::SetController { table_id, .. }
            | TableEvent::TransferTable { table_id, .. } => *table_id,
        }
    }
}

/// One decoded contract log together with its position in the block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedEvent {
    /// Log index within the block
    pub log_index: u64,

    /// The decoded payload
    pub event: TableEvent,
}

/// All relevant events of one chain transaction, in log-index order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnEvents {
    pub txn_hash: String,

    /// Transaction index within the block
    pub tx_index: u64,

    pub events: Vec<DecodedEvent>,
}

/// All relevant events of one finalized block, grouped per transaction.
///
/// Transactions are ordered by `tx_index`; a block with no relevant events
/// has an empty `txns` list but still advances the cursor when committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockEvents {
    pub chain_id: u64,
    pub block_number: u64,
    pub block_hash: String,

    /// Block timestamp in seconds since the epoch, as reported by the chain
    pub timestamp: u64,

    pub txns: Vec<TxnEvents>,
}

/// Durable record of the outcome of processing one chain transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub chain_id: u64,
    pub block_number: u64,

    /// Position of the transaction within its block
    pub index_in_block: u64,

    pub txn_hash: String,

    /// Tables affected by the transaction; authoritative representation
    pub table_ids: Vec<u64>,

    /// First table affected, kept for backward-compatible consumers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table_id: Option<u64>,

    /// Set iff the transaction failed; the block still commits
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Index of the failing event within the transaction
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_event_idx: Option<u64>,
}

impl Receipt {
    pub fn success(&self) -> bool {
        self.error.is_none()
    }
}

/// Result of executing one transaction's events inside a block scope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxnExecResult {
    pub error: Option<String>,
    pub error_event_idx: Option<u64>,
    pub affected_tables: Vec<u64>,
}

/// One cell of a gateway query result.
///
/// Stored text that parses as a JSON object or array is surfaced as a raw
/// JSON fragment rather than a quoted string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ColumnValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    /// Raw JSON fragment passed through unmodified
    Json(serde_json::Value),
}

/// Named column of a gateway query result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
}

/// Result set of a read query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableData {
    pub columns: Vec<Column>,
    pub rows: Vec<Vec<ColumnValue>>,
}

/// Column description surfaced in table metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,

    #[serde(rename = "type")]
    pub type_name: String,

    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub constraints: Vec<String>,
}

/// Parsed structure of a user table, derived from its canonical DDL
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub columns: Vec<ColumnSchema>,
}

/// Public metadata of a user table served by the gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMetadata {
    /// Physical table name `{prefix}_{chain_id}_{table_id}`
    pub name: String,

    pub external_url: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub animation_url: Option<String>,

    /// Creation time in seconds since the epoch (block timestamp)
    pub created_at: u64,

    pub schema: TableSchema,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn privileges_bitmask_roundtrip() {
        let p = Privileges(PRIV_INSERT | PRIV_DELETE);
        assert!(p.contains(Privileges(PRIV_INSERT)));
        assert!(!p.contains(Privileges(PRIV_UPDATE)));
        assert_eq!(p.union(Privileges(PRIV_UPDATE)), Privileges::all());
        assert_eq!(p.difference(Privileges(PRIV_DELETE)), Privileges(PRIV_INSERT));
        assert_eq!(p.to_string(), "insert,delete");
    }

    #[test]
    fn table_ident_roundtrip() {
        let ident = TableIdent::new("healthbot", 1337, 42);
        assert_eq!(ident.to_string(), "healthbot_1337_42");
        assert_eq!("healthbot_1337_42".parse::<TableIdent>().unwrap(), ident);
    }

    #[test]
    fn table_ident_prefix_with_underscores() {
        let ident = "my_cool_table_5_7".parse::<TableIdent>().unwrap();
        assert_eq!(ident.prefix, "my_cool_table");
        assert_eq!(ident.chain_id, 5);
        assert_eq!(ident.table_id, 7);
    }

    #[test]
    fn table_ident_rejects_malformed_names() {
        assert!("justaname".parse::<TableIdent>().is_err());
        assert!("x_1".parse::<TableIdent>().is_err());
        assert!("_1_2".parse::<TableIdent>().is_err());
    }

    #[test]
    fn address_normalization() {
        assert_eq!(
            normalize_address("0xB451cEC2F543933ee8e6Ed2c28211eB14EDD1b5f").unwrap(),
            "0xb451cec2f543933ee8e6ed2c28211eb14edd1b5f"
        );
        // missing prefix, wrong length, non-hex digits
        assert!(normalize_address("b451cec2f543933ee8e6ed2c28211eb14edd1b5f").is_err());
        assert!(normalize_address("0xb451cec2").is_err());
        assert!(normalize_address("0xZZ51cec2f543933ee8e6ed2c28211eb14edd1b5f").is_err());
    }
}

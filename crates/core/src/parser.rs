//! The parser seam between the executor, the gateway and the SQL validator.
//!
//! Both the executor and the gateway hold an `Arc<dyn SqlParser>`; the
//! concrete implementation lives in its own crate and has no knowledge of
//! either caller.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{Privileges, TableIdent, TableSchema};

/// A validated, canonicalized read statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadStmt {
    /// Canonical statement text, safe to hand to the SQL engine
    pub statement: String,

    /// Physical names of every table the statement references
    pub tables: Vec<String>,
}

/// Classification of a single validated write statement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteKind {
    Insert,
    Update,
    Delete,
    Grant { grantee: String, privileges: Privileges },
    Revoke { grantee: String, privileges: Privileges },
}

/// One validated write statement in canonical form
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteStmt {
    pub kind: WriteKind,

    /// Canonical statement text, safe to hand to the SQL engine.
    /// GRANT/REVOKE keep their canonical text for logging but are applied
    /// against the ACL store rather than the SQL engine.
    pub statement: String,
}

/// A validated write batch.
///
/// Mutation statements may be batched, but all of them must target the same
/// table so the executor can scope its ACL check to a single table id. A
/// CREATE TABLE is only valid on its own: it has no table id until the
/// executor allocates one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteStmts {
    Mutations { table: TableIdent, stmts: Vec<WriteStmt> },
    Create(CreateStmt),
}

impl WriteStmts {
    /// The table id the batch targets, if it targets an existing table
    pub fn table_id(&self) -> Option<u64> {
        match self {
            WriteStmts::Mutations { table, .. } => Some(table.table_id),
            WriteStmts::Create(_) => None,
        }
    }
}

/// A normalized CREATE TABLE statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateStmt {
    /// User-chosen name fragment (the table name minus the chain id suffix)
    pub prefix: String,

    /// Chain the table is being created on
    pub chain_id: u64,

    /// Canonical DDL with the user-supplied name `{prefix}_{chain_id}`
    pub canonical_ddl: String,

    /// Deterministic hash of the normalized column/constraint structure
    pub structure_hash: String,
}

impl CreateStmt {
    /// Name the table was submitted under, before an id is allocated
    pub fn submitted_name(&self) -> String {
        format!("{}_{}", self.prefix, self.chain_id)
    }

    /// The DDL rewritten against the physical table name.
    ///
    /// The canonical DDL always begins `CREATE TABLE {submitted_name} `, so a
    /// single anchored replacement is exact.
    pub fn physical_ddl(&self, table_id: u64) -> String {
        let submitted = self.submitted_name();
        let physical = TableIdent::new(self.prefix.clone(), self.chain_id, table_id);
        self.canonical_ddl.replacen(
            &format!("CREATE TABLE {submitted} "),
            &format!("CREATE TABLE {physical} "),
            1,
        )
    }
}

/// Stateless SQL validator shared by the executor and the gateway
pub trait SqlParser: Send + Sync {
    /// Validate a single read statement
    fn validate_read(&self, stmt: &str) -> Result<ReadStmt>;

    /// Validate a write batch; every statement must target the same table
    fn validate_write_stmts(&self, chain_id: u64, stmt: &str) -> Result<WriteStmts>;

    /// Normalize a CREATE TABLE statement and compute its structure hash
    fn normalize_create(&self, chain_id: u64, ddl: &str) -> Result<CreateStmt>;

    /// Parse a canonical DDL back into a column schema for metadata
    fn table_schema(&self, ddl: &str) -> Result<TableSchema>;
}

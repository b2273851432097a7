/// SQL validator for the tabledger validator node
///
/// Pure and stateless: classifies statements as read / write / create /
/// ACL-grant, enforces the allowed deterministic grammar, extracts the
/// referenced tables and re-emits a canonical string form. One instance is
/// shared across chains; it performs no I/O and never panics on untrusted
/// input.
use sqlparser::ast::Statement;
use sqlparser::dialect::SQLiteDialect;
use sqlparser::parser::Parser;

use tabledger_core::error::{Error, Result};
use tabledger_core::parser::{CreateStmt, ReadStmt, SqlParser, WriteStmts};
use tabledger_core::types::TableSchema;

mod create;
mod determinism;
mod read;
mod write;

/// Table name prefixes reserved for system use
pub const RESERVED_PREFIXES: &[&str] = &["system_", "registry", "sqlite_"];

/// Configurable limits for the statement parser
#[derive(Debug, Clone)]
pub struct ParserConfig {
    /// Maximum read statement size in bytes
    pub max_read_query_size: usize,

    /// Maximum write statement size in bytes
    pub max_write_query_size: usize,

    /// Prefixes no user statement may reference
    pub reserved_prefixes: Vec<String>,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            max_read_query_size: 35_000,
            max_write_query_size: 35_000,
            reserved_prefixes: RESERVED_PREFIXES.iter().map(|p| p.to_string()).collect(),
        }
    }
}

/// The statement parser shared by the executor and the gateway
#[derive(Debug, Clone, Default)]
pub struct StatementParser {
    config: ParserConfig,
}

impl StatementParser {
    pub fn new(config: ParserConfig) -> Self {
        Self { config }
    }

    pub(crate) fn config(&self) -> &ParserConfig {
        &self.config
    }

    /// Parse raw SQL into statements with the SQLite dialect
    pub(crate) fn parse(&self, sql: &str) -> Result<Vec<Statement>> {
        Parser::parse_sql(&SQLiteDialect {}, sql)
            .map_err(|e| Error::parse(format!("{e}")))
    }

    /// Whether a table name starts with a reserved prefix
    pub(crate) fn is_reserved(&self, table_name: &str) -> bool {
        let lower = table_name.to_ascii_lowercase();
        self.config
            .reserved_prefixes
            .iter()
            .any(|prefix| lower.starts_with(prefix.as_str()))
    }
}

impl SqlParser for StatementParser {
    fn validate_read(&self, stmt: &str) -> Result<ReadStmt> {
        read::validate_read(self, stmt)
    }

    fn validate_write_stmts(&self, chain_id: u64, stmt: &str) -> Result<WriteStmts> {
        write::validate_write_stmts(self, chain_id, stmt)
    }

    fn normalize_create(&self, chain_id: u64, ddl: &str) -> Result<CreateStmt> {
        create::normalize_create(self, chain_id, ddl)
    }

    fn table_schema(&self, ddl: &str) -> Result<TableSchema> {
        create::table_schema(self, ddl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabledger_core::parser::SqlParser;

    #[test]
    fn shared_instance_is_send_sync() {
        fn assert_traits<T: Send + Sync>() {}
        assert_traits::<StatementParser>();
    }

    #[test]
    fn reserved_prefix_detection_is_case_insensitive() {
        let parser = StatementParser::default();
        assert!(parser.is_reserved("system_acl"));
        assert!(parser.is_reserved("SYSTEM_txn_receipts"));
        assert!(parser.is_reserved("registry"));
        assert!(parser.is_reserved("sqlite_master"));
        assert!(!parser.is_reserved("healthbot_1337_1"));
    }

    #[test]
    fn parse_error_is_total() {
        let parser = StatementParser::default();
        let err = parser.validate_read("SELEKT * FROM nope").unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }
}

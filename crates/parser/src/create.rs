//! CREATE TABLE normalization and the structure hash.

use sha3::{Digest, Keccak256};
use sqlparser::ast::{ColumnOption, Statement, TableConstraint};

use tabledger_core::error::{Error, Result};
use tabledger_core::parser::CreateStmt;
use tabledger_core::types::{ColumnSchema, TableSchema};

use crate::{determinism, StatementParser};

/// Normalize a CREATE TABLE statement.
///
/// The submitted table name must be `{prefix}_{chain_id}`. Canonicalization
/// lowercases the table name and re-emits the statement with normalized
/// keywords and whitespace, so the result is reproducible across nodes and
/// `normalize_create` is idempotent. The structure hash covers only the
/// column/constraint body: identically structured tables hash equal
/// regardless of their names.
pub(crate) fn normalize_create(
    parser: &StatementParser,
    chain_id: u64,
    ddl: &str,
) -> Result<CreateStmt> {
    let max = parser.config().max_write_query_size;
    if ddl.len() > max {
        return Err(Error::parse(format!(
            "create statement of {} bytes exceeds the {} byte limit",
            ddl.len(),
            max
        )));
    }

    let mut statements = parser.parse(ddl)?;
    if statements.len() != 1 {
        return Err(Error::parse("expected exactly one CREATE TABLE statement"));
    }
    let mut statement = statements.remove(0);

    let prefix = match &mut statement {
        Statement::CreateTable {
            or_replace,
            temporary,
            external,
            if_not_exists,
            name,
            columns,
            constraints,
            query,
            like,
            without_rowid,
            ..
        } => {
            if *or_replace || *temporary || *external || *if_not_exists {
                return Err(Error::parse(
                    "only plain CREATE TABLE is allowed (no OR REPLACE, TEMPORARY, EXTERNAL or IF NOT EXISTS)",
                ));
            }
            if *without_rowid {
                return Err(Error::parse("WITHOUT ROWID tables are not allowed"));
            }
            if query.is_some() || like.is_some() {
                return Err(Error::parse("CREATE TABLE AS / LIKE is not allowed"));
            }
            if columns.is_empty() {
                return Err(Error::parse("table must declare at least one column"));
            }
            if name.0.len() != 1 {
                return Err(Error::parse(format!(
                    "qualified table names are not allowed: {name}"
                )));
            }

            // Canonical case for the table name.
            let submitted = name.0[0].value.to_ascii_lowercase();
            name.0[0].value = submitted.clone();
            name.0[0].quote_style = None;

            if !is_valid_ident(&submitted) {
                return Err(Error::parse(format!(
                    "invalid table name '{submitted}'"
                )));
            }

            let prefix = submitted
                .strip_suffix(&format!("_{chain_id}"))
                .ok_or_else(|| {
                    Error::parse(format!(
                        "table name '{submitted}' must end with the chain id suffix _{chain_id}"
                    ))
                })?
                .to_string();
            if prefix.is_empty() {
                return Err(Error::parse("table name prefix must not be empty"));
            }
            if parser.is_reserved(&prefix) || parser.is_reserved(&submitted) {
                return Err(Error::parse(format!(
                    "table name '{submitted}' uses a reserved prefix"
                )));
            }

            for column in columns.iter() {
                for option_def in &column.options {
                    match &option_def.option {
                        ColumnOption::Default(expr) => {
                            determinism::check_expressions(expr).map_err(|e| {
                                Error::parse(format!(
                                    "default for column '{}': {e}",
                                    column.name
                                ))
                            })?;
                        }
                        ColumnOption::ForeignKey { .. } => {
                            return Err(Error::parse(
                                "foreign key constraints are not allowed",
                            ));
                        }
                        ColumnOption::DialectSpecific(tokens) => {
                            if tokens.iter().any(|t| {
                                t.to_string().eq_ignore_ascii_case("autoincrement")
                            }) {
                                return Err(Error::parse(
                                    "AUTOINCREMENT is not allowed",
                                ));
                            }
                        }
                        _ => {}
                    }
                }
            }
            for constraint in constraints.iter() {
                if matches!(constraint, TableConstraint::ForeignKey { .. }) {
                    return Err(Error::parse(
                        "foreign key constraints are not allowed",
                    ));
                }
            }

            prefix
        }
        _ => return Err(Error::parse("statement is not a CREATE TABLE")),
    };

    let canonical_ddl = statement.to_string();
    let structure_hash = structure_hash(chain_id, &prefix, &canonical_ddl)?;

    Ok(CreateStmt { prefix, chain_id, canonical_ddl, structure_hash })
}

/// Keccak-256 of the canonical column/constraint body, hex encoded
fn structure_hash(chain_id: u64, prefix: &str, canonical_ddl: &str) -> Result<String> {
    let head = format!("CREATE TABLE {prefix}_{chain_id} ");
    let body = canonical_ddl.strip_prefix(&head).ok_or_else(|| {
        Error::logic(format!("canonical DDL does not start with '{head}'"))
    })?;
    Ok(hex::encode(Keccak256::digest(body.as_bytes())))
}

/// Parse a canonical DDL back into the column schema served in metadata
pub(crate) fn table_schema(parser: &StatementParser, ddl: &str) -> Result<TableSchema> {
    let statements = parser.parse(ddl)?;
    let columns = match statements.first() {
        Some(Statement::CreateTable { columns, .. }) => columns,
        _ => return Err(Error::parse("statement is not a CREATE TABLE")),
    };

    Ok(TableSchema {
        columns: columns
            .iter()
            .map(|column| ColumnSchema {
                name: column.name.value.clone(),
                type_name: column.data_type.to_string(),
                constraints: column
                    .options
                    .iter()
                    .map(|option_def| option_def.option.to_string())
                    .collect(),
            })
            .collect(),
    })
}

fn is_valid_ident(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> StatementParser {
        StatementParser::default()
    }

    #[test]
    fn normalizes_case_and_whitespace() {
        let create = normalize_create(
            &parser(),
            1337,
            "create   table Foo_1337 ( bar int,   baz text )",
        )
        .unwrap();
        assert_eq!(create.prefix, "foo");
        assert_eq!(create.canonical_ddl, "CREATE TABLE foo_1337 (bar INT, baz TEXT)");
        assert_eq!(create.submitted_name(), "foo_1337");
    }

    #[test]
    fn normalize_is_idempotent() {
        let first = normalize_create(
            &parser(),
            1337,
            "create table foo_1337 (bar int primary key, baz text not null)",
        )
        .unwrap();
        let second = normalize_create(&parser(), 1337, &first.canonical_ddl).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn structure_hash_ignores_table_name() {
        let a = normalize_create(&parser(), 1337, "create table foo_1337 (bar int)").unwrap();
        let b = normalize_create(&parser(), 1337, "create table quux_1337 (bar int)").unwrap();
        let c = normalize_create(&parser(), 1337, "create table foo_1337 (bar text)").unwrap();
        assert_eq!(a.structure_hash, b.structure_hash);
        assert_ne!(a.structure_hash, c.structure_hash);
    }

    #[test]
    fn physical_ddl_targets_allocated_id() {
        let create = normalize_create(&parser(), 1337, "create table foo_1337 (bar int)").unwrap();
        assert_eq!(
            create.physical_ddl(42),
            "CREATE TABLE foo_1337_42 (bar INT)"
        );
    }

    #[test]
    fn requires_chain_suffix() {
        assert!(normalize_create(&parser(), 1337, "create table foo (bar int)").is_err());
        assert!(normalize_create(&parser(), 1337, "create table foo_31337 (bar int)").is_err());
    }

    #[test]
    fn rejects_reserved_prefixes() {
        assert!(
            normalize_create(&parser(), 1337, "create table system_x_1337 (bar int)").is_err()
        );
        assert!(
            normalize_create(&parser(), 1337, "create table registry_1337 (bar int)").is_err()
        );
    }

    #[test]
    fn rejects_autoincrement() {
        assert!(normalize_create(
            &parser(),
            1337,
            "create table foo_1337 (id integer primary key autoincrement)"
        )
        .is_err());
    }

    #[test]
    fn rejects_nondeterministic_defaults() {
        assert!(normalize_create(
            &parser(),
            1337,
            "create table foo_1337 (ts text default current_timestamp)"
        )
        .is_err());
        assert!(normalize_create(
            &parser(),
            1337,
            "create table foo_1337 (n int default 7)"
        )
        .is_ok());
    }

    #[test]
    fn rejects_foreign_keys_and_create_as() {
        assert!(normalize_create(
            &parser(),
            1337,
            "create table foo_1337 (bar int references other_1337_1(id))"
        )
        .is_err());
        assert!(normalize_create(
            &parser(),
            1337,
            "create table foo_1337 as select 1"
        )
        .is_err());
        assert!(normalize_create(
            &parser(),
            1337,
            "create table if not exists foo_1337 (bar int)"
        )
        .is_err());
    }

    #[test]
    fn schema_roundtrip_for_metadata() {
        let create = normalize_create(
            &parser(),
            1337,
            "create table foo_1337 (id int primary key, name text not null)",
        )
        .unwrap();
        let schema = table_schema(&parser(), &create.canonical_ddl).unwrap();
        assert_eq!(schema.columns.len(), 2);
        assert_eq!(schema.columns[0].name, "id");
        assert_eq!(schema.columns[0].type_name, "INT");
        assert_eq!(schema.columns[1].constraints, vec!["NOT NULL".to_string()]);
    }
}

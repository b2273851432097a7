//! Read statement validation.

use sqlparser::ast::{SetExpr, Statement};

use tabledger_core::error::{Error, Result};
use tabledger_core::parser::ReadStmt;

use crate::determinism;
use crate::StatementParser;

/// Validate a single top-level read statement.
///
/// Accepts exactly one `SELECT`; rejects multi-statement input, references
/// to reserved tables, non-deterministic constructs and over-length input.
pub(crate) fn validate_read(parser: &StatementParser, stmt: &str) -> Result<ReadStmt> {
    let max = parser.config().max_read_query_size;
    if stmt.len() > max {
        return Err(Error::parse(format!(
            "read statement of {} bytes exceeds the {} byte limit",
            stmt.len(),
            max
        )));
    }

    let mut statements = parser.parse(stmt)?;
    if statements.len() != 1 {
        return Err(Error::parse(format!(
            "expected exactly one read statement, got {}",
            statements.len()
        )));
    }
    let statement = statements.remove(0);

    let query = match &statement {
        Statement::Query(query) => query,
        other => {
            return Err(Error::parse(format!(
                "statement is not a read: {}",
                statement_kind(other)
            )))
        }
    };

    if !query.locks.is_empty() {
        return Err(Error::parse("locking clauses are not allowed in reads"));
    }
    if let SetExpr::Select(select) = query.body.as_ref() {
        if select.into.is_some() {
            return Err(Error::parse("SELECT INTO is not allowed"));
        }
    }

    // Aggregated output has no guaranteed row order, so it must be pinned
    // by the query itself.
    if query.order_by.is_empty()
        && (determinism::query_has_group_by(query) || determinism::has_aggregation(&statement))
    {
        return Err(Error::parse(
            "aggregate or GROUP BY reads require an explicit ORDER BY",
        ));
    }

    determinism::check_statement_determinism(&statement)?;
    let tables = determinism::collect_relations(parser, &statement)?;
    if tables.is_empty() {
        return Err(Error::parse("read statement references no table"));
    }

    Ok(ReadStmt { statement: statement.to_string(), tables })
}

fn statement_kind(stmt: &Statement) -> &'static str {
    match stmt {
        Statement::Insert { .. } => "INSERT",
        Statement::Update { .. } => "UPDATE",
        Statement::Delete { .. } => "DELETE",
        Statement::CreateTable { .. } => "CREATE TABLE",
        Statement::Grant { .. } => "GRANT",
        Statement::Revoke { .. } => "REVOKE",
        Statement::Drop { .. } => "DROP",
        _ => "unsupported statement",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ParserConfig;

    fn parser() -> StatementParser {
        StatementParser::default()
    }

    #[test]
    fn accepts_basic_select() {
        let read = validate_read(&parser(), "select * from healthbot_1337_1").unwrap();
        assert_eq!(read.statement, "SELECT * FROM healthbot_1337_1");
        assert_eq!(read.tables, vec!["healthbot_1337_1".to_string()]);
    }

    #[test]
    fn accepts_joins_across_user_tables() {
        let read = validate_read(
            &parser(),
            "SELECT a.id, b.val FROM a_1_1 a JOIN b_1_2 b ON a.id = b.ref ORDER BY a.id",
        )
        .unwrap();
        assert_eq!(read.tables.len(), 2);
    }

    #[test]
    fn rejects_multi_statement_input() {
        let err = validate_read(&parser(), "SELECT 1 FROM a_1_1; SELECT 2 FROM a_1_1");
        assert!(err.is_err());
    }

    #[test]
    fn rejects_writes() {
        let err = validate_read(&parser(), "INSERT INTO a_1_1 VALUES (1)").unwrap_err();
        assert!(err.to_string().contains("INSERT"));
    }

    #[test]
    fn rejects_system_tables() {
        assert!(validate_read(&parser(), "SELECT * FROM system_acl").is_err());
        assert!(validate_read(&parser(), "SELECT * FROM registry").is_err());
        assert!(validate_read(&parser(), "SELECT * FROM sqlite_master").is_err());
    }

    #[test]
    fn rejects_nondeterministic_reads() {
        assert!(validate_read(&parser(), "SELECT random() FROM a_1_1").is_err());
        assert!(validate_read(&parser(), "SELECT date('now') FROM a_1_1").is_err());
    }

    #[test]
    fn aggregated_reads_require_order_by() {
        let err = validate_read(
            &parser(),
            "SELECT owner, count(*) FROM a_1_1 GROUP BY owner",
        )
        .unwrap_err();
        assert!(err.to_string().contains("ORDER BY"), "unexpected error: {err}");

        assert!(validate_read(&parser(), "SELECT sum(bar) FROM a_1_1").is_err());
        assert!(validate_read(&parser(), "SELECT owner FROM a_1_1 GROUP BY owner").is_err());

        // The same queries are accepted once the order is pinned.
        assert!(validate_read(
            &parser(),
            "SELECT owner, count(*) FROM a_1_1 GROUP BY owner ORDER BY owner"
        )
        .is_ok());
        assert!(validate_read(&parser(), "SELECT sum(bar) FROM a_1_1 ORDER BY 1").is_ok());

        // Non-aggregated reads stay unaffected.
        assert!(validate_read(&parser(), "SELECT * FROM a_1_1").is_ok());
    }

    #[test]
    fn canonical_form_is_a_fixed_point() {
        let parser = parser();
        let first = validate_read(
            &parser,
            "select  a.id , upper(a.name)  from  a_1_1  a  where a.id>3 order by a.id",
        )
        .unwrap();
        let second = validate_read(&parser, &first.statement).unwrap();
        assert_eq!(first.statement, second.statement);
        assert_eq!(first.tables, second.tables);
    }

    #[test]
    fn size_limit_is_exact() {
        let config = ParserConfig { max_read_query_size: 33, ..ParserConfig::default() };
        let parser = StatementParser::new(config);

        // exactly 33 bytes
        let at_limit = "SELECT * FROM healthbot_1_1 --xy.";
        assert_eq!(at_limit.len(), 33);
        assert!(validate_read(&parser, at_limit).is_ok());

        // one byte over
        let over = "SELECT * FROM healthbot_1_1 --xyz.";
        assert_eq!(over.len(), 34);
        assert!(validate_read(&parser, over).is_err());
    }
}

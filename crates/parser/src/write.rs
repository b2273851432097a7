//! Write batch validation and classification.

use sqlparser::ast::{
    Action, GrantObjects, ObjectName, SetExpr, Statement, TableFactor,
};

use tabledger_core::error::{Error, Result};
use tabledger_core::parser::{WriteKind, WriteStmt, WriteStmts};
use tabledger_core::types::{
    normalize_address, Privileges, TableIdent, PRIV_DELETE, PRIV_INSERT, PRIV_UPDATE,
};

use crate::{create, determinism, StatementParser};

/// Validate a write batch.
///
/// Accepts `INSERT` (VALUES form), `UPDATE`, `DELETE` and GRANT/REVOKE of
/// {insert, update, delete}, possibly as a multi-statement string where
/// every statement targets the same table, or a single `CREATE TABLE`.
pub(crate) fn validate_write_stmts(
    parser: &StatementParser,
    chain_id: u64,
    stmt: &str,
) -> Result<WriteStmts> {
    let max = parser.config().max_write_query_size;
    if stmt.len() > max {
        return Err(Error::parse(format!(
            "write statement of {} bytes exceeds the {} byte limit",
            stmt.len(),
            max
        )));
    }

    let statements = parser.parse(stmt)?;
    if statements.is_empty() {
        return Err(Error::parse("empty write statement"));
    }

    // CREATE TABLE has no table id until the executor allocates one, so it
    // cannot be combined with statements that need an ACL scope.
    if statements.iter().any(|s| matches!(s, Statement::CreateTable { .. })) {
        if statements.len() != 1 {
            return Err(Error::parse(
                "CREATE TABLE must be the only statement in a batch",
            ));
        }
        let create = create::normalize_create(parser, chain_id, stmt)?;
        return Ok(WriteStmts::Create(create));
    }

    let mut target: Option<TableIdent> = None;
    let mut stmts = Vec::with_capacity(statements.len());

    for statement in &statements {
        determinism::check_statement_determinism(statement)?;

        let (kind, table_name) = classify(parser, statement)?;

        let table = resolve_target(parser, chain_id, &table_name)?;
        match &target {
            None => target = Some(table.clone()),
            Some(existing) if *existing == table => {}
            Some(existing) => {
                return Err(Error::parse(format!(
                    "statements target different tables: {existing} and {table}"
                )))
            }
        }

        // Any table referenced anywhere in the statement (subqueries
        // included) must be the target table itself; cross-table reads
        // inside writes would widen the ACL scope.
        for referenced in determinism::collect_relations(parser, statement)? {
            if referenced != table.to_string() {
                return Err(Error::parse(format!(
                    "write statement references table {referenced} outside its target {table}"
                )));
            }
        }

        stmts.push(WriteStmt { kind, statement: statement.to_string() });
    }

    let table = target.ok_or_else(|| Error::parse("no target table"))?;
    Ok(WriteStmts::Mutations { table, stmts })
}

/// Classify one statement and name its target table
fn classify(
    _parser: &StatementParser,
    statement: &Statement,
) -> Result<(WriteKind, String)> {
    match statement {
        Statement::Insert { or, table_name, source, on, returning, .. } => {
            if or.is_some() {
                return Err(Error::parse("INSERT OR ... conflict clauses are not allowed"));
            }
            if on.is_some() {
                return Err(Error::parse("ON CONFLICT clauses are not allowed"));
            }
            if returning.is_some() {
                return Err(Error::parse("RETURNING clauses are not allowed"));
            }
            if !matches!(source.body.as_ref(), SetExpr::Values(_)) {
                return Err(Error::parse("INSERT must use a VALUES list"));
            }
            Ok((WriteKind::Insert, object_name(table_name)?))
        }

        Statement::Update { table, returning, .. } => {
            if returning.is_some() {
                return Err(Error::parse("RETURNING clauses are not allowed"));
            }
            let name = match &table.relation {
                TableFactor::Table { name, .. } => object_name(name)?,
                _ => return Err(Error::parse("UPDATE target must be a plain table")),
            };
            Ok((WriteKind::Update, name))
        }

        Statement::Delete { tables, from, returning, .. } => {
            if returning.is_some() {
                return Err(Error::parse("RETURNING clauses are not allowed"));
            }
            if !tables.is_empty() || from.len() != 1 {
                return Err(Error::parse("DELETE must target exactly one table"));
            }
            let name = match &from[0].relation {
                TableFactor::Table { name, .. } => object_name(name)?,
                _ => return Err(Error::parse("DELETE target must be a plain table")),
            };
            Ok((WriteKind::Delete, name))
        }

        Statement::Grant { privileges, objects, grantees, .. } => {
            let privileges = privilege_mask(privileges)?;
            let (table, grantee) = grant_target(objects, grantees)?;
            Ok((WriteKind::Grant { grantee, privileges }, table))
        }

        Statement::Revoke { privileges, objects, grantees, .. } => {
            let privileges = privilege_mask(privileges)?;
            let (table, grantee) = grant_target(objects, grantees)?;
            Ok((WriteKind::Revoke { grantee, privileges }, table))
        }

        other => Err(Error::parse(format!(
            "statement is not an allowed write: {}",
            other.to_string().chars().take(40).collect::<String>()
        ))),
    }
}

/// Map GRANT/REVOKE actions onto the privilege bitmask
fn privilege_mask(privileges: &sqlparser::ast::Privileges) -> Result<Privileges> {
    let actions = match privileges {
        sqlparser::ast::Privileges::Actions(actions) => actions,
        sqlparser::ast::Privileges::All { .. } => {
            return Err(Error::parse("GRANT ALL is not allowed; name the privileges"))
        }
    };

    let mut mask = Privileges::none();
    for action in actions {
        let bit = match action {
            Action::Insert { columns: None } => PRIV_INSERT,
            Action::Update { columns: None } => PRIV_UPDATE,
            Action::Delete => PRIV_DELETE,
            Action::Insert { columns: Some(_) } | Action::Update { columns: Some(_) } => {
                return Err(Error::parse("column-scoped privileges are not supported"))
            }
            other => {
                return Err(Error::parse(format!(
                    "privilege '{other}' cannot be granted; only insert, update, delete"
                )))
            }
        };
        mask = mask.union(Privileges(bit));
    }
    if mask.is_empty() {
        return Err(Error::parse("no privileges named"));
    }
    Ok(mask)
}

/// Extract the single table and single grantee of a GRANT/REVOKE
fn grant_target(
    objects: &GrantObjects,
    grantees: &[sqlparser::ast::Ident],
) -> Result<(String, String)> {
    let tables = match objects {
        GrantObjects::Tables(tables) => tables,
        _ => return Err(Error::parse("GRANT/REVOKE must name a table")),
    };
    if tables.len() != 1 {
        return Err(Error::parse("GRANT/REVOKE must name exactly one table"));
    }
    if grantees.len() != 1 {
        return Err(Error::parse("GRANT/REVOKE must name exactly one grantee"));
    }

    let table = object_name(&tables[0])?;
    let grantee = normalize_address(&grantees[0].value)
        .map_err(|e| Error::parse(format!("invalid grantee: {e}")))?;
    Ok((table, grantee))
}

/// Resolve a referenced table name to the target table identity
fn resolve_target(
    parser: &StatementParser,
    chain_id: u64,
    table_name: &str,
) -> Result<TableIdent> {
    if parser.is_reserved(table_name) {
        return Err(Error::parse(format!(
            "write statement references reserved table: {table_name}"
        )));
    }
    let ident: TableIdent = table_name.parse()?;
    if ident.chain_id != chain_id {
        return Err(Error::parse(format!(
            "table {table_name} does not belong to chain {chain_id}"
        )));
    }
    Ok(ident)
}

/// Flatten a (possibly qualified) object name to its table part
fn object_name(name: &ObjectName) -> Result<String> {
    if name.0.len() != 1 {
        return Err(Error::parse(format!(
            "qualified table names are not allowed: {name}"
        )));
    }
    Ok(name.0[0].value.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> StatementParser {
        StatementParser::default()
    }

    fn mutations(sql: &str) -> (TableIdent, Vec<WriteStmt>) {
        match validate_write_stmts(&parser(), 1337, sql).unwrap() {
            WriteStmts::Mutations { table, stmts } => (table, stmts),
            WriteStmts::Create(_) => panic!("expected mutations"),
        }
    }

    #[test]
    fn classifies_insert_update_delete() {
        let (table, stmts) = mutations(
            "INSERT INTO foo_1337_1 VALUES (1, 'x'); \
             UPDATE foo_1337_1 SET bar = 2 WHERE id = 1; \
             DELETE FROM foo_1337_1 WHERE id = 1",
        );
        assert_eq!(table, TableIdent::new("foo", 1337, 1));
        assert_eq!(stmts.len(), 3);
        assert_eq!(stmts[0].kind, WriteKind::Insert);
        assert_eq!(stmts[1].kind, WriteKind::Update);
        assert_eq!(stmts[2].kind, WriteKind::Delete);
        assert_eq!(stmts[0].statement, "INSERT INTO foo_1337_1 VALUES (1, 'x')");
    }

    #[test]
    fn rejects_mixed_targets() {
        let err = validate_write_stmts(
            &parser(),
            1337,
            "INSERT INTO foo_1337_1 VALUES (1); INSERT INTO bar_1337_2 VALUES (1)",
        )
        .unwrap_err();
        assert!(err.to_string().contains("different tables"));
    }

    #[test]
    fn rejects_wrong_chain() {
        assert!(validate_write_stmts(&parser(), 1337, "INSERT INTO foo_5_1 VALUES (1)")
            .is_err());
    }

    #[test]
    fn rejects_cross_table_subqueries() {
        let err = validate_write_stmts(
            &parser(),
            1337,
            "DELETE FROM foo_1337_1 WHERE id IN (SELECT id FROM bar_1337_2)",
        )
        .unwrap_err();
        assert!(err.to_string().contains("outside its target"));
    }

    #[test]
    fn rejects_insert_select() {
        assert!(validate_write_stmts(
            &parser(),
            1337,
            "INSERT INTO foo_1337_1 SELECT * FROM foo_1337_1"
        )
        .is_err());
    }

    #[test]
    fn rejects_returning_and_conflict_clauses() {
        assert!(validate_write_stmts(
            &parser(),
            1337,
            "INSERT INTO foo_1337_1 VALUES (1) RETURNING id"
        )
        .is_err());
        assert!(validate_write_stmts(
            &parser(),
            1337,
            "INSERT OR REPLACE INTO foo_1337_1 VALUES (1)"
        )
        .is_err());
    }

    #[test]
    fn classifies_grant_and_revoke() {
        let (table, stmts) = mutations(
            r#"GRANT insert, update ON foo_1337_1 TO "0xB451cEC2F543933ee8e6Ed2c28211eB14EDD1b5f""#,
        );
        assert_eq!(table.table_id, 1);
        assert_eq!(
            stmts[0].kind,
            WriteKind::Grant {
                grantee: "0xb451cec2f543933ee8e6ed2c28211eb14edd1b5f".to_string(),
                privileges: Privileges(PRIV_INSERT | PRIV_UPDATE),
            }
        );

        let (_, stmts) = mutations(
            r#"REVOKE delete ON foo_1337_1 FROM "0xB451cEC2F543933ee8e6Ed2c28211eB14EDD1b5f""#,
        );
        assert_eq!(
            stmts[0].kind,
            WriteKind::Revoke {
                grantee: "0xb451cec2f543933ee8e6ed2c28211eb14edd1b5f".to_string(),
                privileges: Privileges(PRIV_DELETE),
            }
        );
    }

    #[test]
    fn rejects_unsupported_privileges() {
        assert!(validate_write_stmts(
            &parser(),
            1337,
            r#"GRANT select ON foo_1337_1 TO "0xB451cEC2F543933ee8e6Ed2c28211eB14EDD1b5f""#
        )
        .is_err());
        assert!(validate_write_stmts(
            &parser(),
            1337,
            r#"GRANT ALL ON foo_1337_1 TO "0xB451cEC2F543933ee8e6Ed2c28211eB14EDD1b5f""#
        )
        .is_err());
    }

    #[test]
    fn rejects_system_table_writes() {
        assert!(validate_write_stmts(
            &parser(),
            1337,
            "INSERT INTO system_acl VALUES (1)"
        )
        .is_err());
        assert!(validate_write_stmts(&parser(), 1337, "DELETE FROM registry").is_err());
    }

    #[test]
    fn rejects_nondeterministic_writes() {
        assert!(validate_write_stmts(
            &parser(),
            1337,
            "INSERT INTO foo_1337_1 VALUES (random())"
        )
        .is_err());
        assert!(validate_write_stmts(
            &parser(),
            1337,
            "UPDATE foo_1337_1 SET ts = current_timestamp"
        )
        .is_err());
    }

    #[test]
    fn routes_create_to_normalizer() {
        let create =
            validate_write_stmts(&parser(), 1337, "CREATE TABLE foo_1337 (bar INT)")
                .unwrap();
        match create {
            WriteStmts::Create(c) => assert_eq!(c.prefix, "foo"),
            _ => panic!("expected create"),
        }
    }

    #[test]
    fn rejects_create_mixed_with_mutations() {
        assert!(validate_write_stmts(
            &parser(),
            1337,
            "CREATE TABLE foo_1337 (bar INT); INSERT INTO foo_1337_1 VALUES (1)"
        )
        .is_err());
    }
}

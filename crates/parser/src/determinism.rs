//! Determinism and reference checks shared by the read and write paths.
//!
//! Every validator node must evaluate an accepted statement to the same
//! result, so anything that depends on host time, randomness, connection
//! state or unbound parameters is rejected here.

use std::ops::ControlFlow;

use sqlparser::ast::{
    visit_expressions, visit_relations, Expr, GroupByExpr, ObjectName, Query, SetExpr,
    Statement, Value,
};

use tabledger_core::error::{Error, Result};

use crate::StatementParser;

/// Functions whose result depends on host state rather than table state
const NONDETERMINISTIC_FUNCTIONS: &[&str] = &[
    "random",
    "randomblob",
    "changes",
    "total_changes",
    "last_insert_rowid",
    "date",
    "time",
    "datetime",
    "julianday",
    "unixepoch",
    "strftime",
    "current_date",
    "current_time",
    "current_timestamp",
    "sqlite_version",
    "sqlite_source_id",
    "load_extension",
];

/// Reject non-deterministic expressions anywhere in the statement
pub(crate) fn check_statement_determinism(stmt: &Statement) -> Result<()> {
    check_expressions(stmt)
}

/// Reject non-deterministic expressions in any visitable AST node
pub(crate) fn check_expressions<N: sqlparser::ast::Visit>(node: &N) -> Result<()> {
    let flow = visit_expressions(node, |expr| {
        if let Some(reason) = nondeterministic_reason(expr) {
            return ControlFlow::Break(Error::parse(reason));
        }
        ControlFlow::Continue(())
    });
    match flow {
        ControlFlow::Break(err) => Err(err),
        ControlFlow::Continue(()) => Ok(()),
    }
}

/// Aggregate functions whose multi-row output order (or, for
/// `group_concat`, whose value) depends on evaluation order
const AGGREGATE_FUNCTIONS: &[&str] = &[
    "avg",
    "count",
    "group_concat",
    "max",
    "min",
    "sum",
    "total",
];

/// Whether the statement calls an aggregate function anywhere
pub(crate) fn has_aggregation(stmt: &Statement) -> bool {
    visit_expressions(stmt, |expr| {
        if let Expr::Function(func) = expr {
            let name = func
                .name
                .0
                .last()
                .map(|ident| ident.value.to_ascii_lowercase())
                .unwrap_or_default();
            if AGGREGATE_FUNCTIONS.contains(&name.as_str()) {
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    })
    .is_break()
}

/// Whether any SELECT in the query body carries a GROUP BY clause
pub(crate) fn query_has_group_by(query: &Query) -> bool {
    set_expr_has_group_by(&query.body)
}

fn set_expr_has_group_by(body: &SetExpr) -> bool {
    match body {
        SetExpr::Select(select) => match &select.group_by {
            GroupByExpr::All => true,
            GroupByExpr::Expressions(exprs) => !exprs.is_empty(),
        },
        SetExpr::Query(query) => set_expr_has_group_by(&query.body),
        SetExpr::SetOperation { left, right, .. } => {
            set_expr_has_group_by(left) || set_expr_has_group_by(right)
        }
        _ => false,
    }
}

fn nondeterministic_reason(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Function(func) => {
            let name = func
                .name
                .0
                .last()
                .map(|ident| ident.value.to_ascii_lowercase())
                .unwrap_or_default();
            if NONDETERMINISTIC_FUNCTIONS.contains(&name.as_str()) {
                return Some(format!("non-deterministic function: {name}"));
            }
            None
        }
        Expr::Value(Value::Placeholder(p)) => {
            Some(format!("bind parameter '{p}' is not allowed"))
        }
        _ => None,
    }
}

/// Collect every table referenced by the statement, including inside CTEs
/// and subqueries, and reject references to reserved prefixes.
pub(crate) fn collect_relations(
    parser: &StatementParser,
    stmt: &Statement,
) -> Result<Vec<String>> {
    let mut tables: Vec<String> = Vec::new();
    let flow = visit_relations(stmt, |relation: &ObjectName| {
        let name = relation
            .0
            .last()
            .map(|ident| ident.value.clone())
            .unwrap_or_default();
        if parser.is_reserved(&name) {
            return ControlFlow::Break(Error::parse(format!(
                "query references reserved table: {name}"
            )));
        }
        if !tables.contains(&name) {
            tables.push(name);
        }
        ControlFlow::Continue(())
    });
    match flow {
        ControlFlow::Break(err) => Err(err),
        ControlFlow::Continue(()) => Ok(tables),
    }
}

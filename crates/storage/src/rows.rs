//! Dynamic decoding of query result rows.
//!
//! Gateway reads execute user-written SELECTs, so column types are only
//! known at runtime. Cells are decoded by the value's SQLite storage class;
//! text that parses as a JSON object or array is surfaced as a raw JSON
//! fragment.

use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Row, TypeInfo, ValueRef};

use tabledger_core::types::{Column as OutColumn, ColumnValue, TableData};
use tabledger_core::{Error, Result};

/// Decode a full result set
pub fn table_data(rows: &[SqliteRow]) -> Result<TableData> {
    let columns = match rows.first() {
        Some(row) => row
            .columns()
            .iter()
            .map(|c| OutColumn { name: c.name().to_string() })
            .collect(),
        None => Vec::new(),
    };

    let mut out_rows = Vec::with_capacity(rows.len());
    for row in rows {
        out_rows.push(decode_row(row)?);
    }

    Ok(TableData { columns, rows: out_rows })
}

/// Decode one row cell by cell
pub fn decode_row(row: &SqliteRow) -> Result<Vec<ColumnValue>> {
    let mut values = Vec::with_capacity(row.columns().len());
    for index in 0..row.columns().len() {
        values.push(decode_cell(row, index)?);
    }
    Ok(values)
}

fn decode_cell(row: &SqliteRow, index: usize) -> Result<ColumnValue> {
    let raw = row
        .try_get_raw(index)
        .map_err(|e| Error::storage(format!("column {index} unreadable: {e}")))?;
    if raw.is_null() {
        return Ok(ColumnValue::Null);
    }
    let type_name = raw.type_info().name().to_uppercase();

    let value = match type_name.as_str() {
        "INTEGER" | "INT4" | "INT8" => ColumnValue::Integer(get(row, index)?),
        "BOOLEAN" => ColumnValue::Bool(get(row, index)?),
        "REAL" | "NUMERIC" => ColumnValue::Float(get(row, index)?),
        "BLOB" => ColumnValue::Bytes(get(row, index)?),
        // TEXT and date-like decl types are stored as text.
        _ => text_value(get(row, index)?),
    };
    Ok(value)
}

fn get<'r, T: sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>>(
    row: &'r SqliteRow,
    index: usize,
) -> Result<T> {
    row.try_get(index)
        .map_err(|e| Error::storage(format!("column {index} decode failed: {e}")))
}

fn text_value(text: String) -> ColumnValue {
    let trimmed = text.trim_start();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) {
            if value.is_object() || value.is_array() {
                return ColumnValue::Json(value);
            }
        }
    }
    ColumnValue::Text(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_detection_requires_valid_json() {
        assert_eq!(
            text_value(r#"{"a": 1}"#.to_string()),
            ColumnValue::Json(serde_json::json!({"a": 1}))
        );
        assert_eq!(
            text_value("[1, 2]".to_string()),
            ColumnValue::Json(serde_json::json!([1, 2]))
        );
        assert_eq!(
            text_value("{not json".to_string()),
            ColumnValue::Text("{not json".to_string())
        );
        assert_eq!(text_value("plain".to_string()), ColumnValue::Text("plain".to_string()));
    }
}

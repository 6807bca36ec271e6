//! Generic JSON <-> SQLite mapping for the hosted tables.
//!
//! Column and table names are never taken from the request verbatim; they are
//! checked against [`Table::columns`] before being spliced into SQL. Values
//! always travel as bound parameters.

use chrono::Utc;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, OptionalExtension, Row};
use serde_json::{Map, Value};

use site_common::{Direction, RecordQuery, Table};

use crate::error::{ApiError, Result};

/// Columns stored as 0/1 and exposed as JSON booleans.
const BOOL_COLUMNS: &[&str] = &["published"];

fn is_bool_column(column: &str) -> bool {
    BOOL_COLUMNS.contains(&column)
}

pub fn check_column(table: Table, column: &str) -> Result<()> {
    if table.has_column(column) {
        Ok(())
    } else {
        Err(ApiError::Validation(format!(
            "Could not find the '{}' column of '{}'",
            column, table
        )))
    }
}

/// Convert a JSON body value into a bound parameter for `column`.
pub fn json_to_sql(column: &str, value: &Value) -> Result<SqlValue> {
    if is_bool_column(column) {
        return match value {
            Value::Bool(b) => Ok(SqlValue::Integer(i64::from(*b))),
            Value::Number(n) => Ok(SqlValue::Integer(i64::from(n.as_i64() != Some(0)))),
            Value::String(s) => filter_to_sql(column, s),
            Value::Null => Ok(SqlValue::Null),
            _ => Err(ApiError::Validation(format!("Expected a boolean for '{}'", column))),
        };
    }

    match value {
        Value::Null => Ok(SqlValue::Null),
        Value::String(s) => Ok(SqlValue::Text(s.clone())),
        Value::Bool(b) => Ok(SqlValue::Text(b.to_string())),
        Value::Number(n) => Ok(SqlValue::Text(n.to_string())),
        Value::Array(_) | Value::Object(_) => Err(ApiError::Validation(format!(
            "Nested values are not supported for '{}'",
            column
        ))),
    }
}

/// Convert a query-string filter value into a bound parameter for `column`.
pub fn filter_to_sql(column: &str, raw: &str) -> Result<SqlValue> {
    if is_bool_column(column) {
        return match raw {
            "true" | "1" => Ok(SqlValue::Integer(1)),
            "false" | "0" => Ok(SqlValue::Integer(0)),
            other => Err(ApiError::Validation(format!(
                "Invalid boolean for '{}': {}",
                column, other
            ))),
        };
    }
    Ok(SqlValue::Text(raw.to_string()))
}

fn sql_to_json(column: &str, value: SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(n) if is_bool_column(column) => Value::Bool(n != 0),
        SqlValue::Integer(n) => Value::from(n),
        SqlValue::Real(f) => Value::from(f),
        SqlValue::Text(s) => Value::String(s),
        SqlValue::Blob(b) => Value::String(String::from_utf8_lossy(&b).into_owned()),
    }
}

fn row_to_json(table: Table, row: &Row<'_>) -> rusqlite::Result<Value> {
    let mut object = Map::new();
    for (i, column) in table.columns().iter().enumerate() {
        let value: SqlValue = row.get(i)?;
        object.insert(column.to_string(), sql_to_json(column, value));
    }
    Ok(Value::Object(object))
}

/// `WHERE` clause and parameters for the equality filters of `query`.
fn where_clause(table: Table, query: &RecordQuery) -> Result<(String, Vec<SqlValue>)> {
    if query.filters.is_empty() {
        return Ok((String::new(), Vec::new()));
    }

    let mut parts = Vec::with_capacity(query.filters.len());
    let mut params = Vec::with_capacity(query.filters.len());
    for (i, (column, raw)) in query.filters.iter().enumerate() {
        check_column(table, column)?;
        parts.push(format!("{} = ?{}", column, i + 1));
        params.push(filter_to_sql(column, raw)?);
    }
    Ok((format!(" WHERE {}", parts.join(" AND ")), params))
}

pub fn select(conn: &Connection, table: Table, query: &RecordQuery) -> Result<Vec<Value>> {
    let (filter, params) = where_clause(table, query)?;
    let mut sql = format!("SELECT {} FROM {}{}", table.columns().join(", "), table, filter);

    if let Some((column, direction)) = &query.order {
        check_column(table, column)?;
        let direction = match direction {
            Direction::Asc => "ASC",
            Direction::Desc => "DESC",
        };
        sql.push_str(&format!(" ORDER BY {} {}", column, direction));
    }
    if let Some(limit) = query.limit {
        sql.push_str(&format!(" LIMIT {}", limit));
    }

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(params), |row| row_to_json(table, row))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn find_by_id(conn: &Connection, table: Table, id: &str) -> Result<Option<Value>> {
    let sql = format!(
        "SELECT {} FROM {} WHERE id = ?1",
        table.columns().join(", "),
        table
    );
    Ok(conn
        .query_row(&sql, [id], |row| row_to_json(table, row))
        .optional()?)
}

/// Fill `id` and timestamps the client left out.
pub fn fill_defaults(table: Table, row: &mut Map<String, Value>) {
    let now = Utc::now().to_rfc3339();
    if !row.get("id").is_some_and(|v| !v.is_null()) {
        row.insert("id".to_string(), Value::String(uuid::Uuid::new_v4().to_string()));
    }
    for column in ["created_at", "updated_at"] {
        if table.has_column(column) && !row.get(column).is_some_and(|v| !v.is_null()) {
            row.insert(column.to_string(), Value::String(now.clone()));
        }
    }
}

pub fn insert(conn: &Connection, table: Table, row: &Map<String, Value>) -> Result<Value> {
    let mut columns = Vec::with_capacity(row.len());
    let mut params = Vec::with_capacity(row.len());
    for column in table.columns() {
        if let Some(value) = row.get(*column) {
            columns.push(*column);
            params.push(json_to_sql(column, value)?);
        }
    }

    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        table,
        columns.join(", "),
        placeholders.join(", ")
    );
    conn.execute(&sql, params_from_iter(params))?;

    let id = row.get("id").and_then(Value::as_str).unwrap_or_default();
    find_by_id(conn, table, id)?
        .ok_or_else(|| ApiError::Internal(format!("inserted row {} vanished from {}", id, table)))
}

/// Apply `patch` to the row with `id`. Returns the row after the update.
pub fn update_by_id(
    conn: &Connection,
    table: Table,
    id: &str,
    patch: &Map<String, Value>,
) -> Result<Value> {
    let mut assignments = Vec::with_capacity(patch.len());
    let mut params = Vec::with_capacity(patch.len() + 1);
    for column in table.columns() {
        if let Some(value) = patch.get(*column) {
            params.push(json_to_sql(column, value)?);
            assignments.push(format!("{} = ?{}", column, params.len()));
        }
    }

    if !assignments.is_empty() {
        params.push(SqlValue::Text(id.to_string()));
        let sql = format!(
            "UPDATE {} SET {} WHERE id = ?{}",
            table,
            assignments.join(", "),
            params.len()
        );
        conn.execute(&sql, params_from_iter(params))?;
    }

    find_by_id(conn, table, id)?
        .ok_or_else(|| ApiError::NotFound(format!("Row {} not found in {}", id, table)))
}

pub fn delete_by_id(conn: &Connection, table: Table, id: &str) -> Result<()> {
    conn.execute(&format!("DELETE FROM {} WHERE id = ?1", table), [id])?;
    Ok(())
}

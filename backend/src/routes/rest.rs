//! Record routes (`/rest/v1/{table}`).
//!
//! Filters use the `column=eq.value` form; `order=column.asc|desc` and
//! `limit=n` shape reads. `POST` with `on_conflict=id` (or a `Prefer:
//! resolution=...` header) upserts; `resolution=ignore-duplicates` keeps the
//! existing row, anything else merges.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::get,
    Json, Router,
};
use serde_json::{Map, Value};

use site_common::{RecordQuery, Table};

use crate::error::{ApiError, Result};
use crate::records::Conflict;
use crate::AppState;

/// Query keys that are not filters.
const NON_FILTER_KEYS: &[&str] = &["on_conflict", "select"];

type Params = Query<Vec<(String, String)>>;

fn parse_table(name: &str) -> Result<Table> {
    Table::from_name(name)
        .ok_or_else(|| ApiError::NotFound(format!("relation \"{}\" does not exist", name)))
}

fn parse_query(params: &[(String, String)]) -> Result<RecordQuery> {
    RecordQuery::from_pairs(
        params.iter().map(|(k, v)| (k.as_str(), v.as_str())),
        NON_FILTER_KEYS,
    )
    .map_err(ApiError::Validation)
}

/// Bulk writes without a filter are refused.
fn require_filter(query: &RecordQuery) -> Result<()> {
    if query.filters.is_empty() {
        return Err(ApiError::Validation(
            "A filter is required for this operation".to_string(),
        ));
    }
    Ok(())
}

fn conflict_mode(params: &[(String, String)], headers: &HeaderMap) -> Result<Option<Conflict>> {
    let on_conflict = params.iter().find(|(k, _)| k == "on_conflict").map(|(_, v)| v.as_str());
    if let Some(column) = on_conflict {
        if column != "id" {
            return Err(ApiError::Validation(format!(
                "on_conflict is only supported for 'id', got '{}'",
                column
            )));
        }
    }

    let prefer = headers
        .get("prefer")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let resolution = prefer
        .split(',')
        .filter_map(|part| part.trim().strip_prefix("resolution="))
        .next();

    Ok(match resolution {
        Some("ignore-duplicates") => Some(Conflict::Ignore),
        Some(_) => Some(Conflict::Merge),
        None => on_conflict.map(|_| Conflict::Merge),
    })
}

fn into_rows(body: Value) -> Result<Vec<Map<String, Value>>> {
    match body {
        Value::Object(row) => Ok(vec![row]),
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::Object(row) => Ok(row),
                _ => Err(ApiError::Validation("Expected an array of objects".to_string())),
            })
            .collect(),
        _ => Err(ApiError::Validation(
            "Expected an object or an array of objects".to_string(),
        )),
    }
}

/// GET /rest/v1/{table}
async fn select_rows(
    State(state): State<Arc<AppState>>,
    Path(table): Path<String>,
    Query(params): Params,
) -> Result<Json<Vec<Value>>> {
    let table = parse_table(&table)?;
    let query = parse_query(&params)?;
    state.records.select(table, &query).map(Json)
}

/// POST /rest/v1/{table}
async fn insert_rows(
    State(state): State<Arc<AppState>>,
    Path(table): Path<String>,
    Query(params): Params,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<Vec<Value>>)> {
    let table = parse_table(&table)?;
    let conflict = conflict_mode(&params, &headers)?;
    let caller = state.identity.authenticate_optional(&headers)?;
    let rows = state
        .records
        .insert(table, caller.as_ref(), into_rows(body)?, conflict)?;
    Ok((StatusCode::CREATED, Json(rows)))
}

/// PATCH /rest/v1/{table}
async fn update_rows(
    State(state): State<Arc<AppState>>,
    Path(table): Path<String>,
    Query(params): Params,
    headers: HeaderMap,
    Json(patch): Json<Map<String, Value>>,
) -> Result<Json<Vec<Value>>> {
    let table = parse_table(&table)?;
    let query = parse_query(&params)?;
    require_filter(&query)?;
    let caller = state.identity.authenticate(&headers)?;
    state.records.update(table, &caller, &query, patch).map(Json)
}

/// DELETE /rest/v1/{table}
async fn delete_rows(
    State(state): State<Arc<AppState>>,
    Path(table): Path<String>,
    Query(params): Params,
    headers: HeaderMap,
) -> Result<Json<Vec<Value>>> {
    let table = parse_table(&table)?;
    let query = parse_query(&params)?;
    require_filter(&query)?;
    let caller = state.identity.authenticate(&headers)?;
    state.records.delete(table, &caller, &query).map(Json)
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            "/:table",
            get(select_rows)
                .post(insert_rows)
                .patch(update_rows)
                .delete(delete_rows),
        )
        .with_state(state)
}

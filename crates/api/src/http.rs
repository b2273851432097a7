//! HTTP surface of the gateway, versioned under `/api/v1`.
//!
//! Every non-2xx response carries the JSON envelope `{ "message": ... }`.

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use tabledger_core::config::GatewayConfig;
use tabledger_core::types::{ColumnValue, TableData};
use tabledger_core::Error;
use tabledger_storage::GatewayStore;

use crate::metadata;

/// Shared state of the HTTP handlers
#[derive(Clone)]
pub struct GatewayState {
    store: GatewayStore,
    config: GatewayConfig,
}

impl GatewayState {
    pub fn new(store: GatewayStore, config: GatewayConfig) -> Self {
        Self { store, config }
    }
}

/// Build the gateway router
pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/api/v1/query", get(run_query))
        .route("/api/v1/tables/:chain_id/:table_id", get(table_metadata))
        .route("/api/v1/receipt/:chain_id/:txn_hash", get(txn_receipt))
        .route("/healthz", get(health))
        .route("/health", get(health))
        .route("/version", get(version))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Error response carrying the JSON envelope
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self { status: StatusCode::BAD_REQUEST, message: message.into() }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self { status: StatusCode::NOT_FOUND, message: message.into() }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::Parse(_) | Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Acl(_) => StatusCode::FORBIDDEN,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self { status, message: err.to_string() }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "message": self.message }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct QueryParams {
    statement: String,

    #[serde(default = "default_format")]
    format: String,

    #[serde(default)]
    unwrap: u8,

    #[serde(default)]
    extract: u8,
}

fn default_format() -> String {
    "objects".to_string()
}

/// `GET /api/v1/query?statement=...&format={objects|table}&unwrap={0|1}&extract={0|1}`
async fn run_query(
    State(state): State<GatewayState>,
    Query(params): Query<QueryParams>,
) -> Result<Response, ApiError> {
    let data = state.store.run_read(&params.statement).await?;

    match params.format.as_str() {
        "table" => {
            if params.unwrap != 0 || params.extract != 0 {
                return Err(ApiError::bad_request(
                    "unwrap and extract require format=objects",
                ));
            }
            Ok(Json(&data).into_response())
        }
        "objects" => objects_response(&data, params.extract != 0, params.unwrap != 0),
        other => Err(ApiError::bad_request(format!("unknown format '{other}'"))),
    }
}

/// Render rows as objects, optionally extracting single-column values and
/// optionally unwrapping into newline-delimited JSON.
fn objects_response(
    data: &TableData,
    extract: bool,
    unwrap: bool,
) -> Result<Response, ApiError> {
    let values: Vec<serde_json::Value> = if extract {
        if data.columns.len() != 1 {
            return Err(ApiError::bad_request(format!(
                "extract requires a single column, the query returned {}",
                data.columns.len()
            )));
        }
        data.rows.iter().map(|row| column_value_json(&row[0])).collect()
    } else {
        data.rows
            .iter()
            .map(|row| {
                let object: serde_json::Map<String, serde_json::Value> = data
                    .columns
                    .iter()
                    .zip(row.iter())
                    .map(|(column, value)| (column.name.clone(), column_value_json(value)))
                    .collect();
                serde_json::Value::Object(object)
            })
            .collect()
    };

    if unwrap {
        let lines = values
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join("\n");
        Ok((
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/jsonl")],
            lines,
        )
            .into_response())
    } else {
        Ok(Json(values).into_response())
    }
}

fn column_value_json(value: &ColumnValue) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
}

/// `GET /api/v1/tables/{chain_id}/{table_id}`
async fn table_metadata(
    State(state): State<GatewayState>,
    Path((chain_id, table_id)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let chain_id = parse_id(&chain_id, "chain id")?;
    let table_id = parse_id(&table_id, "table id")?;

    let entry = state.store.get_table(chain_id, table_id).await?;
    let metadata = metadata::table_metadata(&state.store, &state.config, &entry).await?;
    Ok(Json(metadata).into_response())
}

/// `GET /api/v1/receipt/{chain_id}/{txn_hash}`
async fn txn_receipt(
    State(state): State<GatewayState>,
    Path((chain_id, txn_hash)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let chain_id = parse_id(&chain_id, "chain id")?;

    match state.store.get_receipt(chain_id, &txn_hash).await? {
        Some(receipt) => Ok(Json(receipt).into_response()),
        None => Err(ApiError::not_found(format!("no receipt for {txn_hash}"))),
    }
}

fn parse_id(raw: &str, what: &str) -> Result<u64, ApiError> {
    raw.parse::<u64>()
        .map_err(|_| ApiError::bad_request(format!("malformed {what}: '{raw}'")))
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn version() -> Json<serde_json::Value> {
    Json(json!({
        "binary": "tabledger",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

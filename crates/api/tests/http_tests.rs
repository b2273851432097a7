//! Gateway HTTP tests against an in-memory database.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use tower::ServiceExt;

use tabledger_api::http::{router, GatewayState};
use tabledger_core::config::GatewayConfig;
use tabledger_core::parser::SqlParser;
use tabledger_core::types::{DecodedEvent, TableEvent, TxnEvents};
use tabledger_parser::StatementParser;
use tabledger_storage::{Executor, GatewayStore, SqliteDb};

const CHAIN: u64 = 1337;
const OWNER: &str = "0xb451cec2f543933ee8e6ed2c28211eb14edd1b5f";

async fn app() -> Router {
    let db = SqliteDb::in_memory().await.unwrap();
    let parser: Arc<dyn SqlParser> = Arc::new(StatementParser::default());
    let executor = Executor::new(db.clone(), parser.clone(), 100);

    // Seed committed state: one table with two rows plus a failed txn.
    let mut scope = executor.open_block_scope(CHAIN, 1, 1_700_000_000).await.unwrap();
    for (hash, event) in [
        (
            "0xcreate",
            TableEvent::CreateTable {
                owner: OWNER.to_string(),
                table_id: 1,
                statement: "create table healthbot_1337 (counter int, payload text)".to_string(),
            },
        ),
        (
            "0xwrite",
            TableEvent::RunSql {
                caller: OWNER.to_string(),
                is_owner: true,
                table_id: 1,
                statement: "INSERT INTO healthbot_1337_1 VALUES (1, '{\"a\": 1}'); \
                            INSERT INTO healthbot_1337_1 VALUES (2, 'plain')"
                    .to_string(),
            },
        ),
        (
            "0xdenied",
            TableEvent::RunSql {
                caller: "0x2222222222222222222222222222222222222222".to_string(),
                is_owner: false,
                table_id: 1,
                statement: "DELETE FROM healthbot_1337_1".to_string(),
            },
        ),
    ] {
        let txn = TxnEvents {
            txn_hash: hash.to_string(),
            tx_index: 0,
            events: vec![DecodedEvent { log_index: 0, event }],
        };
        executor.execute_txn_events(&mut scope, &txn).await.unwrap();
    }
    executor.commit(scope).await.unwrap();

    let store = GatewayStore::new(db.reader().clone(), parser);
    let config = GatewayConfig {
        external_url_prefix: "https://gateway.example".to_string(),
        metadata_renderer_uri: Some("https://render.example/tables".to_string()),
        ..GatewayConfig::default()
    };
    router(GatewayState::new(store, config))
}

async fn get(app: &Router, uri: &str) -> (StatusCode, serde_json::Value, String) {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let content_type = response
        .headers()
        .get("content-type")
        .map(|v| v.to_str().unwrap().to_string())
        .unwrap_or_default();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&bytes)
        .unwrap_or(serde_json::Value::String(String::from_utf8_lossy(&bytes).to_string()));
    (status, value, content_type)
}

#[tokio::test]
async fn query_returns_objects_by_default() {
    let app = app().await;
    let (status, body, _) = get(
        &app,
        "/api/v1/query?statement=SELECT%20counter%20FROM%20healthbot_1337_1%20ORDER%20BY%20counter",
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, serde_json::json!([{"counter": 1}, {"counter": 2}]));
}

#[tokio::test]
async fn query_table_format_and_json_passthrough() {
    let app = app().await;
    let (status, body, _) = get(
        &app,
        "/api/v1/query?statement=SELECT%20*%20FROM%20healthbot_1337_1%20ORDER%20BY%20counter&format=table",
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body["columns"],
        serde_json::json!([{"name": "counter"}, {"name": "payload"}])
    );
    // Stored JSON text is surfaced as a raw fragment, not a quoted string.
    assert_eq!(body["rows"][0][1], serde_json::json!({"a": 1}));
    assert_eq!(body["rows"][1][1], serde_json::json!("plain"));
}

#[tokio::test]
async fn query_extract_unwraps_single_column_rows() {
    let app = app().await;
    let (status, body, _) = get(
        &app,
        "/api/v1/query?statement=SELECT%20counter%20FROM%20healthbot_1337_1%20ORDER%20BY%20counter&extract=1",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, serde_json::json!([1, 2]));

    // extract over multiple columns is a client error
    let (status, body, _) = get(
        &app,
        "/api/v1/query?statement=SELECT%20*%20FROM%20healthbot_1337_1&extract=1",
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"].as_str().unwrap().contains("single column"));
}

#[tokio::test]
async fn query_unwrap_streams_jsonl() {
    let app = app().await;
    let (status, body, content_type) = get(
        &app,
        "/api/v1/query?statement=SELECT%20counter%20FROM%20healthbot_1337_1%20ORDER%20BY%20counter&unwrap=1",
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(content_type, "application/jsonl");
    let lines: Vec<&str> = body.as_str().unwrap().lines().collect();
    assert_eq!(lines, vec![r#"{"counter":1}"#, r#"{"counter":2}"#]);
}

#[tokio::test]
async fn query_rejects_invalid_statements_with_envelope() {
    let app = app().await;

    let (status, body, _) =
        get(&app, "/api/v1/query?statement=SELECT%20*%20FROM%20system_acl").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"].as_str().unwrap().contains("reserved"));

    let (status, _, _) =
        get(&app, "/api/v1/query?statement=DELETE%20FROM%20healthbot_1337_1").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, _) = get(
        &app,
        "/api/v1/query?statement=SELECT%201%20FROM%20healthbot_1337_1&format=parquet",
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn table_metadata_roundtrip() {
    let app = app().await;
    let (status, body, _) = get(&app, "/api/v1/tables/1337/1").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "healthbot_1337_1");
    assert_eq!(
        body["external_url"],
        "https://gateway.example/api/v1/tables/1337/1"
    );
    assert_eq!(body["image"], "https://render.example/tables/1337/1");
    assert_eq!(body["created_at"], 1_700_000_000u64);
    assert_eq!(body["schema"]["columns"][0]["name"], "counter");
    assert_eq!(body["schema"]["columns"][1]["type"], "TEXT");
}

#[tokio::test]
async fn table_metadata_errors() {
    let app = app().await;

    let (status, body, _) = get(&app, "/api/v1/tables/1337/99").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["message"].as_str().unwrap().contains("not found"));

    let (status, _, _) = get(&app, "/api/v1/tables/1337/notanid").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn receipts_cover_success_and_failure() {
    let app = app().await;

    let (status, body, _) = get(&app, "/api/v1/receipt/1337/0xwrite").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["block_number"], 1);
    assert_eq!(body["table_ids"], serde_json::json!([1]));
    assert!(body.get("error").is_none());

    let (status, body, _) = get(&app, "/api/v1/receipt/1337/0xdenied").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["error"].as_str().unwrap().contains("lacks"));
    assert_eq!(body["error_event_idx"], 0);

    let (status, _, _) = get(&app, "/api/v1/receipt/1337/0xmissing").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn health_and_version() {
    let app = app().await;

    let (status, _, _) = get(&app, "/healthz").await;
    assert_eq!(status, StatusCode::OK);
    let (status, _, _) = get(&app, "/health").await;
    assert_eq!(status, StatusCode::OK);

    let (status, body, _) = get(&app, "/version").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["version"].is_string());
}

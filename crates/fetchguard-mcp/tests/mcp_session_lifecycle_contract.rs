//! Exercises the JSON-RPC envelope and session lifecycle end to end through
//! the real router, without ever dispatching a tool call (so no network
//! access is needed): initialize -> tools/list -> delete, plus the
//! documented error paths (spec §6/§7).
mod support;

use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

async fn post_json(app: &axum::Router, body: Value, session: Option<&str>) -> (axum::http::StatusCode, Value, axum::http::HeaderMap) {
    let mut builder = axum::http::Request::builder()
        .method("POST")
        .uri("/mcp")
        .header("content-type", "application/json")
        .header("accept", "application/json, text/event-stream");
    if let Some(id) = session {
        builder = builder.header("mcp-session-id", id);
    }
    let req = builder.body(axum::body::Body::from(body.to_string())).unwrap();
    let resp = app.clone().oneshot(support::with_connect_info(req)).await.unwrap();
    let status = resp.status();
    let headers = resp.headers().clone();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let json: Value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, json, headers)
}

#[tokio::test]
async fn initialize_then_tools_list_then_delete() {
    let app = support::test_router();

    let (status, body, headers) =
        post_json(&app, json!({"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}), None).await;
    assert_eq!(status, axum::http::StatusCode::OK);
    assert!(body["result"]["protocolVersion"].is_string());
    let session_id = headers.get("mcp-session-id").unwrap().to_str().unwrap().to_string();
    assert!(!session_id.is_empty());

    let (status, body, _) =
        post_json(&app, json!({"jsonrpc":"2.0","id":2,"method":"tools/list"}), Some(&session_id)).await;
    assert_eq!(status, axum::http::StatusCode::OK);
    let tools = body["result"]["tools"].as_array().unwrap();
    let names: Vec<&str> = tools.iter().map(|t| t["name"].as_str().unwrap()).collect();
    assert_eq!(names, ["fetch-url", "fetch-markdown", "fetch-links", "fetch-urls"]);

    let req = axum::http::Request::builder()
        .method("DELETE")
        .uri("/mcp")
        .header("mcp-session-id", &session_id)
        .body(axum::body::Body::empty())
        .unwrap();
    let resp = app.clone().oneshot(support::with_connect_info(req)).await.unwrap();
    assert_eq!(resp.status(), axum::http::StatusCode::NO_CONTENT);

    let (status, _, _) =
        post_json(&app, json!({"jsonrpc":"2.0","id":3,"method":"tools/list"}), Some(&session_id)).await;
    assert_eq!(status, axum::http::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn non_initialize_call_without_session_header_is_rejected() {
    let app = support::test_router();
    let (status, body, _) = post_json(&app, json!({"jsonrpc":"2.0","id":1,"method":"tools/list"}), None).await;
    assert_eq!(status, axum::http::StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], -32000);
}

#[tokio::test]
async fn malformed_json_body_is_a_parse_error() {
    let app = support::test_router();
    let req = axum::http::Request::builder()
        .method("POST")
        .uri("/mcp")
        .header("content-type", "application/json")
        .header("accept", "application/json, text/event-stream")
        .body(axum::body::Body::from("not json"))
        .unwrap();
    let resp = app.oneshot(support::with_connect_info(req)).await.unwrap();
    assert_eq!(resp.status(), axum::http::StatusCode::BAD_REQUEST);
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["error"]["code"], -32700);
}

#[tokio::test]
async fn unknown_protocol_version_is_rejected_as_invalid_request() {
    let app = support::test_router();
    let req = axum::http::Request::builder()
        .method("POST")
        .uri("/mcp")
        .header("content-type", "application/json")
        .header("accept", "application/json, text/event-stream")
        .header("mcp-protocol-version", "1999-01-01")
        .body(axum::body::Body::from(json!({"jsonrpc":"2.0","id":1,"method":"initialize"}).to_string()))
        .unwrap();
    let resp = app.oneshot(support::with_connect_info(req)).await.unwrap();
    assert_eq!(resp.status(), axum::http::StatusCode::BAD_REQUEST);
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["error"]["code"], -32600);
}

#[tokio::test]
async fn sse_route_requires_event_stream_accept_header() {
    let app = support::test_router();
    let req = axum::http::Request::builder().method("GET").uri("/mcp").body(axum::body::Body::empty()).unwrap();
    let resp = app.oneshot(support::with_connect_info(req)).await.unwrap();
    assert_eq!(resp.status(), axum::http::StatusCode::NOT_ACCEPTABLE);
}

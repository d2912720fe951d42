//! `GET /health` returns `{"status":"healthy"}` (spec §6).
mod support;

use http_body_util::BodyExt;
use tower::ServiceExt;

#[tokio::test]
async fn health_reports_healthy() {
    let app = support::test_router();
    let req = axum::http::Request::builder().uri("/health").body(axum::body::Body::empty()).unwrap();
    let resp = app.oneshot(support::with_connect_info(req)).await.unwrap();
    assert_eq!(resp.status(), axum::http::StatusCode::OK);

    let body = resp.into_body().collect().await.unwrap().to_bytes();
    let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(v["status"], "healthy");
}

//! Integration tests for the health check endpoint and general HTTP behaviour.

mod common;

use axum::http::StatusCode;
use common::{body_json, test_config, GatedRunner, TestApp};

// ---------------------------------------------------------------------------
// Test: GET /health returns 200 with expected JSON fields
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_check_returns_ok_with_json() {
    let app = TestApp::new(test_config(4), GatedRunner::open());
    let response = app.get("/health").await;

    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert!(json["version"].is_string());
    assert_eq!(json["db_healthy"], true);
}

// ---------------------------------------------------------------------------
// Test: Unknown route returns 404
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unknown_route_returns_404() {
    let app = TestApp::new(test_config(4), GatedRunner::open());
    let response = app.get("/this-route-does-not-exist").await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

// ---------------------------------------------------------------------------
// Test: x-request-id header is present on JSON and streaming responses
// ---------------------------------------------------------------------------

#[tokio::test]
async fn responses_carry_request_id() {
    let app = TestApp::new(test_config(4), GatedRunner::open());

    let response = app.get("/health").await;
    assert!(response.headers().contains_key("x-request-id"));

    let stream = app
        .post_json("/api/v1/simulations", common::valid_request())
        .await;
    assert!(stream.headers().contains_key("x-request-id"));
    common::read_events(stream).await;
}

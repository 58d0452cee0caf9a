//! Shared helpers for gateway integration tests.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::Value;
use tower::ServiceExt;
use ubl_core::store::{IndexStore, MemoryStateStore};
use ubl_core::{ServiceConfig, UblRuntime};
use ubl_gateway::state::AppState;

/// Builds a gateway over in-memory stores.
pub fn test_app() -> (Router, AppState) {
    let runtime = Arc::new(UblRuntime::new(
        ServiceConfig::default(),
        Arc::new(MemoryStateStore::new()),
        Arc::new(IndexStore::in_memory().unwrap()),
    ));
    let state = AppState::new(runtime);
    (ubl_gateway::router(state.clone()), state)
}

/// Header set for the default test user.
pub fn alice_headers() -> Vec<(&'static str, &'static str)> {
    vec![("x-user-id", "u:alice"), ("x-user-email", "alice@ex.com")]
}

/// Drives one request through the router and parses the JSON response.
pub async fn call(
    app: &Router,
    method: &str,
    uri: &str,
    headers: &[(&str, &str)],
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

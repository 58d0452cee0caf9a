//! REST surface tests: envelope fields, bootstrap, sends, receipts,
//! idempotency, and the error taxonomy mappings.

mod common;

use axum::http::StatusCode;
use serde_json::json;

use common::{alice_headers, call, test_app};

#[tokio::test]
async fn whoami_bootstraps_and_echoes_request_id() {
    let (app, _state) = test_app();
    let mut headers = alice_headers();
    headers.push(("x-request-id", "req:whoami-1"));

    let (status, body) = call(&app, "GET", "/api/whoami", &headers, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tenant_id"], "t:ex.com");
    assert_eq!(body["role"], "owner");
    assert_eq!(body["identity"]["user_id"], "u:alice");
    assert_eq!(body["request_id"], "req:whoami-1");
    assert!(body["server_time"].is_string());
}

#[tokio::test]
async fn missing_identity_is_unauthorized() {
    let (app, _state) = test_app();
    let (status, body) = call(&app, "GET", "/api/whoami", &[], None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "unauthorized");
    assert!(body["request_id"].is_string());
}

#[tokio::test]
async fn rooms_create_then_list() {
    let (app, _state) = test_app();
    let headers = alice_headers();

    let (status, body) = call(
        &app,
        "POST",
        "/api/rooms",
        &headers,
        Some(json!({"name": "Ops Team"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["room_id"], "r:ops-team");

    // Idempotent by slug.
    let (status, body) = call(
        &app,
        "POST",
        "/api/rooms",
        &headers,
        Some(json!({"name": "Ops Team"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["room_id"], "r:ops-team");

    let (status, body) = call(&app, "GET", "/api/rooms", &headers, None).await;
    assert_eq!(status, StatusCode::OK);
    let rooms = body["rooms"].as_array().unwrap();
    // r:general from bootstrap plus r:ops-team.
    assert_eq!(rooms.len(), 2);
}

#[tokio::test]
async fn send_message_returns_receipt_and_receipts_endpoint_pairs_atoms() {
    let (app, _state) = test_app();
    let mut headers = alice_headers();
    headers.push(("x-request-id", "req:send-1"));

    let (status, body) = call(
        &app,
        "POST",
        "/api/rooms/r:general/messages",
        &headers,
        Some(json!({
            "type": "text",
            "body": {"text": "hi"},
            "client_request_id": "k1",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let message = &body["message"];
    assert_eq!(message["room_seq"], 2);
    assert_eq!(message["receipt"]["seq"], 3);
    assert_eq!(message["receipt"]["ledger_shard"], "0");

    let receipt_seq = message["receipt"]["seq"].as_u64().unwrap();
    let (status, body) = call(
        &app,
        "GET",
        &format!("/api/receipts/{receipt_seq}"),
        &headers,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let atoms = body["atoms"].as_array().unwrap();
    assert_eq!(atoms.len(), 2);
    assert_eq!(atoms[0]["kind"], "action.v1");
    assert_eq!(atoms[1]["kind"], "effect.v1");
    assert_eq!(atoms[1]["ref_action_cid"], atoms[0]["cid"]);
    assert_eq!(atoms[0]["trace"]["request_id"], "req:send-1");
}

#[tokio::test]
async fn idempotent_replay_returns_identical_message() {
    let (app, _state) = test_app();
    let headers = alice_headers();
    let send = json!({
        "type": "text",
        "body": {"text": "once"},
        "client_request_id": "k-replay",
    });

    let (_, first) = call(
        &app,
        "POST",
        "/api/rooms/r:general/messages",
        &headers,
        Some(send.clone()),
    )
    .await;
    let (status, second) = call(
        &app,
        "POST",
        "/api/rooms/r:general/messages",
        &headers,
        Some(send),
    )
    .await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(first["message"]["msg_id"], second["message"]["msg_id"]);
    assert_eq!(first["message"]["room_seq"], second["message"]["room_seq"]);
    assert_eq!(
        first["message"]["receipt"]["seq"],
        second["message"]["receipt"]["seq"]
    );
}

#[tokio::test]
async fn oversized_message_is_rejected_with_stable_code() {
    let (app, _state) = test_app();
    let headers = alice_headers();
    let big = "x".repeat(9000);

    let (status, body) = call(
        &app,
        "POST",
        "/api/rooms/r:general/messages",
        &headers,
        Some(json!({"type": "text", "body": {"text": big}})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "message_too_large");
}

#[tokio::test]
async fn malformed_body_is_validation_error() {
    let (app, _state) = test_app();
    let headers = alice_headers();
    let (status, body) = call(
        &app,
        "POST",
        "/api/rooms/r:general/messages",
        &headers,
        Some(json!({"type": "carrier-pigeon", "body": {"text": "hi"}})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "validation_error");
}

#[tokio::test]
async fn unknown_room_is_404() {
    let (app, _state) = test_app();
    let headers = alice_headers();
    let (status, body) = call(
        &app,
        "POST",
        "/api/rooms/r:nowhere/messages",
        &headers,
        Some(json!({"type": "text", "body": {"text": "hi"}})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "not_found");
}

#[tokio::test]
async fn history_defaults_and_pages() {
    let (app, _state) = test_app();
    let headers = alice_headers();
    for n in 0..4 {
        call(
            &app,
            "POST",
            "/api/rooms/r:general/messages",
            &headers,
            Some(json!({
                "type": "text",
                "body": {"text": format!("m{n}")},
                "client_request_id": format!("k{n}"),
            })),
        )
        .await;
    }

    let (status, body) = call(
        &app,
        "GET",
        "/api/rooms/r:general/history",
        &headers,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    // System message + 4 sends, ascending.
    let messages = body["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 5);
    assert_eq!(messages[0]["room_seq"], 1);
    assert_eq!(messages[4]["room_seq"], 5);
    assert_eq!(body["next_cursor"], json!(null));

    let (_, page) = call(
        &app,
        "GET",
        "/api/rooms/r:general/history?limit=2&cursor=4",
        &headers,
        None,
    )
    .await;
    let messages = page["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["room_seq"], 2);
    assert_eq!(messages[1]["room_seq"], 3);
    assert_eq!(page["next_cursor"], 2);
}

#[tokio::test]
async fn sse_endpoint_negotiates_event_stream() {
    let (app, _state) = test_app();
    let headers = alice_headers();
    // Bootstrap so r:general exists.
    call(&app, "GET", "/api/whoami", &headers, None).await;

    let request = axum::http::Request::builder()
        .method("GET")
        .uri("/api/events/rooms/r:general?from_seq=0")
        .header("x-user-id", "u:alice")
        .header("x-user-email", "alice@ex.com")
        .body(axum::body::Body::empty())
        .unwrap();
    let response = tower::ServiceExt::oneshot(app.clone(), request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/event-stream"
    );
}

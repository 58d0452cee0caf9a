//! JSON-RPC tool server tests: envelope strictness, the curated tool set,
//! origin enforcement, and REST parity of results.

mod common;

use axum::http::StatusCode;
use serde_json::{json, Value};

use common::{alice_headers, call, test_app};

async fn rpc(
    app: &axum::Router,
    headers: &[(&str, &str)],
    body: Value,
) -> Value {
    let (status, body) = call(app, "POST", "/mcp", headers, Some(body)).await;
    assert_eq!(status, StatusCode::OK);
    body
}

fn rpc_request(id: u64, method: &str, params: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params})
}

#[tokio::test]
async fn initialize_reports_capabilities_and_session() {
    let (app, _state) = test_app();
    let response = rpc(
        &app,
        &alice_headers(),
        rpc_request(1, "initialize", json!({})),
    )
    .await;

    assert_eq!(response["jsonrpc"], "2.0");
    assert_eq!(response["id"], 1);
    let result = &response["result"];
    assert_eq!(result["serverInfo"]["name"], "ubl-gateway");
    assert_eq!(result["capabilities"]["tools"], true);
    assert_eq!(result["capabilities"]["streaming"], true);
    assert!(result["session_id"].as_str().unwrap().starts_with("s:"));

    // A second initialize mints a fresh session.
    let again = rpc(
        &app,
        &alice_headers(),
        rpc_request(2, "initialize", json!({})),
    )
    .await;
    assert_ne!(again["result"]["session_id"], result["session_id"]);
}

#[tokio::test]
async fn tools_list_is_the_curated_seven() {
    let (app, _state) = test_app();
    let response = rpc(
        &app,
        &alice_headers(),
        rpc_request(1, "tools/list", json!({})),
    )
    .await;
    let tools = response["result"]["tools"].as_array().unwrap();
    assert_eq!(tools.len(), 7);
    for tool in tools {
        assert!(tool["name"].is_string());
        assert!(tool["description"].is_string());
        assert_eq!(tool["inputSchema"]["type"], "object");
    }
}

#[tokio::test]
async fn send_via_rpc_matches_rest_shape_and_streams() {
    let (app, state) = test_app();
    let mut headers = alice_headers();
    headers.push(("x-request-id", "req:mcp-1"));

    // Bootstrap, then subscribe before the RPC send.
    call(&app, "GET", "/api/whoami", &headers, None).await;
    let identity = ubl_core::Identity::new("u:alice", "alice@ex.com");
    let mut rx = state
        .runtime
        .subscribe(&identity, "r:general", None, "req:sub")
        .await
        .unwrap();

    let response = rpc(
        &app,
        &headers,
        rpc_request(
            7,
            "tools/call",
            json!({
                "name": "messenger.send",
                "arguments": {
                    "room_id": "r:general",
                    "type": "text",
                    "body": {"text": "via mcp"},
                },
            }),
        ),
    )
    .await;

    let content = &response["result"]["content"][0];
    assert_eq!(content["type"], "json");
    let message = &content["json"]["message"];
    assert_eq!(message["room_seq"], 2);
    assert_eq!(message["body"]["text"], "via mcp");

    // The SSE subscriber observed the same message with the same receipt.
    let event = rx.recv().await.unwrap();
    assert_eq!(event.event, "message.created");
    assert_eq!(event.data["message"]["receipt"], message["receipt"]);

    // The action atom carries the caller's request id.
    let seq = message["receipt"]["seq"].as_u64().unwrap();
    let atoms = state
        .runtime
        .get_receipt(&identity, seq, "req:check")
        .await
        .unwrap();
    let ubl_core::Atom::Action(action) = &atoms[0] else {
        panic!("expected action");
    };
    assert_eq!(action.trace.request_id, "req:mcp-1");
}

#[tokio::test]
async fn history_and_office_tools_round_trip() {
    let (app, _state) = test_app();
    let headers = alice_headers();

    rpc(
        &app,
        &headers,
        rpc_request(
            1,
            "tools/call",
            json!({
                "name": "messenger.send",
                "arguments": {
                    "room_id": "r:general",
                    "type": "text",
                    "body": {"text": "hello"},
                    "client_request_id": "k1",
                },
            }),
        ),
    )
    .await;

    let history = rpc(
        &app,
        &headers,
        rpc_request(
            2,
            "tools/call",
            json!({
                "name": "messenger.history",
                "arguments": {"room_id": "r:general"},
            }),
        ),
    )
    .await;
    let messages = history["result"]["content"][0]["json"]["messages"]
        .as_array()
        .unwrap();
    assert_eq!(messages.len(), 2);

    let created = rpc(
        &app,
        &headers,
        rpc_request(
            3,
            "tools/call",
            json!({
                "name": "office.document.create",
                "arguments": {
                    "workspace_id": "w:research",
                    "title": "Plan",
                    "content": "ship it",
                },
            }),
        ),
    )
    .await;
    let document = &created["result"]["content"][0]["json"]["document"];
    let document_id = document["document_id"].as_str().unwrap();
    assert!(document["receipt"]["seq"].is_u64());

    let fetched = rpc(
        &app,
        &headers,
        rpc_request(
            4,
            "tools/call",
            json!({
                "name": "office.document.get",
                "arguments": {"workspace_id": "w:research", "document_id": document_id},
            }),
        ),
    )
    .await;
    assert_eq!(
        fetched["result"]["content"][0]["json"]["document"]["content"],
        "ship it"
    );

    let searched = rpc(
        &app,
        &headers,
        rpc_request(
            5,
            "tools/call",
            json!({
                "name": "office.document.search",
                "arguments": {"workspace_id": "w:research", "query": "SHIP"},
            }),
        ),
    )
    .await;
    assert_eq!(
        searched["result"]["content"][0]["json"]["documents"]
            .as_array()
            .unwrap()
            .len(),
        1
    );

    let completion = rpc(
        &app,
        &headers,
        rpc_request(
            6,
            "tools/call",
            json!({
                "name": "office.llm.complete",
                "arguments": {"workspace_id": "w:research", "prompt": "a b c"},
            }),
        ),
    )
    .await;
    let usage = &completion["result"]["content"][0]["json"]["usage"];
    assert_eq!(usage["prompt_tokens"], 3);
    assert_eq!(usage["completion_tokens"], 20);
}

#[tokio::test]
async fn unknown_method_and_tool_are_32601() {
    let (app, _state) = test_app();
    let response = rpc(
        &app,
        &alice_headers(),
        rpc_request(1, "resources/list", json!({})),
    )
    .await;
    assert_eq!(response["error"]["code"], -32601);

    let response = rpc(
        &app,
        &alice_headers(),
        rpc_request(
            2,
            "tools/call",
            json!({"name": "messenger.delete_everything", "arguments": {}}),
        ),
    )
    .await;
    assert_eq!(response["error"]["code"], -32601);
}

#[tokio::test]
async fn invalid_params_are_32602() {
    let (app, _state) = test_app();
    let response = rpc(
        &app,
        &alice_headers(),
        rpc_request(
            1,
            "tools/call",
            json!({"name": "messenger.send", "arguments": {"body": {"text": "no room"}}}),
        ),
    )
    .await;
    assert_eq!(response["error"]["code"], -32602);
}

#[tokio::test]
async fn wrong_version_is_invalid_request() {
    let (app, _state) = test_app();
    let response = rpc(
        &app,
        &alice_headers(),
        json!({"jsonrpc": "1.0", "id": 1, "method": "tools/list"}),
    )
    .await;
    assert_eq!(response["error"]["code"], -32600);
}

#[tokio::test]
async fn foreign_origin_is_rejected_browser_only() {
    let (app, _state) = test_app();
    let mut headers = alice_headers();
    headers.push(("origin", "https://evil.example"));
    let response = rpc(&app, &headers, rpc_request(1, "tools/list", json!({}))).await;
    assert_eq!(response["error"]["code"], -32003);

    // An allowlisted origin passes.
    let mut headers = alice_headers();
    headers.push(("origin", "http://localhost:8787"));
    let response = rpc(&app, &headers, rpc_request(2, "tools/list", json!({}))).await;
    assert!(response.get("result").is_some());

    // Absent Origin (non-browser client) is always allowed.
    let response = rpc(&app, &alice_headers(), rpc_request(3, "tools/list", json!({}))).await;
    assert!(response.get("result").is_some());
}

#[tokio::test]
async fn missing_identity_is_32001() {
    let (app, _state) = test_app();
    let response = rpc(&app, &[], rpc_request(1, "tools/list", json!({}))).await;
    assert_eq!(response["error"]["code"], -32001);
}

#[tokio::test]
async fn mcp_get_is_an_event_stream() {
    let (app, _state) = test_app();
    let request = axum::http::Request::builder()
        .method("GET")
        .uri("/mcp?session_id=s:test")
        .body(axum::body::Body::empty())
        .unwrap();
    let response = tower::ServiceExt::oneshot(app.clone(), request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/event-stream"
    );
}

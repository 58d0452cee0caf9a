//! JSON-RPC 2.0 tool server at `/mcp`.
//!
//! Exposes a curated tool set isomorphic to the REST surface: same
//! identity, same coordinators, same receipt shapes. Strict 2.0 envelope;
//! unknown methods and tools are `-32601`, malformed params `-32602`.
//!
//! When an `Origin` header is present it must match the configured
//! allowlist (`-32003` otherwise); an absent Origin — non-browser clients —
//! is allowed. This defends against DNS rebinding.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;
use ubl_core::room::SendMessageInput;
use ubl_core::ApiError;

use crate::envelope::{identity_from_headers, request_id_from};
use crate::state::AppState;

/// The only protocol version accepted.
const JSONRPC_VERSION: &str = "2.0";

/// A JSON-RPC 2.0 request envelope.
#[derive(Debug, Deserialize)]
struct RpcRequest {
    jsonrpc: Option<String>,
    #[serde(default)]
    id: Value,
    method: Option<String>,
    #[serde(default)]
    params: Value,
}

/// A JSON-RPC error with its wire code.
struct RpcError {
    code: i64,
    message: String,
}

impl RpcError {
    fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn method_not_found(method: &str) -> Self {
        Self::new(-32601, format!("method not found: {method}"))
    }

    fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(-32602, message.into())
    }
}

impl From<ApiError> for RpcError {
    fn from(err: ApiError) -> Self {
        Self {
            code: err.jsonrpc_code(),
            message: err.to_string(),
        }
    }
}

/// `POST /mcp` — the JSON-RPC endpoint.
pub async fn mcp_post(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Json<Value> {
    let request_id = request_id_from(&headers);

    let request: RpcRequest = match serde_json::from_value(body) {
        Ok(request) => request,
        Err(e) => {
            state.metrics.record_rpc("invalid", "invalid_request");
            return Json(error_response(
                Value::Null,
                &RpcError::new(-32600, format!("invalid request: {e}")),
            ));
        }
    };
    let id = request.id.clone();

    if request.jsonrpc.as_deref() != Some(JSONRPC_VERSION) {
        state.metrics.record_rpc("invalid", "invalid_request");
        return Json(error_response(
            id,
            &RpcError::new(-32600, "jsonrpc must be \"2.0\""),
        ));
    }
    let Some(method) = request.method.clone() else {
        state.metrics.record_rpc("invalid", "invalid_request");
        return Json(error_response(id, &RpcError::new(-32600, "missing method")));
    };

    // Origin allowlist before anything else: a browser-injected request
    // from a foreign origin must not reach identity handling.
    if let Some(origin) = headers.get("origin").and_then(|v| v.to_str().ok()) {
        let allowed = state
            .runtime
            .config()
            .allowed_origins
            .iter()
            .any(|o| o == origin);
        if !allowed {
            state.metrics.record_rpc(&method, "origin_not_allowed");
            return Json(error_response(
                id,
                &RpcError::from(ApiError::OriginNotAllowed {
                    origin: origin.to_string(),
                }),
            ));
        }
    }

    let Some(identity) = identity_from_headers(&headers) else {
        state.metrics.record_rpc(&method, "unauthorized");
        return Json(error_response(
            id,
            &RpcError::from(ApiError::Unauthorized {
                message: "missing identity headers".to_string(),
            }),
        ));
    };

    match dispatch(&state, &identity, &request_id, &method, request.params).await {
        Ok(result) => {
            state.metrics.record_rpc(&method, "ok");
            Json(json!({
                "jsonrpc": JSONRPC_VERSION,
                "id": id,
                "result": result,
            }))
        }
        Err(err) => {
            state.metrics.record_rpc(&method, "error");
            Json(error_response(id, &err))
        }
    }
}

/// `GET /mcp` — keepalive-only SSE stream (no server-initiated messages in
/// this core).
pub async fn mcp_events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let keepalive_ms = state.runtime.config().keepalive_interval_ms;
    Sse::new(futures::stream::pending()).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_millis(keepalive_ms))
            .text("keepalive"),
    )
}

fn error_response(id: Value, err: &RpcError) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "error": {
            "code": err.code,
            "message": err.message,
        },
    })
}

async fn dispatch(
    state: &AppState,
    identity: &ubl_core::Identity,
    request_id: &str,
    method: &str,
    params: Value,
) -> Result<Value, RpcError> {
    match method {
        "initialize" => Ok(json!({
            "serverInfo": {
                "name": "ubl-gateway",
                "version": env!("CARGO_PKG_VERSION"),
            },
            "capabilities": {
                "tools": true,
                "streaming": true,
            },
            "session_id": ubl_core::id::mint_session_id(),
        })),
        "tools/list" => {
            let config = state.runtime.config();
            Ok(json!({
                "tools": tool_descriptors(config.max_message_bytes, config.history_page_limit)
            }))
        }
        "tools/call" => {
            #[derive(Deserialize)]
            struct CallParams {
                name: String,
                #[serde(default)]
                arguments: Value,
                #[allow(dead_code)]
                session_id: Option<String>,
            }
            let call: CallParams = serde_json::from_value(params)
                .map_err(|e| RpcError::invalid_params(format!("invalid params: {e}")))?;
            let result = call_tool(state, identity, request_id, &call.name, call.arguments).await?;

            let tenant_id = state.runtime.tenant_id_for(identity);
            if let Err(err) = state.runtime.index().insert_audit(
                &tenant_id,
                Some(&identity.user_id),
                &format!("tools/call:{}", call.name),
                Some(request_id),
                &json!({}),
            ) {
                warn!(error = %err, "audit write failed");
            }

            Ok(json!({
                "content": [{
                    "type": "json",
                    "json": result,
                }],
            }))
        }
        other => Err(RpcError::method_not_found(other)),
    }
}

async fn call_tool(
    state: &AppState,
    identity: &ubl_core::Identity,
    request_id: &str,
    name: &str,
    arguments: Value,
) -> Result<Value, RpcError> {
    let runtime = &state.runtime;
    match name {
        "messenger.list_rooms" => {
            let rooms = runtime.list_rooms(identity, request_id).await?;
            Ok(json!({ "rooms": rooms, "next_cursor": Value::Null }))
        }
        "messenger.send" => {
            let mut arguments = into_object(arguments)?;
            let room_id = take_string(&mut arguments, "room_id")?;
            let input: SendMessageInput = serde_json::from_value(Value::Object(arguments))
                .map_err(|e| RpcError::invalid_params(format!("invalid params: {e}")))?;
            let message = runtime
                .send_message(identity, &room_id, input, request_id)
                .await?;
            Ok(json!({ "message": message }))
        }
        "messenger.history" => {
            #[derive(Deserialize)]
            struct HistoryArgs {
                room_id: String,
                cursor: Option<u64>,
                limit: Option<usize>,
            }
            let args: HistoryArgs = parse_args(arguments)?;
            let page = runtime
                .get_history(identity, &args.room_id, args.cursor, args.limit, request_id)
                .await?;
            Ok(json!({ "messages": page.messages, "next_cursor": page.next_cursor }))
        }
        "office.document.create" => {
            #[derive(Deserialize)]
            struct CreateArgs {
                workspace_id: String,
                title: String,
                content: String,
            }
            let args: CreateArgs = parse_args(arguments)?;
            let document = runtime
                .create_document(identity, &args.workspace_id, &args.title, &args.content, request_id)
                .await?;
            Ok(json!({ "document": document }))
        }
        "office.document.get" => {
            #[derive(Deserialize)]
            struct GetArgs {
                workspace_id: String,
                document_id: String,
            }
            let args: GetArgs = parse_args(arguments)?;
            let document = runtime
                .get_document(identity, &args.workspace_id, &args.document_id, request_id)
                .await?;
            Ok(json!({ "document": document }))
        }
        "office.document.search" => {
            #[derive(Deserialize)]
            struct SearchArgs {
                workspace_id: String,
                query: String,
            }
            let args: SearchArgs = parse_args(arguments)?;
            let documents = runtime
                .search_documents(identity, &args.workspace_id, &args.query, request_id)
                .await?;
            Ok(json!({ "documents": documents }))
        }
        "office.llm.complete" => {
            #[derive(Deserialize)]
            struct CompleteArgs {
                workspace_id: String,
                prompt: String,
            }
            let args: CompleteArgs = parse_args(arguments)?;
            let completion = runtime
                .llm_complete(identity, &args.workspace_id, &args.prompt, request_id)
                .await?;
            Ok(json!({
                "completion": completion.completion,
                "usage": completion.usage,
            }))
        }
        other => Err(RpcError::method_not_found(other)),
    }
}

fn parse_args<T: serde::de::DeserializeOwned>(arguments: Value) -> Result<T, RpcError> {
    serde_json::from_value(arguments)
        .map_err(|e| RpcError::invalid_params(format!("invalid params: {e}")))
}

fn into_object(value: Value) -> Result<serde_json::Map<String, Value>, RpcError> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(RpcError::invalid_params(format!(
            "arguments must be an object, got {other}"
        ))),
    }
}

fn take_string(
    map: &mut serde_json::Map<String, Value>,
    key: &str,
) -> Result<String, RpcError> {
    match map.remove(key) {
        Some(Value::String(s)) => Ok(s),
        _ => Err(RpcError::invalid_params(format!("missing string field: {key}"))),
    }
}

/// Static tool descriptors for `tools/list`.
fn tool_descriptors(max_bytes: usize, history_limit: usize) -> Vec<Value> {
    let room_id = json!({"type": "string", "pattern": ubl_core::id::ROOM_ID_PATTERN});
    let workspace_id = json!({"type": "string", "pattern": ubl_core::id::WORKSPACE_ID_PATTERN});

    vec![
        json!({
            "name": "messenger.list_rooms",
            "description": "List the caller's tenant's rooms.",
            "inputSchema": {
                "type": "object",
                "properties": {},
                "additionalProperties": false,
            },
        }),
        json!({
            "name": "messenger.send",
            "description": "Send a message to a room; returns the stored message with its receipt.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "room_id": room_id,
                    "type": {"type": "string", "enum": ["text", "system"]},
                    "body": {
                        "type": "object",
                        "properties": {
                            "text": {"type": "string", "maxLength": max_bytes},
                        },
                        "required": ["text"],
                    },
                    "reply_to": {"type": "string", "pattern": ubl_core::id::MSG_ID_PATTERN},
                    "client_request_id": {"type": "string", "maxLength": 200},
                },
                "required": ["room_id", "type", "body"],
            },
        }),
        json!({
            "name": "messenger.history",
            "description": "Page a room's hot-window history, ascending by room_seq.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "room_id": room_id,
                    "cursor": {"type": "integer", "minimum": 1},
                    "limit": {"type": "integer", "minimum": 1, "maximum": history_limit},
                },
                "required": ["room_id"],
            },
        }),
        json!({
            "name": "office.document.create",
            "description": "Create a document in a workspace; returns it with its receipt.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "workspace_id": workspace_id,
                    "title": {"type": "string", "minLength": 1},
                    "content": {"type": "string"},
                },
                "required": ["workspace_id", "title", "content"],
            },
        }),
        json!({
            "name": "office.document.get",
            "description": "Read one document.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "workspace_id": workspace_id,
                    "document_id": {"type": "string", "pattern": ubl_core::id::DOCUMENT_ID_PATTERN},
                },
                "required": ["workspace_id", "document_id"],
            },
        }),
        json!({
            "name": "office.document.search",
            "description": "Case-insensitive substring search over title and content.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "workspace_id": workspace_id,
                    "query": {"type": "string", "minLength": 1},
                },
                "required": ["workspace_id", "query"],
            },
        }),
        json!({
            "name": "office.llm.complete",
            "description": "Run the stubbed LLM completion; usage counts are word-based.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "workspace_id": workspace_id,
                    "prompt": {"type": "string"},
                },
                "required": ["workspace_id", "prompt"],
            },
        }),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exactly_seven_tools_are_listed() {
        let tools = tool_descriptors(8000, 200);
        let names: Vec<&str> = tools
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        assert_eq!(
            names,
            vec![
                "messenger.list_rooms",
                "messenger.send",
                "messenger.history",
                "office.document.create",
                "office.document.get",
                "office.document.search",
                "office.llm.complete",
            ]
        );
        for tool in &tools {
            assert!(tool["description"].is_string());
            assert_eq!(tool["inputSchema"]["type"], "object");
        }
    }

    #[test]
    fn send_schema_carries_limits_and_patterns() {
        let tools = tool_descriptors(8000, 200);
        let send = &tools[1];
        let props = &send["inputSchema"]["properties"];
        assert_eq!(props["room_id"]["pattern"], ubl_core::id::ROOM_ID_PATTERN);
        assert_eq!(props["body"]["properties"]["text"]["maxLength"], 8000);
    }
}

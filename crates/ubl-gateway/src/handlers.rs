//! REST handlers under `/api`.
//!
//! Handlers are thin: extract the request context, call the runtime, wrap
//! the result in the envelope. All domain rules live in the coordinators.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use futures::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use ubl_core::room::SendMessageInput;
use ubl_core::ApiError;

use crate::envelope::{envelope, GatewayError, RequestContext};
use crate::state::AppState;

/// `GET /api/whoami` — identity echo plus tenant resolution; bootstraps the
/// tenant on first touch.
pub async fn whoami(
    State(state): State<AppState>,
    ctx: RequestContext,
) -> Result<impl IntoResponse, GatewayError> {
    let (tenant, role) = state
        .runtime
        .ensure_tenant_and_member(&ctx.identity, &ctx.request_id)
        .await
        .map_err(|e| fail(&state, "whoami", e, &ctx.request_id))?;
    state.metrics.record_http("whoami", "ok");
    Ok(envelope(
        &ctx.request_id,
        json!({
            "identity": ctx.identity,
            "tenant_id": tenant.tenant_id,
            "role": role,
        }),
    ))
}

/// `GET /api/rooms` — the tenant's room index.
pub async fn list_rooms(
    State(state): State<AppState>,
    ctx: RequestContext,
) -> Result<impl IntoResponse, GatewayError> {
    let rooms = state
        .runtime
        .list_rooms(&ctx.identity, &ctx.request_id)
        .await
        .map_err(|e| fail(&state, "rooms.list", e, &ctx.request_id))?;
    state.metrics.record_http("rooms.list", "ok");
    Ok(envelope(&ctx.request_id, json!({ "rooms": rooms })))
}

/// Body of `POST /api/rooms`.
#[derive(Debug, Deserialize)]
pub struct CreateRoomBody {
    /// Display name; the room id is its slug.
    pub name: String,
}

/// `POST /api/rooms` — create (or idempotently return) a room.
pub async fn create_room(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse, GatewayError> {
    let body: CreateRoomBody = parse_body(body, &ctx.request_id)?;
    let summary = state
        .runtime
        .create_room(&ctx.identity, &body.name, &ctx.request_id)
        .await
        .map_err(|e| fail(&state, "rooms.create", e, &ctx.request_id))?;
    state.metrics.record_http("rooms.create", "ok");
    Ok((
        StatusCode::CREATED,
        envelope(&ctx.request_id, json!({ "room_id": summary.room_id })),
    ))
}

/// Query of `GET /api/rooms/{room_id}/history`.
#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    /// Exclusive upper bound on `room_seq`.
    pub cursor: Option<u64>,
    /// Page size; clamped server-side.
    pub limit: Option<usize>,
}

/// `GET /api/rooms/{room_id}/history` — hot-window history page.
pub async fn history(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Query(query): Query<HistoryQuery>,
    ctx: RequestContext,
) -> Result<impl IntoResponse, GatewayError> {
    let page = state
        .runtime
        .get_history(
            &ctx.identity,
            &room_id,
            query.cursor,
            query.limit,
            &ctx.request_id,
        )
        .await
        .map_err(|e| fail(&state, "rooms.history", e, &ctx.request_id))?;
    state.metrics.record_http("rooms.history", "ok");
    Ok(envelope(
        &ctx.request_id,
        json!({
            "messages": page.messages,
            "next_cursor": page.next_cursor,
        }),
    ))
}

/// `POST /api/rooms/{room_id}/messages` — append to the timeline.
pub async fn send_message(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    ctx: RequestContext,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse, GatewayError> {
    let input: SendMessageInput = parse_body(body, &ctx.request_id)?;
    let message = state
        .runtime
        .send_message(&ctx.identity, &room_id, input, &ctx.request_id)
        .await
        .map_err(|e| fail(&state, "messages.send", e, &ctx.request_id))?;
    state.metrics.record_http("messages.send", "ok");
    Ok((
        StatusCode::CREATED,
        envelope(&ctx.request_id, json!({ "message": message })),
    ))
}

/// Query of `GET /api/events/rooms/{room_id}`.
#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    /// Last `room_seq` the client saw; hot messages above it are replayed.
    pub from_seq: Option<u64>,
}

/// `GET /api/events/rooms/{room_id}` — the room's SSE stream.
///
/// Framing: `id:` is the `room_seq`, `event:` is the event name, `data:` is
/// single-line JSON. A keepalive comment goes out on the configured
/// interval. Disconnection tears the receiver down, and the coordinator
/// reaps the subscriber on its next broadcast.
pub async fn room_events(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Query(query): Query<EventsQuery>,
    ctx: RequestContext,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, GatewayError> {
    let rx = state
        .runtime
        .subscribe(&ctx.identity, &room_id, query.from_seq, &ctx.request_id)
        .await
        .map_err(|e| fail(&state, "rooms.events", e, &ctx.request_id))?;
    state.metrics.record_http("rooms.events", "ok");

    let keepalive_ms = state.runtime.config().keepalive_interval_ms;
    let stream = ReceiverStream::new(rx).map(|room_event| {
        Ok(Event::default()
            .id(room_event.id.to_string())
            .event(room_event.event)
            .data(room_event.data.to_string()))
    });
    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_millis(keepalive_ms))
            .text("keepalive"),
    ))
}

/// `GET /api/receipts/{seq}` — the action (and paired effect) behind a
/// receipt sequence.
pub async fn receipt(
    State(state): State<AppState>,
    Path(seq): Path<u64>,
    ctx: RequestContext,
) -> Result<impl IntoResponse, GatewayError> {
    let atoms = state
        .runtime
        .get_receipt(&ctx.identity, seq, &ctx.request_id)
        .await
        .map_err(|e| fail(&state, "receipts.get", e, &ctx.request_id))?;
    state.metrics.record_http("receipts.get", "ok");
    Ok(envelope(
        &ctx.request_id,
        json!({ "seq": seq, "atoms": atoms }),
    ))
}

/// Deserializes a JSON body, mapping failures to `validation_error` instead
/// of a bare 422.
fn parse_body<T: serde::de::DeserializeOwned>(
    body: Value,
    request_id: &str,
) -> Result<T, GatewayError> {
    serde_json::from_value(body).map_err(|e| {
        GatewayError::new(ApiError::validation(format!("invalid body: {e}")), request_id)
    })
}

fn fail(state: &AppState, endpoint: &str, error: ApiError, request_id: &str) -> GatewayError {
    state.metrics.record_http(endpoint, error.code());
    GatewayError::new(error, request_id)
}

//! # ubl-gateway
//!
//! External surface of the UBL messaging and ledger service: the REST + SSE
//! API under `/api`, the JSON-RPC 2.0 tool server at `/mcp`, and the
//! Prometheus metrics listener. Both surfaces are thin adapters over
//! `ubl-core`'s runtime; they observe the same coordinators and the same
//! receipts.
//!
//! Authentication happens upstream: the gateway consumes a verified
//! identity from request headers and never parses tokens.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod envelope;
pub mod handlers;
pub mod metrics;
pub mod rpc;
pub mod state;

use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

/// Builds the gateway router over shared state.
#[must_use]
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/whoami", get(handlers::whoami))
        .route(
            "/api/rooms",
            get(handlers::list_rooms).post(handlers::create_room),
        )
        .route("/api/rooms/{room_id}/history", get(handlers::history))
        .route(
            "/api/rooms/{room_id}/messages",
            post(handlers::send_message),
        )
        .route("/api/events/rooms/{room_id}", get(handlers::room_events))
        .route("/api/receipts/{seq}", get(handlers::receipt))
        .route("/mcp", post(rpc::mcp_post).get(rpc::mcp_events))
        .with_state(state)
}

//! Response envelope and identity injection.
//!
//! Every JSON response carries `request_id` and `server_time`. The request
//! id is the caller's `X-Request-Id` when provided, else generated; the same
//! value lands in every action atom's `trace.request_id`, which makes logs,
//! receipts, and room timelines joinable.
//!
//! Identity arrives pre-verified from the front-end proxy as headers:
//! `X-User-Id`, `X-User-Email`, optional `X-User-Groups` (comma-separated)
//! and `X-Service`. A request without an identity is `unauthorized`.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use ubl_core::atom::now_iso;
use ubl_core::{ApiError, Identity};

use crate::state::AppState;

/// Header carrying the caller-chosen request id.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Extracts or mints the request id for a set of headers.
#[must_use]
pub fn request_id_from(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map_or_else(ubl_core::id::mint_request_id, ToString::to_string)
}

/// Verified identity plus request correlation, extracted per request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// The verified caller.
    pub identity: Identity,
    /// Envelope request id.
    pub request_id: String,
}

/// Parses the injected identity headers, if present.
#[must_use]
pub fn identity_from_headers(headers: &HeaderMap) -> Option<Identity> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(ToString::to_string)
    };

    let user_id = header("x-user-id")?;
    let email = header("x-user-email")?;
    let mut identity = Identity::new(user_id, email);
    if let Some(groups) = header("x-user-groups") {
        identity.groups = groups
            .split(',')
            .map(|g| g.trim().to_string())
            .filter(|g| !g.is_empty())
            .collect();
    }
    identity.is_service = header("x-service").is_some_and(|v| v == "true" || v == "1");
    Some(identity)
}

impl FromRequestParts<AppState> for RequestContext {
    type Rejection = GatewayError;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let request_id = request_id_from(&parts.headers);
        let Some(identity) = identity_from_headers(&parts.headers) else {
            return Err(GatewayError {
                error: ApiError::Unauthorized {
                    message: "missing identity headers".to_string(),
                },
                request_id,
            });
        };
        Ok(Self {
            identity,
            request_id,
        })
    }
}

/// An [`ApiError`] paired with its request id, ready to render.
#[derive(Debug)]
pub struct GatewayError {
    /// The underlying error.
    pub error: ApiError,
    /// Envelope request id.
    pub request_id: String,
}

impl GatewayError {
    /// Pairs an error with its request context.
    #[must_use]
    pub fn new(error: ApiError, request_id: &str) -> Self {
        Self {
            error,
            request_id: request_id.to_string(),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.error.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = json!({
            "error": {
                "code": self.error.code(),
                "message": self.error.to_string(),
            },
            "request_id": self.request_id,
            "server_time": now_iso(),
        });
        (status, Json(body)).into_response()
    }
}

/// Wraps a success payload in the response envelope.
///
/// # Panics
///
/// Panics if `payload` is not a JSON object, which is a programming error
/// in the handler.
#[must_use]
pub fn envelope(request_id: &str, mut payload: Value) -> Json<Value> {
    let object = payload.as_object_mut().expect("envelope payload is an object");
    object.insert("request_id".to_string(), json!(request_id));
    object.insert("server_time".to_string(), json!(now_iso()));
    Json(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_id_prefers_header() {
        let mut headers = HeaderMap::new();
        headers.insert(REQUEST_ID_HEADER, "req:given".parse().unwrap());
        assert_eq!(request_id_from(&headers), "req:given");
    }

    #[test]
    fn request_id_minted_when_absent() {
        let headers = HeaderMap::new();
        assert!(request_id_from(&headers).starts_with("req:"));
    }

    #[test]
    fn envelope_adds_correlation_fields() {
        let body = envelope("req:1", json!({"ok": true}));
        assert_eq!(body.0["request_id"], "req:1");
        assert!(body.0["server_time"].is_string());
        assert_eq!(body.0["ok"], true);
    }
}

//! Service error taxonomy.
//!
//! Every failure that crosses a coordinator boundary is one of these
//! variants. Each carries a stable string code, an HTTP status, and a
//! JSON-RPC error code; the gateway adapters are the only places that
//! convert to wire status codes.

use thiserror::Error;

/// Errors surfaced by coordinators and the runtime.
///
/// Validation and not-found variants fail before any state change.
/// `Internal` is reserved for persistence and canonicalization failures that
/// the caller cannot correct.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ApiError {
    /// The request carried no verified identity.
    #[error("unauthorized: {message}")]
    Unauthorized {
        /// Human-readable detail.
        message: String,
    },

    /// The identity lacks membership in the target entity.
    #[error("not a member of {entity}")]
    NotAMember {
        /// The entity the caller is not a member of.
        entity: String,
    },

    /// The request `Origin` header does not match the allowlist.
    #[error("origin not allowed: {origin}")]
    OriginNotAllowed {
        /// The rejected origin.
        origin: String,
    },

    /// A referenced entity does not exist.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Entity kind (tenant, room, message, receipt, workspace, document).
        entity: String,
        /// The identifier that was not found.
        id: String,
    },

    /// The input failed validation.
    #[error("validation error: {message}")]
    Validation {
        /// What was wrong with the input.
        message: String,
    },

    /// A message body exceeded the per-room byte limit.
    #[error("message too large: {size} bytes exceeds limit of {max}")]
    MessageTooLarge {
        /// Serialized body size in bytes.
        size: usize,
        /// The configured limit.
        max: usize,
    },

    /// A room id failed the `r:<slug>` pattern.
    #[error("invalid room id: {room_id}")]
    InvalidRoomId {
        /// The offending id.
        room_id: String,
    },

    /// An idempotency key was replayed after its entry was evicted from the
    /// `seen` window, so the original outcome can no longer be returned.
    #[error("idempotency entry evicted for request {client_request_id}")]
    IdempotencyEvicted {
        /// The replayed idempotency key.
        client_request_id: String,
    },

    /// The caller was throttled.
    #[error("rate limited")]
    RateLimited,

    /// Unexpected failure: persistence, canonicalization, or a broken
    /// internal invariant.
    #[error("internal error: {message}")]
    Internal {
        /// Detail for logs; not guaranteed stable.
        message: String,
    },
}

impl ApiError {
    /// Stable string code carried in error response bodies.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized { .. } => "unauthorized",
            Self::NotAMember { .. } => "not_a_member",
            Self::OriginNotAllowed { .. } => "origin_not_allowed",
            Self::NotFound { .. } => "not_found",
            Self::Validation { .. } => "validation_error",
            Self::MessageTooLarge { .. } => "message_too_large",
            Self::InvalidRoomId { .. } => "invalid_room_id",
            Self::IdempotencyEvicted { .. } => "idempotency_evicted",
            Self::RateLimited => "rate_limited",
            Self::Internal { .. } => "internal_error",
        }
    }

    /// HTTP status for the REST surface.
    #[must_use]
    pub const fn http_status(&self) -> u16 {
        match self {
            Self::Unauthorized { .. } => 401,
            Self::NotAMember { .. } | Self::OriginNotAllowed { .. } => 403,
            Self::NotFound { .. } => 404,
            Self::Validation { .. }
            | Self::MessageTooLarge { .. }
            | Self::InvalidRoomId { .. } => 400,
            Self::IdempotencyEvicted { .. } => 409,
            Self::RateLimited => 429,
            Self::Internal { .. } => 500,
        }
    }

    /// JSON-RPC error code for the tool server.
    #[must_use]
    pub const fn jsonrpc_code(&self) -> i64 {
        match self {
            Self::Unauthorized { .. } => -32001,
            Self::NotAMember { .. } | Self::OriginNotAllowed { .. } => -32003,
            Self::NotFound { .. } => -32004,
            Self::Validation { .. }
            | Self::MessageTooLarge { .. }
            | Self::InvalidRoomId { .. } => -32602,
            Self::IdempotencyEvicted { .. } => -32600,
            Self::RateLimited => -32029,
            Self::Internal { .. } => -32603,
        }
    }

    /// Shorthand for an internal error with a formatted message.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Shorthand for a validation error with a formatted message.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Shorthand for a not-found error.
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }
}

impl From<crate::canon::CanonError> for ApiError {
    fn from(err: crate::canon::CanonError) -> Self {
        Self::Internal {
            message: format!("non_canonicalizable: {err}"),
        }
    }
}

impl From<crate::store::StateStoreError> for ApiError {
    fn from(err: crate::store::StateStoreError) -> Self {
        Self::Internal {
            message: format!("state store: {err}"),
        }
    }
}

impl From<crate::store::IndexError> for ApiError {
    fn from(err: crate::store::IndexError) -> Self {
        Self::Internal {
            message: format!("index store: {err}"),
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal {
            message: format!("serialization: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_and_statuses_line_up() {
        let cases: Vec<(ApiError, &str, u16, i64)> = vec![
            (
                ApiError::Unauthorized {
                    message: "no identity".into(),
                },
                "unauthorized",
                401,
                -32001,
            ),
            (
                ApiError::NotAMember {
                    entity: "r:general".into(),
                },
                "not_a_member",
                403,
                -32003,
            ),
            (
                ApiError::OriginNotAllowed {
                    origin: "https://evil.example".into(),
                },
                "origin_not_allowed",
                403,
                -32003,
            ),
            (
                ApiError::not_found("room", "r:missing"),
                "not_found",
                404,
                -32004,
            ),
            (
                ApiError::validation("bad type"),
                "validation_error",
                400,
                -32602,
            ),
            (
                ApiError::MessageTooLarge {
                    size: 8001,
                    max: 8000,
                },
                "message_too_large",
                400,
                -32602,
            ),
            (
                ApiError::InvalidRoomId {
                    room_id: "general".into(),
                },
                "invalid_room_id",
                400,
                -32602,
            ),
            (
                ApiError::IdempotencyEvicted {
                    client_request_id: "k1".into(),
                },
                "idempotency_evicted",
                409,
                -32600,
            ),
            (ApiError::RateLimited, "rate_limited", 429, -32029),
            (
                ApiError::internal("boom"),
                "internal_error",
                500,
                -32603,
            ),
        ];

        for (err, code, status, rpc) in cases {
            assert_eq!(err.code(), code);
            assert_eq!(err.http_status(), status);
            assert_eq!(err.jsonrpc_code(), rpc);
        }
    }
}

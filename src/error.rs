//! Error types shared across the hub, the client pumps and the HTTP surfaces.

use crate::ws::types::InboundType;
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

/// Errors surfaced synchronously to callers of the `HubHandle`.
///
/// "User not connected" is deliberately absent: delivering to nobody is a
/// normal outcome and is reported through `DeliveryReport`, not as an error.
#[derive(Debug, Error)]
pub enum HubError {
    /// The hub control loop has stopped and no longer accepts commands.
    #[error("hub control loop is closed")]
    Closed,
    /// The message payload does not fit its declared type.
    #[error("invalid outbound message: {0}")]
    InvalidMessage(String),
    /// A direct send was requested with no recipients.
    #[error("recipient list is empty")]
    EmptyRecipients,
    /// A user id was empty or blank.
    #[error("user id must not be empty")]
    InvalidUserId,
}

/// Why an inbound frame was rejected. The connection always stays open.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The frame is not valid JSON or does not have the envelope shape.
    #[error("malformed frame: {0}")]
    Malformed(String),
    /// The declared type is unknown or has no registered validator.
    #[error("unsupported message type '{0}'")]
    UnknownType(String),
    /// The declared type requires a non-null `data` payload.
    #[error("message type '{0}' requires a data payload")]
    MissingData(InboundType),
    /// A custom validator refused the payload.
    #[error("invalid '{kind}' payload: {reason}")]
    Invalid { kind: InboundType, reason: String },
    /// Binary frames are not part of the protocol.
    #[error("binary frames are not supported")]
    Unsupported,
}

impl FrameError {
    /// Stable machine-readable code carried in the error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            FrameError::Malformed(_) | FrameError::UnknownType(_) | FrameError::Unsupported => {
                "malformed_frame"
            }
            FrameError::MissingData(_) | FrameError::Invalid { .. } => "validation_error",
        }
    }
}

/// A failure of the underlying socket. Always ends the connection.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("read failed: {0}")]
    Read(String),
    #[error("write failed: {0}")]
    Write(String),
    #[error("write did not complete within the deadline")]
    WriteTimeout,
    #[error("no pong received within the keepalive deadline")]
    KeepaliveTimeout,
    #[error("failed to encode outbound frame: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Invalid configuration value.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {key}")]
    Invalid { key: &'static str, value: String },
    #[error("pong wait ({pong_wait:?}) must be longer than the ping interval ({ping_interval:?})")]
    KeepaliveWindow {
        ping_interval: std::time::Duration,
        pong_wait: std::time::Duration,
    },
}

/// A structured error returned by the HTTP surfaces (upgrade and admin).
///
/// Renders as `{"success": false, "error": {"code": ..., "message": ...}}`.
#[derive(Debug, Error)]
#[error("{code}: {message}")]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "forbidden", message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, "unavailable", message)
    }
}

impl From<HubError> for ApiError {
    fn from(value: HubError) -> Self {
        match value {
            HubError::Closed => ApiError::unavailable(value.to_string()),
            HubError::InvalidMessage(_) | HubError::EmptyRecipients | HubError::InvalidUserId => {
                ApiError::bad_request(value.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "success": false,
            "error": {
                "code": self.code,
                "message": self.message,
            }
        });
        (self.status, Json(body)).into_response()
    }
}

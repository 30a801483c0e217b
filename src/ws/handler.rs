// circle-realtime-hub/src/ws/handler.rs

//! Defines the `EventHandler` trait, the seam between the hub and the
//! application's business layer.

use crate::ws::hub::HubHandle;
use crate::ws::types::{ConnectionId, InboundRequest, UserId};
use async_trait::async_trait;
use axum::http::StatusCode;
use serde_json::Value;

/// A context object passed to handler methods.
///
/// It identifies the connection a request arrived on and carries a hub
/// handle, so the business layer can fan events back out.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    /// The unique ID of the connection.
    pub conn_id: ConnectionId,
    /// The authenticated user that owns the connection.
    pub user_id: UserId,
    /// A handle to the hub for broadcasts and direct sends.
    pub hub: HubHandle,
}

/// A standard error type for handler methods, consisting of an HTTP status code
/// and an optional, more specific error message.
#[derive(Debug)]
pub enum HandlerError {
    /// A custom error with a status code and message.
    Custom(StatusCode, Option<String>),
    /// An error that occurred during response serialization.
    Serialization(serde_json::Error),
}

impl HandlerError {
    /// The message placed in the client's error envelope.
    pub fn client_message(&self) -> String {
        match self {
            HandlerError::Custom(code, msg) => msg.clone().unwrap_or_else(|| code.to_string()),
            HandlerError::Serialization(e) => format!("Response serialization error: {}", e),
        }
    }

    /// The machine-readable code placed in the client's error envelope.
    pub fn client_code(&self) -> &'static str {
        match self {
            HandlerError::Custom(code, _) if code.is_client_error() => "request_rejected",
            _ => "internal_error",
        }
    }
}

impl From<(StatusCode, Option<String>)> for HandlerError {
    fn from(value: (StatusCode, Option<String>)) -> Self {
        HandlerError::Custom(value.0, value.1)
    }
}

// Allow easy conversion from serde_json::Error.
impl From<serde_json::Error> for HandlerError {
    fn from(value: serde_json::Error) -> Self {
        HandlerError::Serialization(value)
    }
}

/// The trait the application implements to receive validated client events.
///
/// The hub never interprets a request's business meaning: location pings,
/// chat messages and emergency alerts are handed over here already decoded
/// and validated, keyed by [`InboundRequest::kind`].
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    /// A lifecycle hook called after the connection is registered.
    ///
    /// The default implementation does nothing.
    async fn on_connect(&self, _context: &ConnectionContext) {
        // Default is a no-op
    }

    /// Handles one validated request.
    ///
    /// `Ok(data)` is acknowledged to the sender with a `success` envelope
    /// carrying `data` (if any) and the request id. `Err` is answered with
    /// an `error` envelope. Either way the connection stays open.
    async fn handle_request(
        &self,
        request: InboundRequest,
        context: &ConnectionContext,
    ) -> Result<Option<Value>, HandlerError>;

    /// A lifecycle hook called after the connection has been unregistered.
    ///
    /// The default implementation does nothing.
    async fn on_disconnect(&self, _context: &ConnectionContext) {
        // Default is a no-op
    }
}

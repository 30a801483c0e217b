//! Provides the generic Axum handler for upgrading HTTP requests to WebSockets.

use crate::error::ApiError;
use crate::ws::handler::EventHandler;
use crate::ws::service::RealtimeService;
use crate::ws::types::Identity;
use axum::{
    extract::{
        State,
        ws::{WebSocketUpgrade, rejection::WebSocketUpgradeRejection},
    },
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// A generic Axum handler that orchestrates the WebSocket upgrade process.
///
/// The caller has already authenticated the request (for example with the
/// `WsAuth` extractor) and passes the resulting identity in. This handler then:
///
/// 1.  Rejects inactive identities with `401 Unauthorized`.
/// 2.  Rejects requests that cannot be upgraded with `400 Bad Request`.
/// 3.  Upgrades the connection and hands it off to the `RealtimeService`,
///     which registers a client with the hub.
///
/// ## Example Usage
///
/// ```rust,ignore
/// let app = Router::new()
///     .route(
///         "/ws",
///         get(|ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
///              State(state): State<ServerState>,
///              WsAuth(user): WsAuth<User>| async move {
///             upgrade_handler(ws, State(state.realtime), user).await
///         }),
///     )
///     .with_state(server_state);
/// ```
#[instrument(skip_all, fields(user_id = %identity.user_id()))]
pub async fn upgrade_handler<H, I>(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    State(service): State<Arc<RealtimeService<H>>>,
    identity: I,
) -> Response
where
    H: EventHandler,
    I: Identity,
{
    // 1. Inactive accounts never get a client.
    if !identity.is_active() {
        warn!("WebSocket connection rejected: account is inactive.");
        return ApiError::unauthorized("account is inactive").into_response();
    }

    // 2. The request must actually be an upgrade.
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            warn!("WebSocket upgrade rejected: {}", rejection.body_text());
            return ApiError::bad_request(format!(
                "websocket upgrade failed: {}",
                rejection.body_text()
            ))
            .into_response();
        }
    };

    // 3. Upgrade. The `on_upgrade` callback runs in the background.
    let user_id = identity.user_id();
    info!("Upgrading connection.");
    ws.on_failed_upgrade(|e| warn!("WebSocket handshake failed: {}", e))
        .on_upgrade(move |socket| async move {
            // The RealtimeService takes over from here.
            service.handle_connection(socket, user_id).await;
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubConfig;
    use crate::ws::handler::{ConnectionContext, HandlerError};
    use crate::ws::types::{InboundRequest, UserId};
    use async_trait::async_trait;
    use axum::http::StatusCode;
    use serde_json::Value;

    struct Noop;

    #[async_trait]
    impl EventHandler for Noop {
        async fn handle_request(
            &self,
            _request: InboundRequest,
            _context: &ConnectionContext,
        ) -> Result<Option<Value>, HandlerError> {
            Ok(None)
        }
    }

    struct Member {
        id: UserId,
        active: bool,
    }

    impl Identity for Member {
        fn user_id(&self) -> UserId {
            self.id.clone()
        }

        fn is_active(&self) -> bool {
            self.active
        }
    }

    #[tokio::test]
    async fn inactive_identity_is_unauthorized() {
        let service = RealtimeService::new(HubConfig::default(), Noop);
        let response = upgrade_handler(
            Err(WebSocketUpgradeRejection::from(
                axum::extract::ws::rejection::MethodNotGet::default(),
            )),
            State(service),
            Member {
                id: "u1".into(),
                active: false,
            },
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn non_upgrade_request_is_bad_request() {
        let service = RealtimeService::new(HubConfig::default(), Noop);
        let response = upgrade_handler(
            Err(WebSocketUpgradeRejection::from(
                axum::extract::ws::rejection::MethodNotGet::default(),
            )),
            State(service),
            Member {
                id: "u1".into(),
                active: true,
            },
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}

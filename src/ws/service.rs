//! The `RealtimeService` ties the hub, the frame codec and the application's
//! `EventHandler` together and serves upgraded sockets.

use crate::config::HubConfig;
use crate::ws::client::Client;
use crate::ws::codec::FrameCodec;
use crate::ws::handler::EventHandler;
use crate::ws::hub::{Hub, HubHandle};
use crate::ws::types::UserId;
use axum::extract::ws::WebSocket;
use futures_util::StreamExt;
use std::sync::Arc;
use tracing::{info, instrument};

/// The entry point for upgraded connections.
///
/// It is generic over an `EventHandler` implementation, so the hub stays
/// ignorant of what a location ping or a chat message means.
#[derive(Debug)]
pub struct RealtimeService<H: EventHandler> {
    hub: HubHandle,
    handler: Arc<H>,
    codec: Arc<FrameCodec>,
}

impl<H: EventHandler> Clone for RealtimeService<H> {
    fn clone(&self) -> Self {
        Self {
            hub: self.hub.clone(),
            handler: self.handler.clone(),
            codec: self.codec.clone(),
        }
    }
}

impl<H: EventHandler> RealtimeService<H> {
    /// Spawns a hub with `config` and wraps it with `handler`.
    ///
    /// # Arguments
    /// * `config` - Hub and client tunables.
    /// * `handler` - An instance of your application's `EventHandler` implementation.
    pub fn new(config: HubConfig, handler: H) -> Arc<Self> {
        Self::with_hub(Hub::spawn(config), handler)
    }

    /// Wraps an already running hub.
    pub fn with_hub(hub: HubHandle, handler: H) -> Arc<Self> {
        Arc::new(Self {
            hub,
            handler: Arc::new(handler),
            codec: Arc::new(FrameCodec::with_defaults()),
        })
    }

    /// The hub handle, for the admin surface and the business layer.
    pub fn hub(&self) -> &HubHandle {
        &self.hub
    }

    /// The shared validator registry. Changes apply to live connections.
    pub fn codec(&self) -> &FrameCodec {
        &self.codec
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    /// Public entry point called by the upgrade handler for each new socket.
    ///
    /// Returns when the connection has been closed and unregistered.
    #[instrument(skip_all, fields(user_id = %user_id))]
    pub async fn handle_connection(self: Arc<Self>, socket: WebSocket, user_id: UserId) {
        let client = Client::new(
            self.hub.clone(),
            Arc::clone(&self.handler),
            Arc::clone(&self.codec),
            user_id,
        );
        info!(conn_id = %client.context().conn_id, "Accepted upgraded socket.");
        let (sink, stream) = socket.split();
        client.run(sink, stream).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::handler::{ConnectionContext, HandlerError};
    use crate::ws::types::{InboundRequest, InboundType};
    use async_trait::async_trait;
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

    #[tokio::test]
    async fn clones_share_hub_and_codec() {
        let service = RealtimeService::new(HubConfig::default(), Noop);
        let clone = (*service).clone();

        assert!(Arc::ptr_eq(service.handler(), clone.handler()));
        assert!(service.codec().disable(InboundType::TypingIndicator));
        assert!(!clone.codec().disable(InboundType::TypingIndicator));
        assert!(clone.hub().connected_users().await.unwrap().is_empty());
    }
}

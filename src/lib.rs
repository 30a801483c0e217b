//! # Circle Realtime Hub
//!
//! The real-time delivery layer of a location-sharing app. Authenticated
//! users hold one or more WebSocket connections; the hub keeps a registry of
//! them, validates what clients send, and fans location updates, place
//! events, alerts and chat messages out to the right subset of connections.
//!
//! ## Core Features
//!
//! - **Single-owner `Hub`**: one control loop owns the registry; everything
//!   else talks to it through a cloneable `HubHandle`.
//! - **Filtered fan-out**: include/exclude user sets and event-type filters,
//!   with a `DeliveryReport` for every broadcast and direct send.
//! - **Non-blocking delivery**: bounded per-connection mailboxes; a stalled
//!   client loses messages instead of stalling the hub.
//! - **Pluggable Logic**: implement `EventHandler` to receive validated client requests.
//! - **Flexible Authentication**: a generic `WsAuth` extractor that works with headers or query params.
//! - **Admin Surface**: presence, stats, broadcast, direct send and forced disconnect over HTTP.
//!
//! ## Getting Started
//!
//! See `demos/location_hub.rs` for a server wiring authentication, the socket
//! endpoint and the admin routes together.

pub mod config;
pub mod error;
pub mod ws;

// It will only be part of the crate if the "auth" feature is enabled.
#[cfg(feature = "auth")]
pub mod auth;

// It will only be part of the crate if the "admin" feature is enabled.
#[cfg(feature = "admin")]
pub mod admin;

/// Public prelude for convenience.
///
/// `use circle_realtime_hub::prelude::*;`
pub mod prelude {
    pub use crate::config::HubConfig;
    pub use crate::error::{ApiError, HubError};
    pub use crate::ws::{
        handler::{ConnectionContext, EventHandler, HandlerError},
        hub::{Hub, HubHandle},
        service::RealtimeService,
        types::{
            DeliveryFilter, DeliveryReport, Identity, InboundRequest, InboundType,
            OutboundMessage, OutboundType, UserId,
        },
        upgrade::upgrade_handler,
    };

    #[cfg(feature = "auth")]
    pub use crate::auth::{TokenValidator, WsAuth};

    #[cfg(feature = "admin")]
    pub use crate::admin::{AdminService, router as admin_router};
}

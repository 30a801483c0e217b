//! WebSocket hub: registry, fan-out, per-connection pumps and the upgrade path.
//!
//! The pieces fit together like this:
//!
//! - [`hub`] owns the registry and processes every command in order.
//! - [`client`] runs one connection's inbound and outbound pumps.
//! - [`codec`] and [`sanitize`] turn frames into requests and messages into frames.
//! - [`service`] and [`upgrade`] attach upgraded sockets to the hub.

pub mod client;
pub mod codec;
pub mod filter;
pub mod handler;
pub mod hub;
pub mod presence;
pub(crate) mod registry;
pub mod sanitize;
pub mod service;
pub mod types;
pub mod upgrade;

// circle-realtime-hub/src/ws/types.rs

//! Wire and data-model types shared by the hub, the clients and the admin surface.

use crate::error::HubError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

/// A unique identifier for a single WebSocket connection.
pub type ConnectionId = Uuid;

/// The identifier of an application user. One user may own many connections.
pub type UserId = String;

/// The authenticated identity handed to the hub by the auth collaborator.
pub trait Identity: Send + Sync + 'static {
    /// The user this identity belongs to.
    fn user_id(&self) -> UserId;

    /// Inactive (suspended, deleted) accounts are refused at upgrade time.
    fn is_active(&self) -> bool {
        true
    }

    /// Privileged callers see global data on the admin surface.
    fn is_admin(&self) -> bool {
        false
    }
}

/// The closed set of outbound event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboundType {
    LocationUpdate,
    PlaceEvent,
    EmergencyAlert,
    CircleUpdate,
    ChatMessage,
    Notification,
    UserStatus,
    TypingIndicator,
    Success,
    Error,
    Ping,
}

/// A documented entry of the message type catalog.
#[derive(Debug, Clone, Serialize)]
pub struct MessageTypeInfo {
    #[serde(rename = "type")]
    pub kind: OutboundType,
    pub description: &'static str,
}

impl OutboundType {
    pub const EVENTS: [OutboundType; 8] = [
        OutboundType::LocationUpdate,
        OutboundType::PlaceEvent,
        OutboundType::EmergencyAlert,
        OutboundType::CircleUpdate,
        OutboundType::ChatMessage,
        OutboundType::Notification,
        OutboundType::UserStatus,
        OutboundType::TypingIndicator,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OutboundType::LocationUpdate => "location_update",
            OutboundType::PlaceEvent => "place_event",
            OutboundType::EmergencyAlert => "emergency_alert",
            OutboundType::CircleUpdate => "circle_update",
            OutboundType::ChatMessage => "chat_message",
            OutboundType::Notification => "notification",
            OutboundType::UserStatus => "user_status",
            OutboundType::TypingIndicator => "typing_indicator",
            OutboundType::Success => "success",
            OutboundType::Error => "error",
            OutboundType::Ping => "ping",
        }
    }

    /// Event types carry a business payload; envelopes and pings may not.
    pub fn requires_payload(&self) -> bool {
        Self::EVENTS.contains(self)
    }

    pub fn description(&self) -> &'static str {
        match self {
            OutboundType::LocationUpdate => "A circle member's position changed",
            OutboundType::PlaceEvent => "A member arrived at or left a saved place",
            OutboundType::EmergencyAlert => "An emergency was raised or resolved",
            OutboundType::CircleUpdate => "Circle membership or settings changed",
            OutboundType::ChatMessage => "A new chat message",
            OutboundType::Notification => "A generic in-app notification",
            OutboundType::UserStatus => "A user went online or offline",
            OutboundType::TypingIndicator => "A user started or stopped typing",
            OutboundType::Success => "Acknowledgement of a client request",
            OutboundType::Error => "Rejection of a client request",
            OutboundType::Ping => "Application-level keepalive",
        }
    }

    /// The public catalog, for documentation and discovery.
    pub fn catalog() -> Vec<MessageTypeInfo> {
        Self::EVENTS
            .iter()
            .map(|kind| MessageTypeInfo {
                kind: *kind,
                description: kind.description(),
            })
            .collect()
    }
}

impl fmt::Display for OutboundType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An addressed or broadcast event, as written to the socket.
///
/// `success`, `message`, `error` and `code` are only set on the
/// acknowledgement envelopes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    #[serde(rename = "type")]
    pub kind: OutboundType,
    #[serde(default)]
    pub data: Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl OutboundMessage {
    pub fn new(kind: OutboundType, data: Value) -> Self {
        Self {
            kind,
            data,
            timestamp: Utc::now(),
            request_id: None,
            success: None,
            message: None,
            error: None,
            code: None,
        }
    }

    pub fn with_request_id(mut self, request_id: Option<String>) -> Self {
        self.request_id = request_id;
        self
    }

    /// Acknowledges a client request.
    pub fn success(request_id: Option<String>, message: impl Into<String>, data: Value) -> Self {
        let mut msg = Self::new(OutboundType::Success, data).with_request_id(request_id);
        msg.success = Some(true);
        msg.message = Some(message.into());
        msg
    }

    /// Rejects a client request.
    pub fn error(
        request_id: Option<String>,
        code: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        let mut msg = Self::new(OutboundType::Error, Value::Null).with_request_id(request_id);
        msg.success = Some(false);
        msg.code = Some(code.into());
        msg.error = Some(error.into());
        msg
    }

    pub fn ping() -> Self {
        Self::new(OutboundType::Ping, Value::Null)
    }

    /// Rejects messages whose payload does not fit their type.
    pub fn validate(&self) -> Result<(), HubError> {
        if self.kind.requires_payload() && self.data.is_null() {
            return Err(HubError::InvalidMessage(format!(
                "'{}' messages require a data payload",
                self.kind
            )));
        }
        Ok(())
    }
}

/// Criteria attached to a broadcast. Empty sets mean "no restriction".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeliveryFilter {
    pub include_users: HashSet<UserId>,
    pub exclude_users: HashSet<UserId>,
    pub event_types: HashSet<OutboundType>,
}

impl DeliveryFilter {
    /// Every connected user is a candidate.
    pub fn everyone() -> Self {
        Self::default()
    }

    pub fn include<I, S>(mut self, users: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<UserId>,
    {
        self.include_users.extend(users.into_iter().map(Into::into));
        self
    }

    pub fn exclude<I, S>(mut self, users: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<UserId>,
    {
        self.exclude_users.extend(users.into_iter().map(Into::into));
        self
    }

    pub fn event_types<I>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = OutboundType>,
    {
        self.event_types.extend(kinds);
        self
    }
}

/// The closed set of inbound request types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboundType {
    LocationUpdate,
    SendMessage,
    EmergencyAlert,
    TypingIndicator,
    Ping,
}

impl InboundType {
    pub const ALL: [InboundType; 5] = [
        InboundType::LocationUpdate,
        InboundType::SendMessage,
        InboundType::EmergencyAlert,
        InboundType::TypingIndicator,
        InboundType::Ping,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            InboundType::LocationUpdate => "location_update",
            InboundType::SendMessage => "send_message",
            InboundType::EmergencyAlert => "emergency_alert",
            InboundType::TypingIndicator => "typing_indicator",
            InboundType::Ping => "ping",
        }
    }
}

impl fmt::Display for InboundType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InboundType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|kind| kind.as_str() == s)
            .copied()
            .ok_or(())
    }
}

/// A validated frame from a client.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundRequest {
    pub kind: InboundType,
    pub data: Value,
    pub request_id: Option<String>,
}

/// Outcome of a fan-out. `dropped` counts full or closed mailboxes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryReport {
    pub matched: usize,
    pub delivered: usize,
    pub dropped: usize,
}

impl DeliveryReport {
    /// True when no live connection received the message.
    pub fn is_unreachable(&self) -> bool {
        self.delivered == 0
    }

    pub(crate) fn merge(&mut self, other: DeliveryReport) {
        self.matched += other.matched;
        self.delivered += other.delivered;
        self.dropped += other.dropped;
    }
}

/// An item in a connection's outbound mailbox.
#[derive(Debug, Clone)]
pub(crate) enum Envelope {
    /// A message to serialize and write.
    Message(Arc<OutboundMessage>),
    /// A close notice; the outbound pump writes a close frame and stops.
    Close(String),
}

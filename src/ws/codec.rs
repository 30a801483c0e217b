//! Frame codec and validator.
//!
//! A text frame is decoded into an envelope, its declared type is looked up in
//! the validator registry, and the type-specific check runs. Anything that
//! fails is answered with an error frame; the connection stays open.

use crate::error::{FrameError, TransportError};
use crate::ws::sanitize::sanitize;
use crate::ws::types::{InboundRequest, InboundType, OutboundMessage};
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// A type-specific payload check.
pub type Validator = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

/// The raw inbound envelope, before type resolution.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    request_id: Option<String>,
}

/// Decodes and validates inbound frames; encodes outbound ones.
///
/// The registry is read concurrently by every inbound pump and may be
/// changed at runtime.
pub struct FrameCodec {
    validators: DashMap<InboundType, Validator>,
}

impl fmt::Debug for FrameCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameCodec")
            .field("registered_types", &self.validators.len())
            .finish()
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl FrameCodec {
    /// A codec with no registered types. Every frame is malformed.
    pub fn empty() -> Self {
        Self {
            validators: DashMap::new(),
        }
    }

    /// A codec accepting the built-in request types.
    ///
    /// `location_update`, `send_message`, `emergency_alert` and
    /// `typing_indicator` require a non-null `data`; `ping` needs nothing.
    pub fn with_defaults() -> Self {
        let codec = Self::empty();
        for kind in InboundType::ALL {
            codec.register(kind, Arc::new(|_: &Value| Ok(())));
        }
        codec
    }

    /// Installs or replaces the validator for `kind`.
    pub fn register(&self, kind: InboundType, validator: Validator) {
        self.validators.insert(kind, validator);
    }

    /// Removes `kind` from the registry; its frames become malformed.
    pub fn disable(&self, kind: InboundType) -> bool {
        self.validators.remove(&kind).is_some()
    }

    /// Decodes one text frame into a validated request.
    pub fn decode(&self, text: &str) -> Result<InboundRequest, FrameError> {
        let raw: RawFrame =
            serde_json::from_str(text).map_err(|e| FrameError::Malformed(e.to_string()))?;

        let kind: InboundType = raw
            .kind
            .parse()
            .map_err(|_| FrameError::UnknownType(raw.kind.clone()))?;

        // Clone the validator out so the shard lock is not held while it runs.
        let validator = self
            .validators
            .get(&kind)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| FrameError::UnknownType(raw.kind.clone()))?;

        if kind != InboundType::Ping && raw.data.is_null() {
            return Err(FrameError::MissingData(kind));
        }
        validator(&raw.data).map_err(|reason| FrameError::Invalid { kind, reason })?;

        Ok(InboundRequest {
            kind,
            data: raw.data,
            request_id: raw.request_id,
        })
    }

    /// Extracts the request id from a frame that failed validation, if any.
    pub fn request_id_of(text: &str) -> Option<String> {
        serde_json::from_str::<Value>(text).ok().and_then(|value| {
            value
                .get("requestId")
                .and_then(Value::as_str)
                .map(str::to_owned)
        })
    }
}

/// Serializes an outbound message after stripping sensitive fields.
pub fn encode(message: &OutboundMessage) -> Result<String, TransportError> {
    let mut clean = message.clone();
    sanitize(&mut clean.data);
    Ok(serde_json::to_string(&clean)?)
}

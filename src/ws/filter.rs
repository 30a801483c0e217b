//! Decides whether a connection receives a broadcast.

use crate::ws::registry::ConnectionHandle;
use crate::ws::types::{DeliveryFilter, OutboundMessage};

/// Returns true if `client` should receive `message` under `filter`.
///
/// Exclusion wins over inclusion; empty sets do not restrict.
pub(crate) fn matches(
    client: &ConnectionHandle,
    message: &OutboundMessage,
    filter: &DeliveryFilter,
) -> bool {
    if !client.is_active() {
        return false;
    }
    if filter.exclude_users.contains(&client.user_id) {
        return false;
    }
    if !filter.include_users.is_empty() && !filter.include_users.contains(&client.user_id) {
        return false;
    }
    if !filter.event_types.is_empty() && !filter.event_types.contains(&message.kind) {
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::registry::test_support::detached;
    use crate::ws::types::OutboundType;
    use serde_json::json;

    fn chat() -> OutboundMessage {
        OutboundMessage::new(OutboundType::ChatMessage, json!({"text": "hi"}))
    }

    #[test]
    fn empty_filter_accepts_active_clients() {
        let u1 = detached("u1", 1);
        assert!(matches(&u1.handle, &chat(), &DeliveryFilter::everyone()));
    }

    #[test]
    fn inactive_client_never_matches() {
        let u1 = detached("u1", 1);
        u1.handle.state.deactivate();
        assert!(!matches(&u1.handle, &chat(), &DeliveryFilter::everyone()));
    }

    #[test]
    fn include_set_restricts_recipients() {
        let filter = DeliveryFilter::everyone().include(["u1"]);
        assert!(matches(&detached("u1", 1).handle, &chat(), &filter));
        assert!(!matches(&detached("u2", 1).handle, &chat(), &filter));
    }

    #[test]
    fn exclusion_overrides_inclusion() {
        let filter = DeliveryFilter::everyone().include(["u1"]).exclude(["u1"]);
        assert!(!matches(&detached("u1", 1).handle, &chat(), &filter));

        let filter = DeliveryFilter::everyone().exclude(["u1"]);
        assert!(!matches(&detached("u1", 1).handle, &chat(), &filter));
        assert!(matches(&detached("u3", 1).handle, &chat(), &filter));
    }

    #[test]
    fn event_type_set_restricts_message_kinds() {
        let filter = DeliveryFilter::everyone().event_types([OutboundType::EmergencyAlert]);
        let u1 = detached("u1", 1);
        assert!(!matches(&u1.handle, &chat(), &filter));
        let alert = OutboundMessage::new(OutboundType::EmergencyAlert, json!({"level": 1}));
        assert!(matches(&u1.handle, &alert, &filter));
    }
}

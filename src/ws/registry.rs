//! Connection records and the user → connection-set map.
//!
//! Only the hub control loop owns a [`Registry`]. Clients share just the
//! [`ConnectionState`] of their own record (liveness, activity, counters).

use crate::ws::types::{ConnectionId, Envelope, UserId};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Mutable per-connection facts shared between the registry and the client.
#[derive(Debug)]
pub struct ConnectionState {
    active: AtomicBool,
    connected_at: DateTime<Utc>,
    started: Instant,
    /// Milliseconds after `started` of the last inbound frame.
    last_seen_ms: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl ConnectionState {
    pub fn new() -> Self {
        Self {
            active: AtomicBool::new(true),
            connected_at: Utc::now(),
            started: Instant::now(),
            last_seen_ms: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Clears the liveness flag. Returns true if it was set.
    pub fn deactivate(&self) -> bool {
        self.active.swap(false, Ordering::AcqRel)
    }

    /// Records inbound activity (any frame, including pongs).
    pub fn touch(&self) {
        let elapsed = self.started.elapsed().as_millis() as u64;
        self.last_seen_ms.fetch_max(elapsed, Ordering::AcqRel);
    }

    /// Time since the last inbound frame (or since connecting).
    pub fn idle_for(&self) -> Duration {
        let last_seen = Duration::from_millis(self.last_seen_ms.load(Ordering::Acquire));
        self.started.elapsed().saturating_sub(last_seen)
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        let ms = self.last_seen_ms.load(Ordering::Acquire) as i64;
        self.connected_at + ChronoDuration::milliseconds(ms)
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new()
    }
}

/// Why an enqueue did not happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeliveryFailure {
    /// The mailbox is at capacity; the message was dropped.
    Full,
    /// The outbound pump is gone.
    Closed,
}

/// The registry's record of one live connection.
#[derive(Debug)]
pub(crate) struct ConnectionHandle {
    pub(crate) conn_id: ConnectionId,
    pub(crate) user_id: UserId,
    pub(crate) state: Arc<ConnectionState>,
    mailbox: mpsc::Sender<Envelope>,
    shutdown: watch::Sender<bool>,
}

impl ConnectionHandle {
    pub(crate) fn new(
        conn_id: ConnectionId,
        user_id: UserId,
        state: Arc<ConnectionState>,
        mailbox: mpsc::Sender<Envelope>,
        shutdown: watch::Sender<bool>,
    ) -> Self {
        Self {
            conn_id,
            user_id,
            state,
            mailbox,
            shutdown,
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.state.is_active()
    }

    /// Non-blocking enqueue. A full mailbox drops the envelope.
    pub(crate) fn try_deliver(&self, envelope: Envelope) -> Result<(), DeliveryFailure> {
        let counted = matches!(envelope, Envelope::Message(_));
        match self.mailbox.try_send(envelope) {
            Ok(()) => {
                if counted {
                    self.state.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.state.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    conn_id = %self.conn_id,
                    user_id = %self.user_id,
                    "Outbound mailbox full, dropping message"
                );
                Err(DeliveryFailure::Full)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.state.dropped.fetch_add(1, Ordering::Relaxed);
                self.state.deactivate();
                debug!(conn_id = %self.conn_id, "Outbound mailbox closed, marking inactive");
                Err(DeliveryFailure::Closed)
            }
        }
    }

    /// Signals the client to stop, regardless of mailbox backlog.
    pub(crate) fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

/// Map of user id to that user's live connections.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    users: HashMap<UserId, HashMap<ConnectionId, ConnectionHandle>>,
}

impl Registry {
    /// Adds a connection. Returns true if it is the user's first.
    pub(crate) fn insert(&mut self, handle: ConnectionHandle) -> bool {
        let set = self.users.entry(handle.user_id.clone()).or_default();
        let first = set.is_empty();
        set.insert(handle.conn_id, handle);
        first
    }

    /// Removes one connection. The user entry goes away with its last
    /// connection. Returns the record and whether the user is now absent.
    pub(crate) fn remove(
        &mut self,
        user_id: &str,
        conn_id: ConnectionId,
    ) -> Option<(ConnectionHandle, bool)> {
        let Entry::Occupied(mut entry) = self.users.entry(user_id.to_owned()) else {
            return None;
        };
        let handle = entry.get_mut().remove(&conn_id)?;
        let user_gone = entry.get().is_empty();
        if user_gone {
            entry.remove();
        }
        Some((handle, user_gone))
    }

    /// Removes every connection of `user_id`.
    pub(crate) fn remove_user(&mut self, user_id: &str) -> Vec<ConnectionHandle> {
        self.users
            .remove(user_id)
            .map(|set| set.into_values().collect())
            .unwrap_or_default()
    }

    /// Removes and returns every connection.
    pub(crate) fn drain(&mut self) -> Vec<ConnectionHandle> {
        self.users
            .drain()
            .flat_map(|(_, set)| set.into_values())
            .collect()
    }

    pub(crate) fn connections(&self) -> impl Iterator<Item = &ConnectionHandle> {
        self.users.values().flat_map(|set| set.values())
    }

    pub(crate) fn user_connections<'a>(
        &'a self,
        user_id: &str,
    ) -> impl Iterator<Item = &'a ConnectionHandle> + use<'a> {
        self.users
            .get(user_id)
            .into_iter()
            .flat_map(|set| set.values())
    }

    pub(crate) fn users(
        &self,
    ) -> impl Iterator<Item = (&UserId, &HashMap<ConnectionId, ConnectionHandle>)> {
        self.users.iter()
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::detached;
    use super::*;
    use crate::ws::types::OutboundMessage;

    #[test]
    fn insert_reports_first_connection_per_user() {
        let mut registry = Registry::default();
        assert!(registry.insert(detached("u1", 4).handle));
        assert!(!registry.insert(detached("u1", 4).handle));
        assert!(registry.insert(detached("u2", 4).handle));
        assert_eq!(registry.connections().count(), 3);
        assert_eq!(registry.user_connections("u1").count(), 2);
    }

    #[test]
    fn remove_is_idempotent_and_drops_empty_users() {
        let mut registry = Registry::default();
        let conn = detached("u1", 4);
        let conn_id = conn.handle.conn_id;
        registry.insert(conn.handle);

        let (removed, user_gone) = registry.remove("u1", conn_id).unwrap();
        assert_eq!(removed.conn_id, conn_id);
        assert!(user_gone);
        assert!(registry.remove("u1", conn_id).is_none());
        assert_eq!(registry.users().count(), 0);
    }

    #[test]
    fn full_mailbox_drops_and_counts() {
        let conn = detached("u1", 1);
        let msg = Arc::new(OutboundMessage::ping());
        assert!(conn.handle.try_deliver(Envelope::Message(msg.clone())).is_ok());
        assert_eq!(
            conn.handle.try_deliver(Envelope::Message(msg)),
            Err(DeliveryFailure::Full)
        );
        assert_eq!(conn.handle.state.delivered(), 1);
        assert_eq!(conn.handle.state.dropped(), 1);
        assert!(conn.handle.is_active());
    }

    #[test]
    fn closed_mailbox_marks_connection_inactive() {
        let conn = detached("u1", 1);
        drop(conn.mailbox);
        let result = conn
            .handle
            .try_deliver(Envelope::Message(Arc::new(OutboundMessage::ping())));
        assert_eq!(result, Err(DeliveryFailure::Closed));
        assert!(!conn.handle.is_active());
    }

    #[test]
    fn shutdown_is_observable() {
        let conn = detached("u1", 1);
        assert!(!*conn.shutdown.borrow());
        conn.handle.shutdown();
        assert!(*conn.shutdown.borrow());
    }
}

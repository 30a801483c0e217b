//! The hub: single owner of the connection registry.
//!
//! All registrations, removals, fan-outs and presence queries are commands on
//! one channel, processed in order by one task. Nothing else touches the
//! registry, so it needs no lock. Command handling never awaits: enqueues
//! onto client mailboxes are `try_send`, so a stalled client cannot stall
//! the loop.

use crate::config::HubConfig;
use crate::error::HubError;
use crate::ws::filter::matches;
use crate::ws::presence::{self, ConnectionInfo, ConnectionStats, Counters, UserConnectionInfo};
use crate::ws::registry::{ConnectionHandle, Registry};
use crate::ws::types::{
    ConnectionId, DeliveryFilter, DeliveryReport, Envelope, OutboundMessage, OutboundType, UserId,
};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Commands processed by the control loop.
pub(crate) enum HubCommand {
    Register(ConnectionHandle),
    Unregister {
        user_id: UserId,
        conn_id: ConnectionId,
    },
    Broadcast {
        message: Arc<OutboundMessage>,
        filter: DeliveryFilter,
        reply: oneshot::Sender<DeliveryReport>,
    },
    SendToUsers {
        user_ids: Vec<UserId>,
        message: Arc<OutboundMessage>,
        reply: oneshot::Sender<DeliveryReport>,
    },
    DisconnectUser {
        user_id: UserId,
        reason: String,
        reply: oneshot::Sender<bool>,
    },
    ConnectedUsers(oneshot::Sender<Vec<UserId>>),
    Stats(oneshot::Sender<ConnectionStats>),
    UserConnection(UserId, oneshot::Sender<Option<UserConnectionInfo>>),
    AllActiveConnections(oneshot::Sender<Vec<ConnectionInfo>>),
    UserActiveConnections(UserId, oneshot::Sender<Vec<ConnectionInfo>>),
}

/// The control loop state. Constructed and consumed by [`Hub::spawn`].
pub struct Hub {
    registry: Registry,
    counters: Counters,
    config: HubConfig,
    commands: mpsc::Receiver<HubCommand>,
}

impl Hub {
    /// Spawns the control loop and returns the handle used to talk to it.
    ///
    /// The loop runs until every `HubHandle` clone has been dropped.
    pub fn spawn(config: HubConfig) -> HubHandle {
        let (tx, rx) = mpsc::channel(config.command_capacity.max(1));
        let hub = Hub {
            registry: Registry::default(),
            counters: Counters::default(),
            config: config.clone(),
            commands: rx,
        };

        info!("Spawning hub control loop...");
        tokio::spawn(hub.run());

        HubHandle {
            commands: tx,
            config: Arc::new(config),
        }
    }

    async fn run(mut self) {
        while let Some(command) = self.commands.recv().await {
            self.handle(command);
        }

        let remaining = self.registry.drain();
        for handle in &remaining {
            handle.state.deactivate();
            handle.shutdown();
        }
        info!(
            closed = remaining.len(),
            "All hub handles dropped. Control loop stopped."
        );
    }

    fn handle(&mut self, command: HubCommand) {
        match command {
            HubCommand::Register(handle) => self.register(handle),
            HubCommand::Unregister { user_id, conn_id } => self.unregister(&user_id, conn_id),
            HubCommand::Broadcast {
                message,
                filter,
                reply,
            } => {
                let report = self.broadcast(&message, &filter);
                let _ = reply.send(report);
            }
            HubCommand::SendToUsers {
                user_ids,
                message,
                reply,
            } => {
                let report = self.send_to_users(&user_ids, &message);
                let _ = reply.send(report);
            }
            HubCommand::DisconnectUser {
                user_id,
                reason,
                reply,
            } => {
                let existed = self.disconnect_user(&user_id, &reason);
                let _ = reply.send(existed);
            }
            HubCommand::ConnectedUsers(reply) => {
                let _ = reply.send(presence::connected_users(&self.registry));
            }
            HubCommand::Stats(reply) => {
                let _ = reply.send(presence::connection_stats(&self.registry, &self.counters));
            }
            HubCommand::UserConnection(user_id, reply) => {
                let _ = reply.send(presence::user_connection(&self.registry, &user_id));
            }
            HubCommand::AllActiveConnections(reply) => {
                let _ = reply.send(presence::all_active_connections(&self.registry));
            }
            HubCommand::UserActiveConnections(user_id, reply) => {
                let _ = reply.send(presence::user_active_connections(&self.registry, &user_id));
            }
        }
    }

    fn register(&mut self, handle: ConnectionHandle) {
        let user_id = handle.user_id.clone();
        let conn_id = handle.conn_id;
        let first = self.registry.insert(handle);
        info!(%user_id, %conn_id, first_device = first, "Connection registered");
        if first {
            self.announce_presence(&user_id, "online");
        }
    }

    fn unregister(&mut self, user_id: &str, conn_id: ConnectionId) {
        match self.registry.remove(user_id, conn_id) {
            Some((handle, user_gone)) => {
                handle.state.deactivate();
                handle.shutdown();
                info!(%user_id, %conn_id, "Connection unregistered");
                if user_gone {
                    self.announce_presence(user_id, "offline");
                }
            }
            None => debug!(%user_id, %conn_id, "Unregister of unknown connection ignored"),
        }
    }

    fn broadcast(
        &mut self,
        message: &Arc<OutboundMessage>,
        filter: &DeliveryFilter,
    ) -> DeliveryReport {
        let report = deliver_all(
            self.registry
                .connections()
                .filter(|handle| matches(handle, message, filter)),
            message,
        );
        self.record(report);
        debug!(kind = %message.kind, ?report, "Broadcast fanned out");
        report
    }

    fn send_to_users(
        &mut self,
        user_ids: &[UserId],
        message: &Arc<OutboundMessage>,
    ) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        let mut seen = HashSet::new();
        for user_id in user_ids.iter().filter(|user_id| seen.insert(*user_id)) {
            let targets = self
                .registry
                .user_connections(user_id)
                .filter(|handle| handle.is_active());
            let user_report = deliver_all(targets, message);
            if user_report.is_unreachable() {
                debug!(%user_id, kind = %message.kind, "Direct message to offline user skipped");
            }
            report.merge(user_report);
        }
        self.record(report);
        report
    }

    fn disconnect_user(&mut self, user_id: &str, reason: &str) -> bool {
        let handles = self.registry.remove_user(user_id);
        if handles.is_empty() {
            debug!(%user_id, "Disconnect requested for user with no connections");
            return false;
        }
        for handle in &handles {
            handle.state.deactivate();
            // Best-effort notice; the shutdown signal below forces the close.
            let _ = handle.try_deliver(Envelope::Close(reason.to_owned()));
            handle.shutdown();
        }
        info!(%user_id, %reason, connections = handles.len(), "User disconnected by request");
        self.announce_presence(user_id, "offline");
        true
    }

    fn announce_presence(&mut self, user_id: &str, status: &str) {
        if !self.config.broadcast_presence {
            return;
        }
        let message = Arc::new(OutboundMessage::new(
            OutboundType::UserStatus,
            json!({ "userId": user_id, "status": status }),
        ));
        let filter = DeliveryFilter::everyone().exclude([user_id]);
        self.broadcast(&message, &filter);
    }

    fn record(&mut self, report: DeliveryReport) {
        self.counters.delivered += report.delivered as u64;
        self.counters.dropped += report.dropped as u64;
        if report.dropped > 0 {
            warn!(
                dropped = report.dropped,
                delivered = report.delivered,
                "Some recipients did not get the message"
            );
        }
    }
}

fn deliver_all<'a, I>(targets: I, message: &Arc<OutboundMessage>) -> DeliveryReport
where
    I: Iterator<Item = &'a ConnectionHandle>,
{
    let mut report = DeliveryReport::default();
    for handle in targets {
        report.matched += 1;
        match handle.try_deliver(Envelope::Message(Arc::clone(message))) {
            Ok(()) => report.delivered += 1,
            Err(_) => report.dropped += 1,
        }
    }
    report
}

/// A cheap, cloneable handle to the hub's control loop.
///
/// This is the only way the rest of the application reaches the registry:
/// the upgrade endpoint, the clients and the admin surface each hold a clone.
#[derive(Clone)]
pub struct HubHandle {
    commands: mpsc::Sender<HubCommand>,
    config: Arc<HubConfig>,
}

impl std::fmt::Debug for HubHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubHandle")
            .field("closed", &self.commands.is_closed())
            .field("queued_capacity", &self.commands.capacity())
            .finish()
    }
}

impl HubHandle {
    /// The configuration the hub was spawned with.
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    async fn send(&self, command: HubCommand) -> Result<(), HubError> {
        self.commands.send(command).await.map_err(|_| HubError::Closed)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> HubCommand,
    ) -> Result<T, HubError> {
        let (reply, response) = oneshot::channel();
        self.send(build(reply)).await?;
        response.await.map_err(|_| HubError::Closed)
    }

    pub(crate) async fn register(&self, handle: ConnectionHandle) -> Result<(), HubError> {
        self.send(HubCommand::Register(handle)).await
    }

    /// Removes one connection. Unknown connections are ignored.
    pub async fn unregister(&self, user_id: &str, conn_id: ConnectionId) -> Result<(), HubError> {
        self.send(HubCommand::Unregister {
            user_id: user_id.to_owned(),
            conn_id,
        })
        .await
    }

    /// Fans `message` out to every active connection matching `filter`.
    ///
    /// Never waits on a slow consumer: full mailboxes are counted in the
    /// report's `dropped` and skipped.
    pub async fn broadcast(
        &self,
        message: OutboundMessage,
        filter: DeliveryFilter,
    ) -> Result<DeliveryReport, HubError> {
        message.validate()?;
        let message = Arc::new(message);
        self.request(|reply| HubCommand::Broadcast {
            message,
            filter,
            reply,
        })
        .await
    }

    /// Delivers to every live device of `user_id`. An offline user yields an
    /// unreachable report, not an error.
    pub async fn send_to_user(
        &self,
        user_id: &str,
        message: OutboundMessage,
    ) -> Result<DeliveryReport, HubError> {
        if user_id.trim().is_empty() {
            return Err(HubError::InvalidUserId);
        }
        self.send_to_users(&[user_id.to_owned()], message).await
    }

    /// Delivers to every live device of each listed user.
    pub async fn send_to_users(
        &self,
        user_ids: &[UserId],
        message: OutboundMessage,
    ) -> Result<DeliveryReport, HubError> {
        if user_ids.is_empty() {
            return Err(HubError::EmptyRecipients);
        }
        if user_ids.iter().any(|user_id| user_id.trim().is_empty()) {
            return Err(HubError::InvalidUserId);
        }
        message.validate()?;
        let message = Arc::new(message);
        let user_ids = user_ids.to_vec();
        self.request(|reply| HubCommand::SendToUsers {
            user_ids,
            message,
            reply,
        })
        .await
    }

    /// Closes every connection of `user_id`. Returns whether any existed.
    pub async fn disconnect_user(&self, user_id: &str, reason: &str) -> Result<bool, HubError> {
        let user_id = user_id.to_owned();
        let reason = reason.to_owned();
        self.request(|reply| HubCommand::DisconnectUser {
            user_id,
            reason,
            reply,
        })
        .await
    }

    pub async fn connected_users(&self) -> Result<Vec<UserId>, HubError> {
        self.request(HubCommand::ConnectedUsers).await
    }

    pub async fn connection_stats(&self) -> Result<ConnectionStats, HubError> {
        self.request(HubCommand::Stats).await
    }

    pub async fn user_connection(
        &self,
        user_id: &str,
    ) -> Result<Option<UserConnectionInfo>, HubError> {
        let user_id = user_id.to_owned();
        self.request(|reply| HubCommand::UserConnection(user_id, reply))
            .await
    }

    pub async fn all_active_connections(&self) -> Result<Vec<ConnectionInfo>, HubError> {
        self.request(HubCommand::AllActiveConnections).await
    }

    pub async fn user_active_connections(
        &self,
        user_id: &str,
    ) -> Result<Vec<ConnectionInfo>, HubError> {
        let user_id = user_id.to_owned();
        self.request(|reply| HubCommand::UserActiveConnections(user_id, reply))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::registry::test_support::detached;
    use once_cell::sync::Lazy;
    use serde_json::json;
    use tokio::sync::mpsc::error::TryRecvError;
    use tokio::sync::watch;

    static TRACING: Lazy<()> = Lazy::new(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
    });

    fn location(user: &str) -> OutboundMessage {
        OutboundMessage::new(
            OutboundType::LocationUpdate,
            json!({"userId": user, "lat": 48.85, "lng": 2.35}),
        )
    }

    /// The client-side ends of a registered connection.
    struct Peer {
        mailbox: mpsc::Receiver<Envelope>,
        shutdown: watch::Receiver<bool>,
    }

    async fn connect(hub: &HubHandle, user: &str, capacity: usize) -> Peer {
        let conn = detached(user, capacity);
        hub.register(conn.handle).await.unwrap();
        Peer {
            mailbox: conn.mailbox,
            shutdown: conn.shutdown,
        }
    }

    fn expect_message(peer: &mut Peer) -> Arc<OutboundMessage> {
        match peer.mailbox.try_recv() {
            Ok(Envelope::Message(msg)) => msg,
            other => panic!("expected a message, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn multi_device_user_receives_on_every_connection() {
        Lazy::force(&TRACING);
        let hub = Hub::spawn(HubConfig::default());
        let mut phone = connect(&hub, "u1", 8).await;
        let mut tablet = connect(&hub, "u1", 8).await;

        let first = location("u9");
        let second = OutboundMessage::new(OutboundType::ChatMessage, json!({"text": "hi"}));
        let report = hub.send_to_user("u1", first.clone()).await.unwrap();
        assert_eq!(report.delivered, 2);
        hub.send_to_user("u1", second.clone()).await.unwrap();

        for device in [&mut phone, &mut tablet] {
            assert_eq!(*expect_message(device), first);
            assert_eq!(*expect_message(device), second);
        }
    }

    #[tokio::test]
    async fn sending_to_offline_user_is_not_an_error() {
        Lazy::force(&TRACING);
        let hub = Hub::spawn(HubConfig::default());
        let report = hub.send_to_user("nobody", location("u1")).await.unwrap();
        assert!(report.is_unreachable());
        assert_eq!(report.matched, 0);
    }

    #[tokio::test]
    async fn disconnecting_unknown_user_returns_false_without_mutation() {
        Lazy::force(&TRACING);
        let hub = Hub::spawn(HubConfig::default());
        let _u1 = connect(&hub, "u1", 8).await;
        let before = hub.connection_stats().await.unwrap();

        assert!(!hub.disconnect_user("ghost", "test").await.unwrap());

        let after = hub.connection_stats().await.unwrap();
        assert_eq!(before.connections_per_user, after.connections_per_user);
        assert_eq!(hub.connected_users().await.unwrap(), vec!["u1"]);
    }

    #[tokio::test]
    async fn broadcast_respects_exclusion() {
        Lazy::force(&TRACING);
        let hub = Hub::spawn(HubConfig::default());
        let mut u1 = connect(&hub, "u1", 8).await;
        let mut u2 = connect(&hub, "u2", 8).await;
        let mut u3 = connect(&hub, "u3", 8).await;

        let report = hub
            .broadcast(location("u0"), DeliveryFilter::everyone().exclude(["u2"]))
            .await
            .unwrap();

        assert_eq!(report.matched, 2);
        assert_eq!(report.delivered, 2);
        expect_message(&mut u1);
        expect_message(&mut u3);
        assert!(matches!(u2.mailbox.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn full_mailbox_does_not_block_other_recipients() {
        Lazy::force(&TRACING);
        let hub = Hub::spawn(HubConfig::default());
        let mut fast_a = connect(&hub, "a", 8).await;
        let mut slow = connect(&hub, "slow", 1).await;
        let mut fast_b = connect(&hub, "b", 8).await;

        hub.send_to_user("slow", location("x")).await.unwrap();
        let report = hub
            .broadcast(location("y"), DeliveryFilter::everyone())
            .await
            .unwrap();

        assert_eq!(report.matched, 3);
        assert_eq!(report.delivered, 2);
        assert_eq!(report.dropped, 1);
        expect_message(&mut fast_a);
        expect_message(&mut fast_b);
        // Only the first message made it into the slow mailbox.
        expect_message(&mut slow);
        assert!(slow.mailbox.try_recv().is_err());

        let stats = hub.connection_stats().await.unwrap();
        assert_eq!(stats.messages_dropped, 1);
        assert_eq!(stats.messages_delivered, 3);
    }

    #[tokio::test]
    async fn unregister_twice_equals_once() {
        Lazy::force(&TRACING);
        let hub = Hub::spawn(HubConfig::default());
        let conn = detached("u1", 8);
        let conn_id = conn.handle.conn_id;
        let state = Arc::clone(&conn.handle.state);
        hub.register(conn.handle).await.unwrap();
        let _other = connect(&hub, "u2", 8).await;

        hub.unregister("u1", conn_id).await.unwrap();
        let once = hub.connection_stats().await.unwrap();
        hub.unregister("u1", conn_id).await.unwrap();
        let twice = hub.connection_stats().await.unwrap();

        assert_eq!(once.connections_per_user, twice.connections_per_user);
        assert_eq!(twice.total_connections, 1);
        assert!(!state.is_active());
        assert!(*conn.shutdown.borrow());
    }

    #[tokio::test]
    async fn disconnect_user_sends_notice_and_removes_every_device() {
        Lazy::force(&TRACING);
        let hub = Hub::spawn(HubConfig::default());
        let mut phone = connect(&hub, "u1", 8).await;
        let mut laptop = connect(&hub, "u1", 8).await;

        assert!(hub.disconnect_user("u1", "account suspended").await.unwrap());

        for device in [&mut phone, &mut laptop] {
            match device.mailbox.try_recv() {
                Ok(Envelope::Close(reason)) => assert_eq!(reason, "account suspended"),
                other => panic!("expected close notice, got {:?}", other),
            }
            assert!(*device.shutdown.borrow());
        }
        assert!(hub.connected_users().await.unwrap().is_empty());
        assert!(hub.user_connection("u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn deactivated_connections_leave_presence_immediately() {
        Lazy::force(&TRACING);
        let hub = Hub::spawn(HubConfig::default());
        let conn = detached("u1", 8);
        let state = Arc::clone(&conn.handle.state);
        hub.register(conn.handle).await.unwrap();
        assert_eq!(hub.connected_users().await.unwrap(), vec!["u1"]);

        state.deactivate();
        assert!(hub.connected_users().await.unwrap().is_empty());
        assert!(hub.all_active_connections().await.unwrap().is_empty());
        assert!(hub.user_active_connections("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_requests_are_rejected_synchronously() {
        Lazy::force(&TRACING);
        let hub = Hub::spawn(HubConfig::default());
        let empty = OutboundMessage::new(OutboundType::EmergencyAlert, serde_json::Value::Null);
        assert!(matches!(
            hub.broadcast(empty, DeliveryFilter::everyone()).await,
            Err(HubError::InvalidMessage(_))
        ));
        assert!(matches!(
            hub.send_to_users(&[], location("u1")).await,
            Err(HubError::EmptyRecipients)
        ));
        assert!(matches!(
            hub.send_to_user("  ", location("u1")).await,
            Err(HubError::InvalidUserId)
        ));
    }

    #[tokio::test]
    async fn presence_transitions_are_announced_to_others() {
        Lazy::force(&TRACING);
        let hub = Hub::spawn(HubConfig::default().with_presence_broadcast(true));
        let mut watcher = connect(&hub, "watcher", 8).await;
        let conn = detached("u1", 8);
        let conn_id = conn.handle.conn_id;
        hub.register(conn.handle).await.unwrap();
        hub.unregister("u1", conn_id).await.unwrap();
        // Round-trip through the loop so both announcements are processed.
        hub.connected_users().await.unwrap();

        let online = expect_message(&mut watcher);
        assert_eq!(online.kind, OutboundType::UserStatus);
        assert_eq!(online.data, json!({"userId": "u1", "status": "online"}));
        let offline = expect_message(&mut watcher);
        assert_eq!(offline.data, json!({"userId": "u1", "status": "offline"}));
    }

    #[tokio::test]
    async fn direct_send_to_list_deduplicates_users() {
        Lazy::force(&TRACING);
        let hub = Hub::spawn(HubConfig::default());
        let mut u1 = connect(&hub, "u1", 8).await;
        let _u2 = connect(&hub, "u2", 8).await;

        let report = hub
            .send_to_users(
                &["u1".to_string(), "u1".to_string(), "offline".to_string()],
                location("u5"),
            )
            .await
            .unwrap();
        assert_eq!(report.delivered, 1);
        expect_message(&mut u1);
        assert!(u1.mailbox.try_recv().is_err());
    }
}

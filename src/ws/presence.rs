//! Presence and statistics derived from the registry.
//!
//! Every function here is a pure read. The hub calls them from inside its
//! control loop, so each result is a consistent snapshot.

use crate::ws::registry::{ConnectionHandle, Registry};
use crate::ws::types::{ConnectionId, UserId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// Introspection view of one connection.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub is_active: bool,
    pub delivered_messages: u64,
    pub dropped_messages: u64,
}

/// All live connections of one user.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserConnectionInfo {
    pub user_id: UserId,
    pub is_online: bool,
    pub connection_count: usize,
    pub connections: Vec<ConnectionInfo>,
}

/// Aggregate counters for administrative dashboards.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStats {
    pub total_users: usize,
    pub total_connections: usize,
    pub connections_per_user: BTreeMap<UserId, usize>,
    pub messages_delivered: u64,
    pub messages_dropped: u64,
    pub started_at: DateTime<Utc>,
    pub uptime_seconds: i64,
}

/// Hub-lifetime delivery counters.
#[derive(Debug, Clone)]
pub(crate) struct Counters {
    pub(crate) delivered: u64,
    pub(crate) dropped: u64,
    pub(crate) started_at: DateTime<Utc>,
}

impl Default for Counters {
    fn default() -> Self {
        Self {
            delivered: 0,
            dropped: 0,
            started_at: Utc::now(),
        }
    }
}

fn info_of(handle: &ConnectionHandle) -> ConnectionInfo {
    ConnectionInfo {
        connection_id: handle.conn_id,
        user_id: handle.user_id.clone(),
        connected_at: handle.state.connected_at(),
        last_activity: handle.state.last_activity(),
        is_active: handle.is_active(),
        delivered_messages: handle.state.delivered(),
        dropped_messages: handle.state.dropped(),
    }
}

fn sorted(mut infos: Vec<ConnectionInfo>) -> Vec<ConnectionInfo> {
    infos.sort_by(|a, b| {
        a.user_id
            .cmp(&b.user_id)
            .then(a.connected_at.cmp(&b.connected_at))
            .then(a.connection_id.cmp(&b.connection_id))
    });
    infos
}

/// Users with at least one active connection, sorted.
pub(crate) fn connected_users(registry: &Registry) -> Vec<UserId> {
    let mut users: Vec<UserId> = registry
        .users()
        .filter(|(_, set)| set.values().any(ConnectionHandle::is_active))
        .map(|(user_id, _)| user_id.clone())
        .collect();
    users.sort();
    users
}

pub(crate) fn connection_stats(registry: &Registry, counters: &Counters) -> ConnectionStats {
    let connections_per_user: BTreeMap<UserId, usize> = registry
        .users()
        .map(|(user_id, set)| {
            let live = set.values().filter(|handle| handle.is_active()).count();
            (user_id.clone(), live)
        })
        .filter(|(_, live)| *live > 0)
        .collect();

    ConnectionStats {
        total_users: connections_per_user.len(),
        total_connections: connections_per_user.values().sum(),
        connections_per_user,
        messages_delivered: counters.delivered,
        messages_dropped: counters.dropped,
        started_at: counters.started_at,
        uptime_seconds: (Utc::now() - counters.started_at).num_seconds(),
    }
}

pub(crate) fn user_active_connections(registry: &Registry, user_id: &str) -> Vec<ConnectionInfo> {
    sorted(
        registry
            .user_connections(user_id)
            .filter(|handle| handle.is_active())
            .map(info_of)
            .collect(),
    )
}

/// `None` when the user has no active connection.
pub(crate) fn user_connection(registry: &Registry, user_id: &str) -> Option<UserConnectionInfo> {
    let connections = user_active_connections(registry, user_id);
    if connections.is_empty() {
        return None;
    }
    Some(UserConnectionInfo {
        user_id: user_id.to_owned(),
        is_online: true,
        connection_count: connections.len(),
        connections,
    })
}

pub(crate) fn all_active_connections(registry: &Registry) -> Vec<ConnectionInfo> {
    sorted(
        registry
            .connections()
            .filter(|handle| handle.is_active())
            .map(info_of)
            .collect(),
    )
}

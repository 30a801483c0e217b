//! Administrative control surface.
//!
//! [`AdminService`] wraps a [`HubHandle`] with the operations an operator
//! dashboard needs. [`router`] exposes them over HTTP, authenticated with the
//! same [`TokenValidator`] as the socket endpoint:
//!
//! | Route                                      | Caller            |
//! |--------------------------------------------|-------------------|
//! | `GET  /admin/ws/users`                     | privileged        |
//! | `GET  /admin/ws/stats`                     | privileged        |
//! | `POST /admin/ws/broadcast`                 | privileged        |
//! | `POST /admin/ws/direct`                    | privileged        |
//! | `POST /admin/ws/users/{user_id}/disconnect`| privileged        |
//! | `GET  /admin/ws/users/{user_id}`           | privileged or self|
//! | `GET  /admin/ws/connections`               | any (self-scoped) |
//! | `GET  /ws/message-types`                   | any               |

use crate::auth::{TokenValidator, WsAuth};
use crate::error::{ApiError, HubError};
use crate::ws::hub::HubHandle;
use crate::ws::presence::{ConnectionInfo, ConnectionStats, UserConnectionInfo};
use crate::ws::types::{
    DeliveryFilter, DeliveryReport, Identity, MessageTypeInfo, OutboundMessage, OutboundType,
    UserId,
};
use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, instrument, warn};

const DEFAULT_DISCONNECT_REASON: &str = "disconnected by administrator";

/// Body of `POST /admin/ws/broadcast`.
///
/// The filter fields sit next to the message fields:
/// `{"type": "notification", "data": {...}, "excludeUsers": ["u2"]}`.
#[derive(Debug, Clone, Deserialize)]
pub struct BroadcastRequest {
    #[serde(rename = "type")]
    pub kind: OutboundType,
    #[serde(default)]
    pub data: Value,
    #[serde(flatten)]
    pub filter: DeliveryFilter,
}

/// Body of `POST /admin/ws/direct`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectMessageRequest {
    pub user_ids: Vec<UserId>,
    #[serde(rename = "type")]
    pub kind: OutboundType,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Deserialize)]
struct DisconnectQuery {
    reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedUsers {
    pub users: Vec<UserId>,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectOutcome {
    pub user_id: UserId,
    pub disconnected: bool,
    pub reason: String,
}

/// Success envelope for every admin route.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    pub data: T,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data,
        })
    }
}

/// Operator-facing operations over a running hub.
#[derive(Debug, Clone)]
pub struct AdminService {
    hub: HubHandle,
}

impl AdminService {
    pub fn new(hub: HubHandle) -> Self {
        Self { hub }
    }

    pub async fn connected_users(&self) -> Result<ConnectedUsers, HubError> {
        let users = self.hub.connected_users().await?;
        Ok(ConnectedUsers {
            count: users.len(),
            users,
        })
    }

    pub async fn connection_stats(&self) -> Result<ConnectionStats, HubError> {
        self.hub.connection_stats().await
    }

    pub async fn broadcast(&self, request: BroadcastRequest) -> Result<DeliveryReport, HubError> {
        let message = OutboundMessage::new(request.kind, request.data);
        self.hub.broadcast(message, request.filter).await
    }

    /// Sends one message to every device of each listed user.
    ///
    /// An empty list is a caller error, not an empty delivery.
    pub async fn send_direct(
        &self,
        request: DirectMessageRequest,
    ) -> Result<DeliveryReport, HubError> {
        let message = OutboundMessage::new(request.kind, request.data);
        self.hub.send_to_users(&request.user_ids, message).await
    }

    pub async fn disconnect_user(
        &self,
        user_id: &str,
        reason: Option<String>,
    ) -> Result<DisconnectOutcome, HubError> {
        if user_id.trim().is_empty() {
            return Err(HubError::InvalidUserId);
        }
        let reason = reason
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_DISCONNECT_REASON.to_string());
        let disconnected = self.hub.disconnect_user(user_id, &reason).await?;
        Ok(DisconnectOutcome {
            user_id: user_id.to_owned(),
            disconnected,
            reason,
        })
    }

    /// Connection info for `user_id`. An offline user is reported as such
    /// rather than as an error.
    pub async fn user_connection(&self, user_id: &str) -> Result<UserConnectionInfo, HubError> {
        Ok(self
            .hub
            .user_connection(user_id)
            .await?
            .unwrap_or_else(|| UserConnectionInfo {
                user_id: user_id.to_owned(),
                is_online: false,
                connection_count: 0,
                connections: Vec::new(),
            }))
    }

    /// Every active connection for a privileged caller, only the caller's
    /// own connections otherwise.
    pub async fn active_connections<I: Identity>(
        &self,
        caller: &I,
    ) -> Result<Vec<ConnectionInfo>, HubError> {
        if caller.is_admin() {
            self.hub.all_active_connections().await
        } else {
            self.hub.user_active_connections(&caller.user_id()).await
        }
    }
}

/// Router state: the service plus the application's token validator.
pub struct AdminState<A> {
    pub service: AdminService,
    pub validator: Arc<A>,
}

impl<A> Clone for AdminState<A> {
    fn clone(&self) -> Self {
        Self {
            service: self.service.clone(),
            validator: Arc::clone(&self.validator),
        }
    }
}

#[async_trait]
impl<A> TokenValidator for AdminState<A>
where
    A: TokenValidator + Send + Sync + 'static,
{
    type User = A::User;
    type Error = A::Error;

    async fn validate_token(&self, token: &str) -> Result<Self::User, Self::Error> {
        self.validator.validate_token(token).await
    }
}

/// Builds the admin router. Merge it into the application's router.
pub fn router<A>(service: AdminService, validator: Arc<A>) -> Router
where
    A: TokenValidator + Send + Sync + 'static,
    A::User: Identity,
{
    Router::new()
        .route("/admin/ws/users", get(list_users::<A>))
        .route("/admin/ws/stats", get(stats::<A>))
        .route("/admin/ws/broadcast", post(broadcast::<A>))
        .route("/admin/ws/direct", post(direct::<A>))
        .route("/admin/ws/users/{user_id}", get(user_info::<A>))
        .route("/admin/ws/users/{user_id}/disconnect", post(disconnect::<A>))
        .route("/admin/ws/connections", get(connections::<A>))
        .route("/ws/message-types", get(message_types::<A>))
        .with_state(AdminState { service, validator })
}

fn authorize<I: Identity>(caller: &I, privileged: bool) -> Result<(), ApiError> {
    if !caller.is_active() {
        return Err(ApiError::unauthorized("account is inactive"));
    }
    if privileged && !caller.is_admin() {
        warn!(user_id = %caller.user_id(), "Non-admin caller refused.");
        return Err(ApiError::forbidden("administrator privileges required"));
    }
    Ok(())
}

async fn list_users<A>(
    State(state): State<AdminState<A>>,
    WsAuth(caller): WsAuth<A::User>,
) -> Result<Json<ApiResponse<ConnectedUsers>>, ApiError>
where
    A: TokenValidator + Send + Sync + 'static,
    A::User: Identity,
{
    authorize(&caller, true)?;
    Ok(ApiResponse::ok(state.service.connected_users().await?))
}

async fn stats<A>(
    State(state): State<AdminState<A>>,
    WsAuth(caller): WsAuth<A::User>,
) -> Result<Json<ApiResponse<ConnectionStats>>, ApiError>
where
    A: TokenValidator + Send + Sync + 'static,
    A::User: Identity,
{
    authorize(&caller, true)?;
    Ok(ApiResponse::ok(state.service.connection_stats().await?))
}

#[instrument(skip_all, fields(admin = %caller.user_id()))]
async fn broadcast<A>(
    State(state): State<AdminState<A>>,
    WsAuth(caller): WsAuth<A::User>,
    Json(request): Json<BroadcastRequest>,
) -> Result<Json<ApiResponse<DeliveryReport>>, ApiError>
where
    A: TokenValidator + Send + Sync + 'static,
    A::User: Identity,
{
    authorize(&caller, true)?;
    let kind = request.kind;
    let report = state.service.broadcast(request).await?;
    info!(%kind, ?report, "Admin broadcast sent.");
    Ok(ApiResponse::ok(report))
}

#[instrument(skip_all, fields(admin = %caller.user_id()))]
async fn direct<A>(
    State(state): State<AdminState<A>>,
    WsAuth(caller): WsAuth<A::User>,
    Json(request): Json<DirectMessageRequest>,
) -> Result<Json<ApiResponse<DeliveryReport>>, ApiError>
where
    A: TokenValidator + Send + Sync + 'static,
    A::User: Identity,
{
    authorize(&caller, true)?;
    let report = state.service.send_direct(request).await?;
    info!(?report, "Admin direct message sent.");
    Ok(ApiResponse::ok(report))
}

#[instrument(skip_all, fields(admin = %caller.user_id(), target = %user_id))]
async fn disconnect<A>(
    State(state): State<AdminState<A>>,
    WsAuth(caller): WsAuth<A::User>,
    Path(user_id): Path<UserId>,
    Query(query): Query<DisconnectQuery>,
) -> Result<Json<ApiResponse<DisconnectOutcome>>, ApiError>
where
    A: TokenValidator + Send + Sync + 'static,
    A::User: Identity,
{
    authorize(&caller, true)?;
    let outcome = state.service.disconnect_user(&user_id, query.reason).await?;
    info!(disconnected = outcome.disconnected, "Admin disconnect processed.");
    Ok(ApiResponse::ok(outcome))
}

async fn user_info<A>(
    State(state): State<AdminState<A>>,
    WsAuth(caller): WsAuth<A::User>,
    Path(user_id): Path<UserId>,
) -> Result<Json<ApiResponse<UserConnectionInfo>>, ApiError>
where
    A: TokenValidator + Send + Sync + 'static,
    A::User: Identity,
{
    authorize(&caller, caller.user_id() != user_id)?;
    Ok(ApiResponse::ok(state.service.user_connection(&user_id).await?))
}

async fn connections<A>(
    State(state): State<AdminState<A>>,
    WsAuth(caller): WsAuth<A::User>,
) -> Result<Json<ApiResponse<Vec<ConnectionInfo>>>, ApiError>
where
    A: TokenValidator + Send + Sync + 'static,
    A::User: Identity,
{
    authorize(&caller, false)?;
    Ok(ApiResponse::ok(
        state.service.active_connections(&caller).await?,
    ))
}

async fn message_types<A>(
    WsAuth(caller): WsAuth<A::User>,
) -> Result<Json<ApiResponse<Vec<MessageTypeInfo>>>, ApiError>
where
    A: TokenValidator + Send + Sync + 'static,
    A::User: Identity,
{
    authorize(&caller, false)?;
    Ok(ApiResponse::ok(OutboundType::catalog()))
}

use axum::{
    Router,
    extract::{
        State,
        ws::{WebSocketUpgrade, rejection::WebSocketUpgradeRejection},
    },
    http::StatusCode,
    routing::get,
};
use circle_realtime_hub::{
    admin::{self, AdminService},
    prelude::*,
};
use serde_json::{Value, json};
use std::{fmt, net::SocketAddr, sync::Arc};
use tracing::info;

// 1. Define the authenticated member and the token validator.

#[derive(Debug)]
struct AuthError(String);

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for AuthError {}

#[derive(Debug, Clone)]
struct Member {
    id: UserId,
    admin: bool,
}

impl Identity for Member {
    fn user_id(&self) -> UserId {
        self.id.clone()
    }

    fn is_admin(&self) -> bool {
        self.admin
    }
}

/// Accepts `<user_id>` or `<user_id>:admin` as a token. Demo only.
struct DemoSessions;

#[async_trait::async_trait]
impl TokenValidator for DemoSessions {
    type User = Member;
    type Error = AuthError;

    async fn validate_token(&self, token: &str) -> Result<Self::User, Self::Error> {
        let (id, role) = token.split_once(':').unwrap_or((token, ""));
        if id.is_empty() {
            return Err(AuthError("empty token".to_string()));
        }
        Ok(Member {
            id: id.to_string(),
            admin: role == "admin",
        })
    }
}

// 2. Implement EventHandler: what each client request means for this app.

struct CircleEvents;

impl CircleEvents {
    fn with_sender(data: Value, sender: &str) -> Value {
        match data {
            Value::Object(mut map) => {
                map.insert("userId".to_string(), Value::String(sender.to_string()));
                Value::Object(map)
            }
            other => json!({ "userId": sender, "payload": other }),
        }
    }
}

#[async_trait::async_trait]
impl EventHandler for CircleEvents {
    async fn on_connect(&self, context: &ConnectionContext) {
        info!(user_id = %context.user_id, conn_id = %context.conn_id, "Member connected");
    }

    async fn handle_request(
        &self,
        request: InboundRequest,
        context: &ConnectionContext,
    ) -> Result<Option<Value>, HandlerError> {
        let data = Self::with_sender(request.data, &context.user_id);
        let others = DeliveryFilter::everyone().exclude([context.user_id.clone()]);

        let report = match request.kind {
            InboundType::LocationUpdate => {
                let message = OutboundMessage::new(OutboundType::LocationUpdate, data);
                context.hub.broadcast(message, others).await
            }
            InboundType::TypingIndicator => {
                let message = OutboundMessage::new(OutboundType::TypingIndicator, data);
                context.hub.broadcast(message, others).await
            }
            InboundType::EmergencyAlert => {
                let message = OutboundMessage::new(OutboundType::EmergencyAlert, data);
                context.hub.broadcast(message, DeliveryFilter::everyone()).await
            }
            InboundType::SendMessage => {
                let recipients: Vec<UserId> = data
                    .get("recipients")
                    .cloned()
                    .map(serde_json::from_value)
                    .transpose()?
                    .unwrap_or_default();
                let message = OutboundMessage::new(OutboundType::ChatMessage, data);
                if recipients.is_empty() {
                    context.hub.broadcast(message, others).await
                } else {
                    context.hub.send_to_users(&recipients, message).await
                }
            }
            InboundType::Ping => return Ok(None),
        };

        let report = report.map_err(|e| {
            HandlerError::Custom(StatusCode::SERVICE_UNAVAILABLE, Some(e.to_string()))
        })?;
        Ok(Some(serde_json::to_value(report)?))
    }

    async fn on_disconnect(&self, context: &ConnectionContext) {
        info!(user_id = %context.user_id, conn_id = %context.conn_id, "Member disconnected");
    }
}

// 3. Axum state for the socket route. It must validate tokens for `WsAuth`.

#[derive(Clone)]
struct ServerState {
    sessions: Arc<DemoSessions>,
    realtime: Arc<RealtimeService<CircleEvents>>,
}

#[async_trait::async_trait]
impl TokenValidator for ServerState {
    type User = Member;
    type Error = AuthError;

    async fn validate_token(&self, token: &str) -> Result<Self::User, Self::Error> {
        self.sessions.validate_token(token).await
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("location_hub=info".parse()?)
                .add_directive("circle_realtime_hub=info".parse()?),
        )
        .init();

    let config = HubConfig::from_env()?;
    info!(?config, "Loaded hub configuration");

    let realtime = RealtimeService::new(config, CircleEvents);
    let sessions = Arc::new(DemoSessions);
    let admin_routes = admin::router(AdminService::new(realtime.hub().clone()), Arc::clone(&sessions));

    let server_state = ServerState { sessions, realtime };

    let app = Router::new()
        .route(
            "/ws",
            get(
                |ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
                 State(state): State<ServerState>,
                 WsAuth(member): WsAuth<Member>| async move {
                    upgrade_handler(ws, State(state.realtime), member).await
                },
            ),
        )
        .route("/health", get(|| async { "OK" }))
        .with_state(server_state)
        .merge(admin_routes);

    let addr = SocketAddr::from(([127, 0, 0, 1], 3000));
    info!("Listening on {}", addr);
    info!("Connect with: websocat 'ws://127.0.0.1:3000/ws?token=alice'");

    axum::serve(tokio::net::TcpListener::bind(addr).await?, app).await?;
    Ok(())
}

//! One `Client` per physical socket.
//!
//! A client owns exactly two tasks: the inbound pump (socket → codec →
//! business handler) and the outbound pump (mailbox → sanitizer → socket,
//! plus keepalive pings). Whichever pump stops first takes the other one
//! down, and the hub is asked to unregister the connection exactly once.

use crate::config::HubConfig;
use crate::error::{FrameError, TransportError};
use crate::ws::codec::{self, FrameCodec};
use crate::ws::handler::{ConnectionContext, EventHandler};
use crate::ws::hub::HubHandle;
use crate::ws::registry::{ConnectionHandle, ConnectionState};
use crate::ws::types::{Envelope, InboundType, OutboundMessage, UserId};
use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, close_code};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde_json::Value;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Close reasons must fit in a control frame.
const MAX_CLOSE_REASON: usize = 123;

/// The live session object for one socket.
pub struct Client<H: EventHandler> {
    context: ConnectionContext,
    state: Arc<ConnectionState>,
    handler: Arc<H>,
    codec: Arc<FrameCodec>,
    config: HubConfig,
    mailbox_tx: mpsc::Sender<Envelope>,
    mailbox_rx: mpsc::Receiver<Envelope>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<H: EventHandler> Client<H> {
    /// Creates an active client with a fresh connection id and an empty mailbox.
    pub fn new(hub: HubHandle, handler: Arc<H>, codec: Arc<FrameCodec>, user_id: UserId) -> Self {
        let config = hub.config().clone();
        let (mailbox_tx, mailbox_rx) = mpsc::channel(config.mailbox_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            context: ConnectionContext {
                conn_id: Uuid::new_v4(),
                user_id,
                hub,
            },
            state: Arc::new(ConnectionState::new()),
            handler,
            codec,
            config,
            mailbox_tx,
            mailbox_rx,
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub fn context(&self) -> &ConnectionContext {
        &self.context
    }

    /// Registers with the hub and runs both pumps until the connection ends.
    ///
    /// `sink` and `stream` are the two halves of the socket.
    #[instrument(skip_all, fields(conn_id = %self.context.conn_id, user_id = %self.context.user_id))]
    pub async fn run<Tx, Rx, E>(self, sink: Tx, stream: Rx)
    where
        Tx: Sink<Message> + Unpin + Send + 'static,
        Tx::Error: Display + Send,
        Rx: Stream<Item = Result<Message, E>> + Unpin + Send + 'static,
        E: Display + Send + 'static,
    {
        let Client {
            context,
            state,
            handler,
            codec,
            config,
            mailbox_tx,
            mailbox_rx,
            shutdown_tx,
            shutdown_rx,
        } = self;

        let record = ConnectionHandle::new(
            context.conn_id,
            context.user_id.clone(),
            Arc::clone(&state),
            mailbox_tx.clone(),
            shutdown_tx,
        );
        if context.hub.register(record).await.is_err() {
            error!("Hub is closed. Dropping connection.");
            return;
        }

        info!("Client connected and registered.");
        handler.on_connect(&context).await;

        let pong_wait = config.pong_wait;
        let mut outbound = tokio::spawn(outbound_pump(
            sink,
            mailbox_rx,
            shutdown_rx,
            Arc::clone(&state),
            config,
        ));
        let inbound_pump = InboundPump {
            context: context.clone(),
            handler: Arc::clone(&handler),
            codec,
            replies: mailbox_tx,
            state: Arc::clone(&state),
            pong_wait,
        };
        let mut inbound = tokio::spawn(inbound_pump.run(stream));

        let (side, outcome) = tokio::select! {
            res = &mut inbound => {
                outbound.abort();
                ("inbound", res)
            }
            res = &mut outbound => {
                inbound.abort();
                ("outbound", res)
            }
        };
        match outcome {
            Ok(Ok(())) => info!(pump = side, "Connection closed."),
            Ok(Err(e)) => warn!(pump = side, error = %e, "Connection ended by transport failure."),
            Err(e) => error!(pump = side, "Pump task failed: {}", e),
        }

        state.deactivate();
        if let Err(e) = context.hub.unregister(&context.user_id, context.conn_id).await {
            warn!("Could not unregister connection: {}", e);
        }
        handler.on_disconnect(&context).await;
    }
}

/// The reading half: decodes, validates and forwards client frames.
struct InboundPump<H: EventHandler> {
    context: ConnectionContext,
    handler: Arc<H>,
    codec: Arc<FrameCodec>,
    replies: mpsc::Sender<Envelope>,
    state: Arc<ConnectionState>,
    /// Read deadline. Any frame from the peer, pongs included, resets it.
    pong_wait: Duration,
}

impl<H: EventHandler> InboundPump<H> {
    async fn run<Rx, E>(self, mut stream: Rx) -> Result<(), TransportError>
    where
        Rx: Stream<Item = Result<Message, E>> + Unpin,
        E: Display,
    {
        debug!("Starting inbound pump.");
        loop {
            let frame = match time::timeout(self.pong_wait, stream.next()).await {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(_) => {
                    warn!(pong_wait = ?self.pong_wait, "Peer silent past the read deadline.");
                    return Err(TransportError::KeepaliveTimeout);
                }
            };
            let frame = frame.map_err(|e| TransportError::Read(e.to_string()))?;
            self.state.touch();
            match frame {
                Message::Text(text) => self.dispatch(text.as_str()).await,
                Message::Binary(_) => self.reject(None, &FrameError::Unsupported),
                Message::Ping(_) | Message::Pong(_) => {}
                Message::Close(_) => {
                    debug!("Received close frame from client.");
                    return Ok(());
                }
            }
        }
        debug!("Client stream ended.");
        Ok(())
    }

    async fn dispatch(&self, text: &str) {
        let request = match self.codec.decode(text) {
            Ok(request) => request,
            Err(e) => {
                self.reject(FrameCodec::request_id_of(text), &e);
                return;
            }
        };
        debug!(kind = %request.kind, request_id = ?request.request_id, "Received request from client");

        let request_id = request.request_id.clone();
        let kind = request.kind;
        if kind == InboundType::Ping {
            self.reply(OutboundMessage::success(request_id, "pong", Value::Null));
            return;
        }

        match self.handler.handle_request(request, &self.context).await {
            Ok(data) => self.reply(OutboundMessage::success(
                request_id,
                format!("{} accepted", kind),
                data.unwrap_or(Value::Null),
            )),
            Err(e) => {
                warn!(%kind, "Handler rejected request: {}", e.client_message());
                self.reply(OutboundMessage::error(
                    request_id,
                    e.client_code(),
                    e.client_message(),
                ));
            }
        }
    }

    fn reject(&self, request_id: Option<String>, error: &FrameError) {
        warn!("Rejected frame from client: {}", error);
        self.reply(OutboundMessage::error(
            request_id,
            error.code(),
            error.to_string(),
        ));
    }

    /// Replies share the mailbox, so they stay in order with hub traffic.
    fn reply(&self, message: OutboundMessage) {
        match self.replies.try_send(Envelope::Message(Arc::new(message))) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Outbound mailbox full, dropping reply.");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Outbound pump gone, dropping reply.");
            }
        }
    }
}

/// The writing half: drains the mailbox in FIFO order and keeps the socket alive.
async fn outbound_pump<Tx>(
    mut sink: Tx,
    mut mailbox: mpsc::Receiver<Envelope>,
    mut shutdown: watch::Receiver<bool>,
    state: Arc<ConnectionState>,
    config: HubConfig,
) -> Result<(), TransportError>
where
    Tx: Sink<Message> + Unpin,
    Tx::Error: Display,
{
    debug!("Starting outbound pump.");
    let mut keepalive = time::interval_at(Instant::now() + config.ping_interval, config.ping_interval);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                // Forced close: look for a queued notice, skip everything else.
                let mut reason = None;
                while let Ok(envelope) = mailbox.try_recv() {
                    if let Envelope::Close(notice) = envelope {
                        reason = Some(notice);
                    }
                }
                close_socket(&mut sink, reason, config.write_wait).await;
                return Ok(());
            }
            envelope = mailbox.recv() => match envelope {
                Some(Envelope::Message(message)) => {
                    let text = match codec::encode(&message) {
                        Ok(text) => text,
                        Err(e) => {
                            error!(kind = %message.kind, "Dropping unencodable message: {}", e);
                            continue;
                        }
                    };
                    write(&mut sink, Message::Text(Utf8Bytes::from(text)), config.write_wait).await?;
                }
                Some(Envelope::Close(reason)) => {
                    close_socket(&mut sink, Some(reason), config.write_wait).await;
                    return Ok(());
                }
                None => {
                    close_socket(&mut sink, None, config.write_wait).await;
                    return Ok(());
                }
            },
            _ = keepalive.tick() => {
                if state.idle_for() > config.pong_wait {
                    return Err(TransportError::KeepaliveTimeout);
                }
                write(&mut sink, Message::Ping(Bytes::new()), config.write_wait).await?;
            }
        }
    }
}

async fn write<Tx>(sink: &mut Tx, frame: Message, deadline: Duration) -> Result<(), TransportError>
where
    Tx: Sink<Message> + Unpin,
    Tx::Error: Display,
{
    match time::timeout(deadline, sink.send(frame)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(TransportError::Write(e.to_string())),
        Err(_) => Err(TransportError::WriteTimeout),
    }
}

/// Best-effort close frame followed by closing the sink.
async fn close_socket<Tx>(sink: &mut Tx, reason: Option<String>, deadline: Duration)
where
    Tx: Sink<Message> + Unpin,
    Tx::Error: Display,
{
    let mut reason = reason.unwrap_or_default();
    if reason.len() > MAX_CLOSE_REASON {
        let mut cut = MAX_CLOSE_REASON;
        while !reason.is_char_boundary(cut) {
            cut -= 1;
        }
        reason.truncate(cut);
    }
    let frame = Message::Close(Some(CloseFrame {
        code: close_code::NORMAL,
        reason: Utf8Bytes::from(reason),
    }));
    if let Err(e) = write(sink, frame, deadline).await {
        debug!("Could not send close frame: {}", e);
    }
    let _ = time::timeout(deadline, sink.close()).await;
}

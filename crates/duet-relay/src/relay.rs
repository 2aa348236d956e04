//! Core relay logic: shared state, event fan-out, and the WebSocket loop.

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use duet_core::room::RoomId;
use futures::{Sink, SinkExt, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::auth::{Authenticator, TokenAuthenticator};
use crate::config::RelayConfig;
use crate::delivery::DeliveryEngine;
use crate::gateway::MessageStore;
use crate::presence::{ConnectionId, LocalPresence, PresenceRegistry};
use crate::protocol::{ClientEvent, ServerEvent};
use crate::session::{self, Session};
use crate::typing::TypingTracker;

/// Who an outbound event is for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Every connection subscribed to the room.
    Room(RoomId),
    /// One connection. With `unless_in`, skipped when that connection is
    /// already subscribed to the room (it sees the room broadcast instead).
    Connection {
        id: ConnectionId,
        unless_in: Option<RoomId>,
    },
    /// Every authenticated connection.
    Everyone,
}

#[derive(Debug, Clone)]
pub struct Outbound {
    pub target: Target,
    pub event: ServerEvent,
}

/// Process-wide fan-out. Every connection subscribes and filters for itself.
#[derive(Clone)]
pub struct Hub {
    tx: broadcast::Sender<Outbound>,
}

impl Hub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Outbound> {
        self.tx.subscribe()
    }

    fn send(&self, target: Target, event: ServerEvent) {
        // No receivers just means nobody is connected.
        let _ = self.tx.send(Outbound { target, event });
    }

    pub fn to_room(&self, room: &RoomId, event: ServerEvent) {
        self.send(Target::Room(room.clone()), event);
    }

    pub fn to_connection(&self, id: ConnectionId, event: ServerEvent) {
        self.send(Target::Connection { id, unless_in: None }, event);
    }

    pub fn to_connection_outside(&self, id: ConnectionId, room: &RoomId, event: ServerEvent) {
        self.send(
            Target::Connection {
                id,
                unless_in: Some(room.clone()),
            },
            event,
        );
    }

    pub fn to_everyone(&self, event: ServerEvent) {
        self.send(Target::Everyone, event);
    }
}

/// Whether connection `me` (user `user_id`, subscribed to `rooms`) should get `out`.
pub fn accepts(out: &Outbound, me: ConnectionId, user_id: &str, rooms: &HashSet<RoomId>) -> bool {
    let addressed = match &out.target {
        Target::Room(room) => rooms.contains(room),
        Target::Connection { id, unless_in } => {
            *id == me && unless_in.as_ref().is_none_or(|room| !rooms.contains(room))
        }
        Target::Everyone => true,
    };
    if !addressed {
        return false;
    }
    // Don't echo typing indicators back to the typist.
    !matches!(&out.event, ServerEvent::Typing { user_id: from, .. } if from == user_id)
}

/// Shared relay state.
pub struct RelayState {
    pub presence: Arc<dyn PresenceRegistry>,
    pub store: Arc<dyn MessageStore>,
    pub auth: Arc<dyn Authenticator>,
    pub hub: Hub,
    pub delivery: DeliveryEngine,
    pub typing: TypingTracker,
    /// Server start time (for uptime reporting).
    pub start_time: Instant,
}

impl RelayState {
    pub fn new(config: &RelayConfig, store: Arc<dyn MessageStore>) -> Self {
        let presence: Arc<dyn PresenceRegistry> = Arc::new(LocalPresence::new());
        let auth: Arc<dyn Authenticator> =
            Arc::new(TokenAuthenticator::new(config.token_secret.clone()));
        Self::with_parts(config, store, presence, auth)
    }

    pub fn with_parts(
        config: &RelayConfig,
        store: Arc<dyn MessageStore>,
        presence: Arc<dyn PresenceRegistry>,
        auth: Arc<dyn Authenticator>,
    ) -> Self {
        let hub = Hub::new(config.broadcast_capacity);
        let delivery = DeliveryEngine::new(store.clone(), presence.clone(), hub.clone());
        let typing = TypingTracker::new(hub.clone(), config.typing_timeout);
        Self {
            presence,
            store,
            auth,
            hub,
            delivery,
            typing,
            start_time: Instant::now(),
        }
    }
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<RelayState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn send_event<S>(sink: &mut S, event: &ServerEvent) -> bool
where
    S: Sink<Message> + Unpin,
{
    match serde_json::to_string(event) {
        Ok(json) => sink.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!("Failed to encode outbound event: {e}");
            true
        }
    }
}

fn error_event(code: &str, message: impl Into<String>) -> ServerEvent {
    ServerEvent::Error {
        code: code.to_string(),
        message: message.into(),
        message_id: None,
    }
}

/// Handle a single WebSocket connection.
pub async fn handle_connection(socket: WebSocket, state: Arc<RelayState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let connection = ConnectionId::new();
    let mut user_id: Option<String> = None;

    // Nothing else is accepted until the connection is bound to a user.
    while let Some(Ok(msg)) = ws_rx.next().await {
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let reply = match serde_json::from_str::<ClientEvent>(text.as_str()) {
            Ok(ClientEvent::Authenticate { token }) => match state.auth.authenticate(&token) {
                Ok(uid) => {
                    user_id = Some(uid.clone());
                    ServerEvent::Authenticated { user_id: uid }
                }
                Err(e) => error_event("unauthorized", e.to_string()),
            },
            Ok(_) => error_event("unauthorized", "authenticate first"),
            Err(e) => error_event("bad_request", e.to_string()),
        };
        if !send_event(&mut ws_tx, &reply).await {
            return;
        }
        if user_id.is_some() {
            break;
        }
    }

    let Some(user_id) = user_id else {
        return; // Connection closed before authenticating.
    };
    info!("Connection {connection} authenticated as {user_id}");

    let mut session = Session::new(state.clone(), connection, user_id.clone());
    let rooms = session.rooms();
    let mut hub_rx = state.hub.subscribe();

    // Forward hub events addressed to this connection.
    let me = user_id.clone();
    let mut send_task = tokio::spawn(async move {
        loop {
            let out = match hub_rx.recv().await {
                Ok(out) => out,
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Connection {connection} lagged, skipped {skipped} event(s)");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            let deliver = {
                let rooms = rooms.read().await;
                accepts(&out, connection, &me, &rooms)
            };
            if deliver && !send_event(&mut ws_tx, &out.event).await {
                break;
            }
        }
    });

    // Events from one connection are handled strictly in arrival order.
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<ClientEvent>(text.as_str()) {
                    Ok(event) => session.handle(event).await,
                    Err(e) => {
                        debug!("Unparseable event from {connection}: {e}");
                        session.reject("bad_request", e.to_string());
                    }
                },
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish.
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    session::go_offline(&state, &user_id, connection).await;
    info!("Connection {connection} for {user_id} closed");
}

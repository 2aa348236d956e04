//! Per-connection event handling once a user is authenticated.

use duet_core::message::{MessageStatus, NewMessage};
use duet_core::presence::{PresenceStatus, summarize_pending};
use duet_core::room::RoomId;
use duet_core::unix_millis;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::delivery::DeliveryError;
use crate::gateway::MessageFilter;
use crate::presence::ConnectionId;
use crate::protocol::{ClientEvent, ServerEvent};
use crate::relay::RelayState;

pub struct Session {
    state: Arc<RelayState>,
    connection: ConnectionId,
    user_id: String,
    /// Conversations this connection is subscribed to. Shared with the send loop.
    rooms: Arc<RwLock<HashSet<RoomId>>>,
    registered: bool,
}

impl Session {
    pub fn new(state: Arc<RelayState>, connection: ConnectionId, user_id: String) -> Self {
        Self {
            state,
            connection,
            user_id,
            rooms: Arc::new(RwLock::new(HashSet::new())),
            registered: false,
        }
    }

    pub fn rooms(&self) -> Arc<RwLock<HashSet<RoomId>>> {
        self.rooms.clone()
    }

    /// Handle one event. Failures go back to this connection as `error` events.
    pub async fn handle(&mut self, event: ClientEvent) {
        let message_id = event.message_id().map(str::to_string);
        if let Err(e) = self.dispatch(event).await {
            debug!("{} event failed: {e}", self.user_id);
            self.report(e.code(), e.to_string(), message_id);
        }
    }

    /// Refuse something that never made it to dispatch.
    pub fn reject(&self, code: &str, message: impl Into<String>) {
        self.report(code, message.into(), None);
    }

    fn report(&self, code: &str, message: String, message_id: Option<String>) {
        self.state.hub.to_connection(
            self.connection,
            ServerEvent::Error {
                code: code.to_string(),
                message,
                message_id,
            },
        );
    }

    async fn dispatch(&mut self, event: ClientEvent) -> Result<(), DeliveryError> {
        match event {
            ClientEvent::Authenticate { .. } => {
                self.reject("bad_request", "connection is already authenticated");
            }
            ClientEvent::RegisterPresence => self.register_presence().await,
            ClientEvent::JoinConversation { partner_id } => {
                self.join_conversation(&partner_id).await?;
            }
            ClientEvent::SendMessage { message } => self.send(message).await?,
            ClientEvent::AcknowledgeDelivered { message_id } => {
                self.state
                    .delivery
                    .acknowledge_delivered(&self.user_id, &message_id)
                    .await?;
            }
            ClientEvent::AcknowledgeRead { message_ids } => {
                let outcome = self.state.delivery.acknowledge_read(&self.user_id, &message_ids).await;
                debug!("{} read {} message(s)", self.user_id, outcome.changed.len());
                for (id, e) in outcome.failed {
                    self.report(e.code(), e.to_string(), Some(id));
                }
            }
            ClientEvent::MarkConversationRead { partner_id } => {
                let partner = required_partner(&partner_id)?;
                self.state
                    .delivery
                    .mark_conversation_read(&self.user_id, partner)
                    .await?;
            }
            ClientEvent::TypingStarted { partner_id } => {
                let partner = required_partner(&partner_id)?;
                self.state.typing.started(&self.user_id, partner).await;
            }
            ClientEvent::TypingStopped { partner_id } => {
                let partner = required_partner(&partner_id)?;
                self.state.typing.stopped(&self.user_id, partner).await;
            }
            ClientEvent::SetStatus { status } => match status {
                PresenceStatus::Online => self.register_presence().await,
                PresenceStatus::Offline => {
                    go_offline(&self.state, &self.user_id, self.connection).await;
                    self.registered = false;
                }
            },
        }
        Ok(())
    }

    /// Bind this connection as the user's live one, announce it, and
    /// summarize whatever arrived while the user was away.
    async fn register_presence(&mut self) {
        let previous = self.state.presence.register(&self.user_id, self.connection).await;
        self.registered = true;
        match previous {
            Some(old) if old != self.connection => {
                info!("{} registered on {} (replacing {old})", self.user_id, self.connection)
            }
            _ => info!("{} registered on {}", self.user_id, self.connection),
        }

        self.state.hub.to_everyone(ServerEvent::PresenceChanged {
            user_id: self.user_id.clone(),
            status: PresenceStatus::Online,
            last_seen: None,
        });

        let filter = MessageFilter::to(&self.user_id).with_statuses(&[MessageStatus::Sent]);
        let pending = match self.state.store.query_messages(&filter).await {
            Ok(pending) => pending,
            Err(e) => {
                warn!("Pending scan for {} failed: {e}", self.user_id);
                return;
            }
        };
        for summary in summarize_pending(&pending) {
            self.state.hub.to_connection(
                self.connection,
                ServerEvent::PendingMessages {
                    sender_id: summary.sender,
                    count: summary.count,
                    preview: summary.preview,
                },
            );
        }
    }

    async fn join_conversation(&mut self, partner_id: &str) -> Result<(), DeliveryError> {
        let partner = required_partner(partner_id)?;
        if !self.registered {
            self.register_presence().await;
        }

        let room = RoomId::resolve(&self.user_id, partner);
        self.rooms.write().await.insert(room.clone());
        debug!("{} joined {room}", self.user_id);

        self.state.hub.to_room(
            &room,
            ServerEvent::PresenceChanged {
                user_id: self.user_id.clone(),
                status: PresenceStatus::Online,
                last_seen: None,
            },
        );

        if let Err(e) = self.state.delivery.deliver_pending_from(&self.user_id, partner).await {
            warn!("Delivering backlog from {partner} to {} failed: {e}", self.user_id);
        }

        let partner_presence = if self.state.presence.lookup(partner).await.is_some() {
            ServerEvent::PresenceChanged {
                user_id: partner.to_string(),
                status: PresenceStatus::Online,
                last_seen: None,
            }
        } else {
            let last_seen = match self.state.store.get_last_seen(partner).await {
                Ok(at) => at,
                Err(e) => {
                    warn!("Last-seen lookup for {partner} failed: {e}");
                    None
                }
            };
            ServerEvent::PresenceChanged {
                user_id: partner.to_string(),
                status: PresenceStatus::Offline,
                last_seen,
            }
        };
        self.state.hub.to_connection(self.connection, partner_presence);
        Ok(())
    }

    async fn send(&mut self, draft: NewMessage) -> Result<(), DeliveryError> {
        draft.validate()?;
        // Subscribe before the broadcast so the sender sees its own message
        // and later status changes. A failed send leaves no new subscription.
        let room = RoomId::resolve(draft.sender.trim(), draft.receiver.trim());
        let newly_joined = self.rooms.write().await.insert(room.clone());
        if let Err(e) = self.state.delivery.send(&self.user_id, draft).await {
            if newly_joined {
                self.rooms.write().await.remove(&room);
            }
            return Err(e);
        }
        Ok(())
    }
}

fn required_partner(partner_id: &str) -> Result<&str, DeliveryError> {
    let partner = partner_id.trim();
    if partner.is_empty() {
        return Err(DeliveryError::Validation("partner_id is required".to_string()));
    }
    Ok(partner)
}

/// Take `user_id` offline if `connection` is still their registered one.
///
/// Returns `false` for a superseded connection, which leaves presence and
/// last-seen untouched.
pub(crate) async fn go_offline(state: &RelayState, user_id: &str, connection: ConnectionId) -> bool {
    if !state.presence.unregister(user_id, connection).await {
        debug!("{connection} is not the live connection for {user_id}; presence unchanged");
        return false;
    }

    let now = unix_millis();
    if let Err(e) = state.store.set_last_seen(user_id, now).await {
        warn!("Failed to record last-seen for {user_id}: {e}");
    }
    state.hub.to_everyone(ServerEvent::PresenceChanged {
        user_id: user_id.to_string(),
        status: PresenceStatus::Offline,
        last_seen: Some(now),
    });
    state.typing.clear_sender(user_id).await;
    info!("{user_id} went offline");
    true
}

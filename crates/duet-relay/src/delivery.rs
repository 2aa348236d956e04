//! Delivery state machine: drives messages Sent → Delivered → Read.
//!
//! Each transition is committed per message and, when it changes stored
//! state, broadcast to the conversation as `message_status_changed`.
//! Transitions a message has already passed are silent no-ops.

use duet_core::message::{Message, MessageStatus, NewMessage, preview};
use duet_core::room::RoomId;
use duet_core::unix_millis;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::gateway::{ConversationSummary, MessageFilter, MessageStore, StatusUpdate, StoreError};
use crate::presence::PresenceRegistry;
use crate::protocol::ServerEvent;
use crate::relay::Hub;

/// Failures reported back to the caller of a delivery operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("invalid message: {0}")]
    Validation(String),

    #[error("message not found: {0}")]
    NotFound(String),

    #[error("storage unavailable: {0}")]
    Persistence(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),
}

impl DeliveryError {
    /// Stable code sent to clients in `error` events.
    pub fn code(&self) -> &'static str {
        match self {
            DeliveryError::Validation(_) => "validation",
            DeliveryError::NotFound(_) => "not_found",
            DeliveryError::Persistence(_) => "persistence",
            DeliveryError::Unauthorized(_) => "unauthorized",
        }
    }
}

impl From<StoreError> for DeliveryError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => DeliveryError::NotFound(id),
            StoreError::Duplicate(id) => {
                DeliveryError::Validation(format!("message id '{id}' already used"))
            }
            StoreError::Backend(reason) => DeliveryError::Persistence(reason),
        }
    }
}

impl From<duet_core::error::Error> for DeliveryError {
    fn from(e: duet_core::error::Error) -> Self {
        DeliveryError::Validation(e.to_string())
    }
}

/// Result of a bulk read acknowledgement. Each id succeeds or fails on its own.
#[derive(Debug, Default)]
pub struct BulkOutcome {
    /// Messages whose status actually moved.
    pub changed: Vec<Message>,
    pub failed: Vec<(String, DeliveryError)>,
}

#[derive(Clone)]
pub struct DeliveryEngine {
    store: Arc<dyn MessageStore>,
    presence: Arc<dyn PresenceRegistry>,
    hub: Hub,
}

impl DeliveryEngine {
    pub fn new(store: Arc<dyn MessageStore>, presence: Arc<dyn PresenceRegistry>, hub: Hub) -> Self {
        Self { store, presence, hub }
    }

    /// Validate, persist and route a new message from `sender`.
    ///
    /// The message is stored as `Sent`. If the receiver is online it is
    /// moved to `Delivered` before anything is broadcast, so the single
    /// `new_message` broadcast always carries the final status.
    pub async fn send(&self, sender: &str, draft: NewMessage) -> Result<Message, DeliveryError> {
        // A missing sender is left for validation to reject.
        if !draft.sender.trim().is_empty() && draft.sender.trim() != sender {
            return Err(DeliveryError::Unauthorized(format!(
                "cannot send as '{}'",
                draft.sender
            )));
        }

        let message = draft.into_message(unix_millis())?;
        let mut stored = self.store.persist_message(&message).await?;
        let room = stored.channel_id.clone();

        let receiver_conn = self.presence.lookup(&stored.receiver).await;
        if receiver_conn.is_some() {
            match self
                .store
                .update_message_status(&stored.message_id, MessageStatus::Delivered)
                .await
            {
                Ok(update) => stored = update.message,
                Err(e) => warn!(
                    "Message {} stored but not marked delivered: {e}",
                    stored.message_id
                ),
            }
        }

        info!(
            "Message {} in {} from {} to {} ({})",
            stored.message_id, room, stored.sender, stored.receiver, stored.status
        );
        self.hub.to_room(&room, ServerEvent::NewMessage { message: stored.clone() });

        if let Some(conn) = receiver_conn {
            self.hub.to_connection_outside(
                conn,
                &room,
                ServerEvent::MessageNotification {
                    sender_id: stored.sender.clone(),
                    message_id: stored.message_id.clone(),
                    preview: preview(&stored.body),
                },
            );
        }
        Ok(stored)
    }

    /// Receiver confirms it got one message. Re-acks are no-ops.
    pub async fn acknowledge_delivered(
        &self,
        actor: &str,
        message_id: &str,
    ) -> Result<Message, DeliveryError> {
        let update = self.advance(actor, message_id, MessageStatus::Delivered).await?;
        Ok(update.message)
    }

    /// Receiver marks a set of messages read. Ids are processed one by one;
    /// a failure on one id does not undo or block the others.
    pub async fn acknowledge_read(&self, actor: &str, message_ids: &[String]) -> BulkOutcome {
        let mut outcome = BulkOutcome::default();
        for id in message_ids {
            match self.advance(actor, id, MessageStatus::Read).await {
                Ok(update) if update.changed => outcome.changed.push(update.message),
                Ok(_) => {}
                Err(e) => {
                    debug!("Read ack for {id} by {actor} failed: {e}");
                    outcome.failed.push((id.clone(), e));
                }
            }
        }
        outcome
    }

    /// Mark everything `partner` sent to `actor` as read.
    /// Returns the messages that changed; an empty result means nothing was unread.
    pub async fn mark_conversation_read(
        &self,
        actor: &str,
        partner: &str,
    ) -> Result<Vec<Message>, DeliveryError> {
        let filter = MessageFilter::from_to(partner, actor)
            .with_statuses(&[MessageStatus::Sent, MessageStatus::Delivered]);
        let changed = self.store.bulk_update_status(&filter, MessageStatus::Read).await?;
        if changed.is_empty() {
            return Ok(changed);
        }

        let room = RoomId::resolve(actor, partner);
        for msg in &changed {
            self.hub.to_room(&room, ServerEvent::status_changed(msg));
        }
        if let Some(conn) = self.presence.lookup(partner).await {
            self.hub.to_connection_outside(
                conn,
                &room,
                ServerEvent::ConversationRead {
                    reader_id: actor.to_string(),
                    count: changed.len(),
                },
            );
        }
        info!("{actor} read {} message(s) from {partner}", changed.len());
        Ok(changed)
    }

    /// Move `partner`'s still-`Sent` messages to `actor` to `Delivered`.
    /// Runs when `actor` opens or fetches the conversation.
    pub async fn deliver_pending_from(
        &self,
        actor: &str,
        partner: &str,
    ) -> Result<Vec<Message>, DeliveryError> {
        let filter = MessageFilter::from_to(partner, actor).with_statuses(&[MessageStatus::Sent]);
        let changed = self
            .store
            .bulk_update_status(&filter, MessageStatus::Delivered)
            .await?;

        if !changed.is_empty() {
            let room = RoomId::resolve(actor, partner);
            for msg in &changed {
                self.hub.to_room(&room, ServerEvent::status_changed(msg));
            }
            info!("Marked {} message(s) from {partner} delivered to {actor}", changed.len());
        }
        Ok(changed)
    }

    /// One page of the conversation between `actor` and `partner`.
    /// Pending messages from the partner count as delivered once fetched,
    /// and that happens before the page is read.
    pub async fn fetch_history(
        &self,
        actor: &str,
        partner: &str,
        page: usize,
        limit: usize,
    ) -> Result<Vec<Message>, DeliveryError> {
        self.deliver_pending_from(actor, partner).await?;
        let room = RoomId::resolve(actor, partner);
        Ok(self.store.load_conversation(&room, page, limit).await?)
    }

    pub async fn conversations(&self, actor: &str) -> Result<Vec<ConversationSummary>, DeliveryError> {
        Ok(self.store.conversation_summaries(actor).await?)
    }

    async fn advance(
        &self,
        actor: &str,
        message_id: &str,
        status: MessageStatus,
    ) -> Result<StatusUpdate, DeliveryError> {
        let message = self
            .store
            .get_message(message_id)
            .await?
            .ok_or_else(|| DeliveryError::NotFound(message_id.to_string()))?;
        if message.receiver != actor {
            return Err(DeliveryError::Unauthorized(format!(
                "only the receiver can acknowledge {message_id}"
            )));
        }
        if !message.status.advances_to(status) {
            return Ok(StatusUpdate { message, changed: false });
        }

        let update = self.store.update_message_status(message_id, status).await?;
        if update.changed {
            self.hub
                .to_room(&update.message.channel_id, ServerEvent::status_changed(&update.message));
        }
        Ok(update)
    }
}

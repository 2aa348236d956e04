//! The message store gateway: the relay's only view of durable storage.
//!
//! Everything the delivery engine and sessions need from persistence goes
//! through [`MessageStore`]. The SQLite [`Storage`](crate::storage::Storage)
//! implements it today; a different backend only has to honour the same
//! contract, in particular that status updates never move a message backwards.

use async_trait::async_trait;
use duet_core::message::{Message, MessageStatus};
use duet_core::room::RoomId;
use serde::Serialize;
use thiserror::Error;

/// Errors surfaced by a [`MessageStore`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("message not found: {0}")]
    NotFound(String),

    #[error("duplicate message id: {0}")]
    Duplicate(String),

    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// Outcome of a single-message status update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    /// The message as stored after the update.
    pub message: Message,
    /// False when the message was already at or past the requested status.
    pub changed: bool,
}

/// Selects messages for queries and bulk transitions.
/// Unset fields match everything; `statuses` empty matches every status.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageFilter {
    pub channel: Option<RoomId>,
    pub sender: Option<String>,
    pub receiver: Option<String>,
    pub statuses: Vec<MessageStatus>,
}

impl MessageFilter {
    /// Messages sent by `sender` to `receiver` (one direction only).
    pub fn from_to(sender: &str, receiver: &str) -> Self {
        Self {
            channel: Some(RoomId::resolve(sender, receiver)),
            sender: Some(sender.to_string()),
            receiver: Some(receiver.to_string()),
            statuses: Vec::new(),
        }
    }

    /// Messages addressed to `receiver`, from anyone.
    pub fn to(receiver: &str) -> Self {
        Self {
            receiver: Some(receiver.to_string()),
            ..Self::default()
        }
    }

    pub fn with_statuses(mut self, statuses: &[MessageStatus]) -> Self {
        self.statuses = statuses.to_vec();
        self
    }
}

/// Read-model row for a user's conversation list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversationSummary {
    pub partner_id: String,
    pub channel_id: RoomId,
    pub last_message: Message,
    /// Messages from the partner to this user not yet read.
    pub unread_count: u64,
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a new message. Fails with `Duplicate` if the id is taken.
    async fn persist_message(&self, message: &Message) -> Result<Message, StoreError>;

    async fn get_message(&self, message_id: &str) -> Result<Option<Message>, StoreError>;

    /// Move one message forward to `status`. A request at or below the
    /// current status leaves the row untouched and reports `changed: false`.
    async fn update_message_status(
        &self,
        message_id: &str,
        status: MessageStatus,
    ) -> Result<StatusUpdate, StoreError>;

    /// Matching messages, oldest first.
    async fn query_messages(&self, filter: &MessageFilter) -> Result<Vec<Message>, StoreError>;

    /// Move every matching message below `status` up to it.
    /// Returns the messages that actually changed, in their new state.
    async fn bulk_update_status(
        &self,
        filter: &MessageFilter,
        status: MessageStatus,
    ) -> Result<Vec<Message>, StoreError>;

    /// One page of a conversation. Page 1 holds the newest `limit`
    /// messages; each page is returned oldest first.
    async fn load_conversation(
        &self,
        channel: &RoomId,
        page: usize,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError>;

    /// One row per conversation partner, newest conversation first.
    async fn conversation_summaries(
        &self,
        user_id: &str,
    ) -> Result<Vec<ConversationSummary>, StoreError>;

    async fn get_last_seen(&self, user_id: &str) -> Result<Option<u64>, StoreError>;

    async fn set_last_seen(&self, user_id: &str, at_ms: u64) -> Result<(), StoreError>;
}

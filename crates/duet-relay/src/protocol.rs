//! Messages exchanged over the relay WebSocket.
//!
//! JSON text frames, internally tagged by `type` with snake_case names:
//! `{"type":"join_conversation","partner_id":"bob"}`.

use duet_core::message::{Message, MessageStatus, NewMessage};
use duet_core::presence::PresenceStatus;
use serde::{Deserialize, Serialize};

/// Events a client sends to the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Must be the first event on a connection.
    Authenticate { token: String },

    /// Mark this connection as the user's live connection.
    RegisterPresence,

    JoinConversation { partner_id: String },

    SendMessage { message: NewMessage },

    AcknowledgeDelivered { message_id: String },

    AcknowledgeRead { message_ids: Vec<String> },

    MarkConversationRead { partner_id: String },

    TypingStarted { partner_id: String },

    TypingStopped { partner_id: String },

    /// Explicit online/offline transition without closing the socket.
    SetStatus { status: PresenceStatus },
}

impl ClientEvent {
    /// The message an event refers to, echoed back in error reports.
    pub fn message_id(&self) -> Option<&str> {
        match self {
            ClientEvent::SendMessage { message } => Some(&message.message_id),
            ClientEvent::AcknowledgeDelivered { message_id } => Some(message_id),
            _ => None,
        }
    }
}

/// Events the relay sends to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Authenticated { user_id: String },

    /// A message posted to a conversation, carrying its final immediate status.
    NewMessage { message: Message },

    /// Direct heads-up for a receiver that is online but not in the conversation.
    MessageNotification {
        sender_id: String,
        message_id: String,
        preview: String,
    },

    MessageStatusChanged {
        message_id: String,
        status: MessageStatus,
        sender_id: String,
        receiver_id: String,
    },

    /// The partner read the conversation while this user was elsewhere.
    ConversationRead { reader_id: String, count: usize },

    PresenceChanged {
        user_id: String,
        status: PresenceStatus,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        last_seen: Option<u64>,
    },

    Typing {
        user_id: String,
        partner_id: String,
        is_typing: bool,
    },

    /// Backlog summary for a reconnecting user, one per sender.
    PendingMessages {
        sender_id: String,
        count: usize,
        preview: String,
    },

    Error {
        code: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        message_id: Option<String>,
    },
}

impl ServerEvent {
    pub fn status_changed(message: &Message) -> Self {
        ServerEvent::MessageStatusChanged {
            message_id: message.message_id.clone(),
            status: message.status,
            sender_id: message.sender.clone(),
            receiver_id: message.receiver.clone(),
        }
    }
}

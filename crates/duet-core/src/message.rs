//! The direct message model and its delivery state machine.
//!
//! A message moves through three states and never back:
//!
//! ```text
//! Sent ──▶ Delivered ──▶ Read
//!   └───────────────────▲
//! ```
//!
//! `Read` is terminal. Applying a transition the message has already
//! passed is a no-op, which makes every acknowledgement idempotent.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::room::RoomId;

/// Maximum characters kept in a body preview.
pub const PREVIEW_CHARS: usize = 80;

/// Delivery status of a message. Ordered: `Sent < Delivered < Read`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sent,
    Delivered,
    Read,
}

impl MessageStatus {
    /// Whether moving from `self` to `next` advances the message.
    /// Equal or lower targets are no-ops, never errors.
    pub fn advances_to(self, next: MessageStatus) -> bool {
        next > self
    }

    /// Stable lowercase name, used on the wire and in storage.
    pub fn as_str(self) -> &'static str {
        match self {
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Read => "read",
        }
    }

    /// Numeric rank matching the `Ord` impl, for storage-side comparisons.
    pub fn rank(self) -> i64 {
        match self {
            MessageStatus::Sent => 0,
            MessageStatus::Delivered => 1,
            MessageStatus::Read => 2,
        }
    }

    pub fn from_rank(rank: i64) -> Option<Self> {
        match rank {
            0 => Some(MessageStatus::Sent),
            1 => Some(MessageStatus::Delivered),
            2 => Some(MessageStatus::Read),
            _ => None,
        }
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MessageStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sent" => Ok(MessageStatus::Sent),
            "delivered" => Ok(MessageStatus::Delivered),
            "read" => Ok(MessageStatus::Read),
            other => Err(Error::InvalidField {
                field: "status",
                reason: format!("unknown status '{other}'"),
            }),
        }
    }
}

/// A message as submitted by the sending client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    /// Client-generated, globally unique id.
    #[serde(default)]
    pub message_id: String,
    #[serde(default)]
    pub sender: String,
    #[serde(default)]
    pub receiver: String,
    #[serde(default)]
    pub body: String,
}

impl NewMessage {
    /// Reject payloads missing any required field.
    /// Whitespace-only values count as missing.
    pub fn validate(&self) -> Result<()> {
        if self.message_id.trim().is_empty() {
            return Err(Error::MissingField("message_id"));
        }
        if self.sender.trim().is_empty() {
            return Err(Error::MissingField("sender"));
        }
        if self.receiver.trim().is_empty() {
            return Err(Error::MissingField("receiver"));
        }
        if self.body.trim().is_empty() {
            return Err(Error::MissingField("body"));
        }
        Ok(())
    }

    /// Build the stored form: canonical room, status `Sent`.
    /// Ids are trimmed; the body is kept as written.
    pub fn into_message(self, created_at: u64) -> Result<Message> {
        self.validate()?;
        let sender = self.sender.trim().to_string();
        let receiver = self.receiver.trim().to_string();
        Ok(Message {
            channel_id: RoomId::resolve(&sender, &receiver),
            message_id: self.message_id.trim().to_string(),
            sender,
            receiver,
            body: self.body,
            status: MessageStatus::Sent,
            created_at,
        })
    }
}

/// A persisted direct message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: String,
    pub channel_id: RoomId,
    pub sender: String,
    pub receiver: String,
    pub body: String,
    pub status: MessageStatus,
    /// Milliseconds since the Unix epoch.
    pub created_at: u64,
}

impl Message {
    pub fn preview(&self) -> String {
        preview(&self.body)
    }
}

/// First [`PREVIEW_CHARS`] characters of `body`, cut on a char boundary.
pub fn preview(body: &str) -> String {
    body.chars().take(PREVIEW_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft() -> NewMessage {
        NewMessage {
            message_id: "m1".into(),
            sender: "A".into(),
            receiver: "B".into(),
            body: "hi".into(),
        }
    }

    #[test]
    fn status_order() {
        assert!(MessageStatus::Sent < MessageStatus::Delivered);
        assert!(MessageStatus::Delivered < MessageStatus::Read);
        for s in [MessageStatus::Sent, MessageStatus::Delivered, MessageStatus::Read] {
            assert_eq!(MessageStatus::from_rank(s.rank()), Some(s));
            assert_eq!(s.as_str().parse::<MessageStatus>().unwrap(), s);
        }
    }

    #[test]
    fn never_regresses() {
        assert!(MessageStatus::Sent.advances_to(MessageStatus::Delivered));
        assert!(MessageStatus::Sent.advances_to(MessageStatus::Read));
        assert!(MessageStatus::Delivered.advances_to(MessageStatus::Read));
        assert!(!MessageStatus::Delivered.advances_to(MessageStatus::Delivered));
        assert!(!MessageStatus::Read.advances_to(MessageStatus::Delivered));
        assert!(!MessageStatus::Read.advances_to(MessageStatus::Sent));
    }

    #[test]
    fn validate_accepts_complete_payload() {
        assert!(draft().validate().is_ok());
    }

    #[test]
    fn validate_rejects_missing_fields() {
        let mut m = draft();
        m.body = "   ".into();
        assert_eq!(m.validate(), Err(Error::MissingField("body")));

        let mut m = draft();
        m.message_id.clear();
        assert_eq!(m.validate(), Err(Error::MissingField("message_id")));

        let mut m = draft();
        m.receiver.clear();
        assert_eq!(m.validate(), Err(Error::MissingField("receiver")));
    }

    #[test]
    fn into_message_starts_sent_in_canonical_room() {
        let msg = draft().into_message(42).unwrap();
        assert_eq!(msg.status, MessageStatus::Sent);
        assert_eq!(msg.channel_id, RoomId::resolve("B", "A"));
        assert_eq!(msg.created_at, 42);
    }

    #[test]
    fn into_message_trims_ids() {
        let mut m = draft();
        m.receiver = " B ".into();
        m.body = " hi ".into();
        let msg = m.into_message(1).unwrap();
        assert_eq!(msg.receiver, "B");
        assert_eq!(msg.channel_id, RoomId::resolve("A", "B"));
        assert_eq!(msg.body, " hi ");
    }

    #[test]
    fn preview_truncates_on_char_boundary() {
        let body = "é".repeat(100);
        let p = preview(&body);
        assert_eq!(p.chars().count(), PREVIEW_CHARS);
        assert_eq!(preview("short"), "short");
    }

    #[test]
    fn status_wire_format() {
        let json = serde_json::to_string(&MessageStatus::Delivered).unwrap();
        assert_eq!(json, "\"delivered\"");
    }
}

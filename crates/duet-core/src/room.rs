//! Canonical room ids for two-party conversations.
//!
//! A room is not stored anywhere. Both participants derive the same id
//! from their two user ids, whoever opens the conversation first:
//!
//! `room_id = len(low) ":" low ":" high`, where `low <= high` lexicographically.
//!
//! The length prefix keeps the encoding unambiguous even when user ids
//! contain the separator, so distinct pairs never share a room.

use serde::{Deserialize, Serialize};

/// A canonical conversation id.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    /// Resolve the room shared by `a` and `b`. Symmetric in its arguments.
    pub fn resolve(a: &str, b: &str) -> Self {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        Self(format!("{}:{low}:{high}", low.len()))
    }

    /// Wrap an id that was already resolved (e.g. read back from storage).
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RoomId({})", self.0)
    }
}

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

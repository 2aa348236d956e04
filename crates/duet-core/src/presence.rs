//! Presence status and reconnect backlog summaries.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::message::{Message, MessageStatus};

/// Whether a user currently has a live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

/// Backlog from one sender, surfaced to a reconnecting receiver
/// instead of replaying every message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingSummary {
    pub sender: String,
    pub count: usize,
    /// Preview of the newest pending message from this sender.
    pub preview: String,
    pub latest_at: u64,
}

/// Group `Sent` messages by sender, one summary each.
///
/// Messages in any other status are ignored. Output is ordered by
/// newest backlog first so the most recent conversation surfaces on top.
pub fn summarize_pending(messages: &[Message]) -> Vec<PendingSummary> {
    let mut by_sender: HashMap<&str, PendingSummary> = HashMap::new();

    for msg in messages.iter().filter(|m| m.status == MessageStatus::Sent) {
        let entry = by_sender
            .entry(msg.sender.as_str())
            .or_insert_with(|| PendingSummary {
                sender: msg.sender.clone(),
                count: 0,
                preview: String::new(),
                latest_at: 0,
            });
        entry.count += 1;
        if entry.count == 1 || msg.created_at >= entry.latest_at {
            entry.latest_at = msg.created_at;
            entry.preview = msg.preview();
        }
    }

    let mut summaries: Vec<PendingSummary> = by_sender.into_values().collect();
    summaries.sort_by(|a, b| b.latest_at.cmp(&a.latest_at).then_with(|| a.sender.cmp(&b.sender)));
    summaries
}

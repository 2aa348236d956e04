//! # duet-core
//!
//! Core types for the Duet direct-messaging relay:
//! - Canonical, order-independent room ids for a pair of users
//! - The message model and its delivery state machine (Sent → Delivered → Read)
//! - Pending-message summaries for reconnecting users
//! - HMAC session tokens that bind a connection to a user id
//!
//! This crate has no network code and no storage code.
//! The relay crate builds on it.

pub mod error;
pub mod message;
pub mod presence;
pub mod room;
pub mod token;

/// Milliseconds since the Unix epoch.
pub fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

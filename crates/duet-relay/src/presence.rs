//! Presence registry: which user is reachable on which connection right now.
//!
//! Registry membership is the runtime source of truth for "online".
//! Durable last-seen timestamps live in the message store instead.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Opaque handle for one live WebSocket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Maps user ids to their single authoritative connection.
///
/// Implementations must make each call atomic with respect to the others.
/// `unregister` must only remove the entry when it still points at the
/// given connection, so that a late disconnect from an old socket cannot
/// evict the user's newer connection.
#[async_trait]
pub trait PresenceRegistry: Send + Sync {
    /// Bind `user_id` to `connection`, last registration wins.
    /// Returns the previously registered connection, if any.
    async fn register(&self, user_id: &str, connection: ConnectionId) -> Option<ConnectionId>;

    async fn lookup(&self, user_id: &str) -> Option<ConnectionId>;

    /// Remove the binding only if it is still `connection`. Returns whether it was removed.
    async fn unregister(&self, user_id: &str, connection: ConnectionId) -> bool;

    async fn snapshot_online(&self) -> HashSet<String>;
}

/// Single-process registry guarded by one lock.
#[derive(Default)]
pub struct LocalPresence {
    peers: RwLock<HashMap<String, ConnectionId>>,
}

impl LocalPresence {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PresenceRegistry for LocalPresence {
    async fn register(&self, user_id: &str, connection: ConnectionId) -> Option<ConnectionId> {
        self.peers
            .write()
            .await
            .insert(user_id.to_string(), connection)
    }

    async fn lookup(&self, user_id: &str) -> Option<ConnectionId> {
        self.peers.read().await.get(user_id).copied()
    }

    async fn unregister(&self, user_id: &str, connection: ConnectionId) -> bool {
        let mut peers = self.peers.write().await;
        if peers.get(user_id) == Some(&connection) {
            peers.remove(user_id);
            true
        } else {
            false
        }
    }

    async fn snapshot_online(&self) -> HashSet<String> {
        self.peers.read().await.keys().cloned().collect()
    }
}

//! Test doubles and helpers shared by the unit tests.

use async_trait::async_trait;
use duet_core::message::{Message, MessageStatus, NewMessage};
use duet_core::room::RoomId;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

use crate::config::RelayConfig;
use crate::gateway::{ConversationSummary, MessageFilter, MessageStore, StatusUpdate, StoreError};
use crate::relay::{Outbound, RelayState};
use crate::storage::Storage;

fn injected(op: &str) -> StoreError {
    StoreError::Backend(format!("injected {op} failure"))
}

/// In-memory SQLite store that fails chosen operations on demand.
pub struct FlakyStore {
    inner: Storage,
    persist_fails: AtomicBool,
    queries_fail: AtomicBool,
    last_seen_fails: AtomicBool,
    update_fails_for: Mutex<HashSet<String>>,
    last_seen_writes: AtomicUsize,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self {
            inner: Storage::open_in_memory().unwrap(),
            persist_fails: AtomicBool::new(false),
            queries_fail: AtomicBool::new(false),
            last_seen_fails: AtomicBool::new(false),
            update_fails_for: Mutex::new(HashSet::new()),
            last_seen_writes: AtomicUsize::new(0),
        }
    }

    pub fn fail_persist(&self, on: bool) {
        self.persist_fails.store(on, Ordering::SeqCst);
    }

    pub fn fail_queries(&self, on: bool) {
        self.queries_fail.store(on, Ordering::SeqCst);
    }

    pub fn fail_last_seen(&self, on: bool) {
        self.last_seen_fails.store(on, Ordering::SeqCst);
    }

    pub fn fail_update_for(&self, message_id: &str) {
        self.update_fails_for.lock().unwrap().insert(message_id.to_string());
    }

    /// Attempted last-seen writes, failed ones included.
    pub fn last_seen_writes(&self) -> usize {
        self.last_seen_writes.load(Ordering::SeqCst)
    }

    fn update_fails(&self, message_id: &str) -> bool {
        self.update_fails_for.lock().unwrap().contains(message_id)
    }
}

#[async_trait]
impl MessageStore for FlakyStore {
    async fn persist_message(&self, message: &Message) -> Result<Message, StoreError> {
        if self.persist_fails.load(Ordering::SeqCst) {
            return Err(injected("persist"));
        }
        self.inner.persist_message(message).await
    }

    async fn get_message(&self, message_id: &str) -> Result<Option<Message>, StoreError> {
        self.inner.get_message(message_id).await
    }

    async fn update_message_status(
        &self,
        message_id: &str,
        status: MessageStatus,
    ) -> Result<StatusUpdate, StoreError> {
        if self.update_fails(message_id) {
            return Err(injected("update"));
        }
        self.inner.update_message_status(message_id, status).await
    }

    async fn query_messages(&self, filter: &MessageFilter) -> Result<Vec<Message>, StoreError> {
        if self.queries_fail.load(Ordering::SeqCst) {
            return Err(injected("query"));
        }
        self.inner.query_messages(filter).await
    }

    async fn bulk_update_status(
        &self,
        filter: &MessageFilter,
        status: MessageStatus,
    ) -> Result<Vec<Message>, StoreError> {
        if self.queries_fail.load(Ordering::SeqCst) {
            return Err(injected("bulk update"));
        }
        self.inner.bulk_update_status(filter, status).await
    }

    async fn load_conversation(
        &self,
        channel: &RoomId,
        page: usize,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        self.inner.load_conversation(channel, page, limit).await
    }

    async fn conversation_summaries(
        &self,
        user_id: &str,
    ) -> Result<Vec<ConversationSummary>, StoreError> {
        self.inner.conversation_summaries(user_id).await
    }

    async fn get_last_seen(&self, user_id: &str) -> Result<Option<u64>, StoreError> {
        self.inner.get_last_seen(user_id).await
    }

    async fn set_last_seen(&self, user_id: &str, at_ms: u64) -> Result<(), StoreError> {
        self.last_seen_writes.fetch_add(1, Ordering::SeqCst);
        if self.last_seen_fails.load(Ordering::SeqCst) {
            return Err(injected("last-seen"));
        }
        self.inner.set_last_seen(user_id, at_ms).await
    }
}

pub fn draft(message_id: &str, sender: &str, receiver: &str, body: &str) -> NewMessage {
    NewMessage {
        message_id: message_id.into(),
        sender: sender.into(),
        receiver: receiver.into(),
        body: body.into(),
    }
}

/// Everything currently buffered on a hub subscription.
pub fn drain(rx: &mut broadcast::Receiver<Outbound>) -> Vec<Outbound> {
    let mut out = Vec::new();
    while let Ok(o) = rx.try_recv() {
        out.push(o);
    }
    out
}

pub fn test_config() -> RelayConfig {
    RelayConfig {
        addr: "127.0.0.1:0".into(),
        db_path: ":memory:".into(),
        token_secret: b"test-secret".to_vec(),
        typing_timeout: Duration::from_secs(5),
        broadcast_capacity: 256,
    }
}

pub fn test_state() -> (Arc<RelayState>, Arc<FlakyStore>) {
    let store = Arc::new(FlakyStore::new());
    let state = Arc::new(RelayState::new(&test_config(), store.clone()));
    (state, store)
}

//! SQLite persistence for direct messages and last-seen timestamps.
//!
//! Status is stored as its numeric rank so that "only move forward" is a
//! plain `status < ?` guard in SQL rather than a read-modify-write.

use async_trait::async_trait;
use duet_core::message::{Message, MessageStatus};
use duet_core::room::RoomId;
use rusqlite::types::{Type, Value};
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::info;

use crate::gateway::{ConversationSummary, MessageFilter, MessageStore, StatusUpdate, StoreError};

const MESSAGE_COLUMNS: &str =
    "message_id, channel_id, sender, receiver, body, status, created_at";

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS messages (
        message_id  TEXT PRIMARY KEY,
        channel_id  TEXT NOT NULL,
        sender      TEXT NOT NULL,
        receiver    TEXT NOT NULL,
        body        TEXT NOT NULL,
        status      INTEGER NOT NULL DEFAULT 0,
        created_at  INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_messages_channel
        ON messages(channel_id, created_at);

    CREATE INDEX IF NOT EXISTS idx_messages_receiver_status
        ON messages(receiver, status);

    CREATE TABLE IF NOT EXISTS peers (
        user_id     TEXT PRIMARY KEY,
        last_seen   INTEGER NOT NULL
    );";

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

/// Persistent storage backed by SQLite.
pub struct Storage {
    conn: Mutex<Connection>,
}

impl Storage {
    /// Open or create the database at the given path.
    pub fn open(path: &Path) -> Result<Self, rusqlite::Error> {
        let conn = Connection::open(path)?;

        // WAL keeps readers from blocking the writer.
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(SCHEMA)?;

        info!("Database opened: {}", path.display());
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Fresh private in-memory database.
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, rusqlite::Error> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Backend("connection mutex poisoned".to_string()))
    }
}

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<Message> {
    let rank: i64 = row.get(5)?;
    let status = MessageStatus::from_rank(rank).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            5,
            Type::Integer,
            format!("unknown status rank {rank}").into(),
        )
    })?;
    Ok(Message {
        message_id: row.get(0)?,
        channel_id: RoomId::from_raw(row.get::<_, String>(1)?),
        sender: row.get(2)?,
        receiver: row.get(3)?,
        body: row.get(4)?,
        status,
        created_at: row.get::<_, i64>(6)? as u64,
    })
}

/// Build a `WHERE` clause and its bound values for a filter.
fn where_clause(filter: &MessageFilter) -> (String, Vec<Value>) {
    let mut clauses = Vec::new();
    let mut values = Vec::new();

    if let Some(ref channel) = filter.channel {
        values.push(Value::Text(channel.as_str().to_string()));
        clauses.push(format!("channel_id = ?{}", values.len()));
    }
    if let Some(ref sender) = filter.sender {
        values.push(Value::Text(sender.clone()));
        clauses.push(format!("sender = ?{}", values.len()));
    }
    if let Some(ref receiver) = filter.receiver {
        values.push(Value::Text(receiver.clone()));
        clauses.push(format!("receiver = ?{}", values.len()));
    }
    if !filter.statuses.is_empty() {
        let placeholders: Vec<String> = filter
            .statuses
            .iter()
            .map(|s| {
                values.push(Value::Integer(s.rank()));
                format!("?{}", values.len())
            })
            .collect();
        clauses.push(format!("status IN ({})", placeholders.join(",")));
    }

    if clauses.is_empty() {
        ("1 = 1".to_string(), values)
    } else {
        (clauses.join(" AND "), values)
    }
}

fn select_messages(
    conn: &Connection,
    filter: &MessageFilter,
) -> Result<Vec<Message>, StoreError> {
    let (clause, values) = where_clause(filter);
    let sql = format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages WHERE {clause} ORDER BY created_at ASC, rowid ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let messages = stmt
        .query_map(params_from_iter(values.iter()), row_to_message)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(messages)
}

fn select_one(conn: &Connection, message_id: &str) -> Result<Option<Message>, StoreError> {
    let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE message_id = ?1");
    Ok(conn
        .query_row(&sql, params![message_id], row_to_message)
        .optional()?)
}

#[async_trait]
impl MessageStore for Storage {
    async fn persist_message(&self, message: &Message) -> Result<Message, StoreError> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT INTO messages (message_id, channel_id, sender, receiver, body, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(message_id) DO NOTHING",
            params![
                message.message_id,
                message.channel_id.as_str(),
                message.sender,
                message.receiver,
                message.body,
                message.status.rank(),
                message.created_at as i64,
            ],
        )?;
        if inserted == 0 {
            return Err(StoreError::Duplicate(message.message_id.clone()));
        }
        Ok(message.clone())
    }

    async fn get_message(&self, message_id: &str) -> Result<Option<Message>, StoreError> {
        let conn = self.conn()?;
        select_one(&conn, message_id)
    }

    async fn update_message_status(
        &self,
        message_id: &str,
        status: MessageStatus,
    ) -> Result<StatusUpdate, StoreError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE messages SET status = ?2 WHERE message_id = ?1 AND status < ?2",
            params![message_id, status.rank()],
        )? > 0;
        let message = select_one(&conn, message_id)?
            .ok_or_else(|| StoreError::NotFound(message_id.to_string()))?;
        Ok(StatusUpdate { message, changed })
    }

    async fn query_messages(&self, filter: &MessageFilter) -> Result<Vec<Message>, StoreError> {
        let conn = self.conn()?;
        select_messages(&conn, filter)
    }

    async fn bulk_update_status(
        &self,
        filter: &MessageFilter,
        status: MessageStatus,
    ) -> Result<Vec<Message>, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let mut changed = select_messages(&tx, filter)?;
        changed.retain(|m| m.status.advances_to(status));
        {
            let mut stmt =
                tx.prepare("UPDATE messages SET status = ?2 WHERE message_id = ?1 AND status < ?2")?;
            for msg in &mut changed {
                stmt.execute(params![msg.message_id, status.rank()])?;
                msg.status = status;
            }
        }
        tx.commit()?;
        Ok(changed)
    }

    async fn load_conversation(
        &self,
        channel: &RoomId,
        page: usize,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        // A page past what SQLite can address is past the end of the conversation.
        let Some(offset) = page
            .saturating_sub(1)
            .checked_mul(limit)
            .and_then(|o| i64::try_from(o).ok())
        else {
            return Ok(Vec::new());
        };
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE channel_id = ?1
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?2 OFFSET ?3"
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut messages = stmt
            .query_map(
                params![channel.as_str(), limit, offset],
                row_to_message,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        messages.reverse();
        Ok(messages)
    }

    async fn conversation_summaries(
        &self,
        user_id: &str,
    ) -> Result<Vec<ConversationSummary>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "WITH convo AS (
                SELECT message_id, channel_id, sender, receiver, body, status, created_at,
                       CASE WHEN sender = ?1 THEN receiver ELSE sender END AS partner,
                       ROW_NUMBER() OVER (
                           PARTITION BY channel_id ORDER BY created_at DESC, rowid DESC
                       ) AS rn
                FROM messages
                WHERE sender = ?1 OR receiver = ?1
            )
            SELECT c.message_id, c.channel_id, c.sender, c.receiver, c.body, c.status, c.created_at,
                   c.partner,
                   (SELECT COUNT(*) FROM messages u
                     WHERE u.channel_id = c.channel_id
                       AND u.sender = c.partner
                       AND u.receiver = ?1
                       AND u.status < ?2) AS unread
            FROM convo c
            WHERE c.rn = 1
            ORDER BY c.created_at DESC",
        )?;
        let rows = stmt
            .query_map(params![user_id, MessageStatus::Read.rank()], |row| {
                let last_message = row_to_message(row)?;
                Ok(ConversationSummary {
                    partner_id: row.get(7)?,
                    channel_id: last_message.channel_id.clone(),
                    unread_count: row.get::<_, i64>(8)? as u64,
                    last_message,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    async fn get_last_seen(&self, user_id: &str) -> Result<Option<u64>, StoreError> {
        let conn = self.conn()?;
        let last_seen: Option<i64> = conn
            .query_row(
                "SELECT last_seen FROM peers WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(last_seen.map(|ts| ts as u64))
    }

    async fn set_last_seen(&self, user_id: &str, at_ms: u64) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO peers (user_id, last_seen) VALUES (?1, ?2)
             ON CONFLICT(user_id) DO UPDATE SET last_seen = ?2",
            params![user_id, at_ms as i64],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duet_core::message::NewMessage;

    fn message(id: &str, sender: &str, receiver: &str, at: u64) -> Message {
        NewMessage {
            message_id: id.into(),
            sender: sender.into(),
            receiver: receiver.into(),
            body: format!("body of {id}"),
        }
        .into_message(at)
        .unwrap()
    }

    async fn seeded() -> Storage {
        let db = Storage::open_in_memory().unwrap();
        db.persist_message(&message("m1", "A", "B", 10)).await.unwrap();
        db.persist_message(&message("m2", "A", "B", 20)).await.unwrap();
        db.persist_message(&message("m3", "B", "A", 30)).await.unwrap();
        db.persist_message(&message("m4", "C", "B", 40)).await.unwrap();
        db
    }

    #[tokio::test]
    async fn persist_and_get() {
        let db = seeded().await;
        let m = db.get_message("m1").await.unwrap().unwrap();
        assert_eq!(m.status, MessageStatus::Sent);
        assert_eq!(m.channel_id, RoomId::resolve("A", "B"));
        assert!(db.get_message("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_id_rejected() {
        let db = seeded().await;
        let err = db.persist_message(&message("m1", "A", "B", 99)).await.unwrap_err();
        assert_eq!(err, StoreError::Duplicate("m1".into()));
    }

    #[tokio::test]
    async fn status_update_is_monotonic() {
        let db = seeded().await;

        let up = db.update_message_status("m1", MessageStatus::Read).await.unwrap();
        assert!(up.changed);
        assert_eq!(up.message.status, MessageStatus::Read);

        let down = db.update_message_status("m1", MessageStatus::Delivered).await.unwrap();
        assert!(!down.changed);
        assert_eq!(down.message.status, MessageStatus::Read);

        let again = db.update_message_status("m1", MessageStatus::Read).await.unwrap();
        assert!(!again.changed);
    }

    #[tokio::test]
    async fn update_unknown_message_is_not_found() {
        let db = seeded().await;
        let err = db.update_message_status("ghost", MessageStatus::Delivered).await.unwrap_err();
        assert_eq!(err, StoreError::NotFound("ghost".into()));
    }

    #[tokio::test]
    async fn query_by_direction_and_status() {
        let db = seeded().await;
        let filter = MessageFilter::from_to("A", "B").with_statuses(&[MessageStatus::Sent]);
        let ids: Vec<String> = db
            .query_messages(&filter)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.message_id)
            .collect();
        assert_eq!(ids, vec!["m1", "m2"]);

        let to_b = db.query_messages(&MessageFilter::to("B")).await.unwrap();
        assert_eq!(to_b.len(), 3);
    }

    #[tokio::test]
    async fn bulk_update_reports_only_changed_rows() {
        let db = seeded().await;
        db.update_message_status("m2", MessageStatus::Read).await.unwrap();

        let filter = MessageFilter::from_to("A", "B");
        let changed = db.bulk_update_status(&filter, MessageStatus::Delivered).await.unwrap();
        let ids: Vec<&str> = changed.iter().map(|m| m.message_id.as_str()).collect();
        assert_eq!(ids, vec!["m1"]);
        assert!(changed.iter().all(|m| m.status == MessageStatus::Delivered));

        // m2 stayed Read.
        let m2 = db.get_message("m2").await.unwrap().unwrap();
        assert_eq!(m2.status, MessageStatus::Read);

        let second = db.bulk_update_status(&filter, MessageStatus::Delivered).await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn conversation_pages_newest_first_each_ascending() {
        let db = Storage::open_in_memory().unwrap();
        for i in 0..5u64 {
            db.persist_message(&message(&format!("m{i}"), "A", "B", i * 10))
                .await
                .unwrap();
        }
        let room = RoomId::resolve("A", "B");

        let page1 = db.load_conversation(&room, 1, 2).await.unwrap();
        let ids: Vec<&str> = page1.iter().map(|m| m.message_id.as_str()).collect();
        assert_eq!(ids, vec!["m3", "m4"]);

        let page3 = db.load_conversation(&room, 3, 2).await.unwrap();
        let ids: Vec<&str> = page3.iter().map(|m| m.message_id.as_str()).collect();
        assert_eq!(ids, vec!["m0"]);

        assert!(db.load_conversation(&room, 4, 2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn oversized_page_is_empty() {
        let db = seeded().await;
        let room = RoomId::resolve("A", "B");
        assert!(db.load_conversation(&room, usize::MAX, 20).await.unwrap().is_empty());
        let huge = usize::try_from(i64::MAX).unwrap() / 20 + 2;
        assert!(db.load_conversation(&room, huge, 20).await.unwrap().is_empty());
        assert_eq!(db.load_conversation(&room, 1, usize::MAX).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn conversation_summaries_group_by_partner() {
        let db = seeded().await;
        db.update_message_status("m1", MessageStatus::Read).await.unwrap();

        let rows = db.conversation_summaries("B").await.unwrap();
        assert_eq!(rows.len(), 2);

        // C wrote most recently.
        assert_eq!(rows[0].partner_id, "C");
        assert_eq!(rows[0].unread_count, 1);
        assert_eq!(rows[0].last_message.message_id, "m4");

        assert_eq!(rows[1].partner_id, "A");
        assert_eq!(rows[1].last_message.message_id, "m3");
        // m1 read, m2 still unread; m3 was written by B and never counts.
        assert_eq!(rows[1].unread_count, 1);
    }

    #[tokio::test]
    async fn last_seen_roundtrip() {
        let db = Storage::open_in_memory().unwrap();
        assert_eq!(db.get_last_seen("A").await.unwrap(), None);
        db.set_last_seen("A", 100).await.unwrap();
        db.set_last_seen("A", 200).await.unwrap();
        assert_eq!(db.get_last_seen("A").await.unwrap(), Some(200));
    }
}

//! SQLite-backed message store.

use async_trait::async_trait;
use chrono::DateTime;
use log::{debug, info};
use parking_lot::Mutex;
use rusqlite::{params, Connection, Row};
use std::path::Path;
use tokio::sync::watch;
use uuid::Uuid;

use super::message_types::{ChannelId, ChannelProfile, Message, SELF_SENDER};
use super::storage::MessageStore;
use crate::error::StoreError;

/// Durable store; the live views are refreshed from the database after
/// every successful insert.
pub struct SqliteMessageStore {
    conn: Mutex<Connection>,
    messages: watch::Sender<Vec<Message>>,
    profiles: watch::Sender<Vec<ChannelProfile>>,
}

impl SqliteMessageStore {
    /// Open (or create) the database at `path`.
    pub fn with_path<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref())?;
        info!("Opened message database at {}", path.as_ref().display());
        Self::from_connection(conn)
    }

    /// Private database that lives as long as the store.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        init_schema(&conn)?;
        let messages = query_messages(&conn)?;
        let profiles = query_channel_profiles(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            messages: watch::channel(messages).0,
            profiles: watch::channel(profiles).0,
        })
    }
}

fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            sender_id TEXT NOT NULL,
            sender_name TEXT NOT NULL,
            content TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            is_sent INTEGER NOT NULL DEFAULT 0,
            is_broadcast INTEGER NOT NULL DEFAULT 1,
            channel_id TEXT NOT NULL,
            latency_ms INTEGER
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_messages_timestamp ON messages(timestamp)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_messages_channel ON messages(channel_id)",
        [],
    )?;

    Ok(())
}

fn query_messages(conn: &Connection) -> Result<Vec<Message>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, sender_id, sender_name, content, timestamp, is_sent, is_broadcast, channel_id, latency_ms
         FROM messages
         ORDER BY timestamp ASC, rowid ASC",
    )?;

    let rows = stmt.query_map([], raw_row)?;
    let mut messages = Vec::new();
    for row in rows {
        messages.push(row?.into_message()?);
    }
    Ok(messages)
}

fn query_channel_profiles(conn: &Connection) -> Result<Vec<ChannelProfile>, StoreError> {
    // Latest non-self private row per channel.
    let mut stmt = conn.prepare(
        "SELECT m.channel_id, m.sender_name, m.sender_id
         FROM messages m
         WHERE m.is_broadcast = 0 AND m.sender_id != ?1
           AND m.rowid = (
               SELECT l.rowid FROM messages l
               WHERE l.channel_id = m.channel_id AND l.is_broadcast = 0 AND l.sender_id != ?1
               ORDER BY l.timestamp DESC, l.rowid DESC
               LIMIT 1
           )
         ORDER BY m.channel_id ASC",
    )?;

    let profiles = stmt
        .query_map(params![SELF_SENDER], |row| {
            Ok(ChannelProfile {
                channel_id: row.get(0)?,
                display_name: row.get(1)?,
                last_address: Some(row.get(2)?),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(profiles)
}

struct RawRow {
    id: String,
    sender_id: String,
    sender_name: String,
    content: String,
    timestamp: i64,
    is_sent: bool,
    is_broadcast: bool,
    channel_id: String,
    latency_ms: Option<i64>,
}

fn raw_row(row: &Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        id: row.get(0)?,
        sender_id: row.get(1)?,
        sender_name: row.get(2)?,
        content: row.get(3)?,
        timestamp: row.get(4)?,
        is_sent: row.get(5)?,
        is_broadcast: row.get(6)?,
        channel_id: row.get(7)?,
        latency_ms: row.get(8)?,
    })
}

impl RawRow {
    fn into_message(self) -> Result<Message, StoreError> {
        let id = Uuid::parse_str(&self.id)
            .map_err(|e| StoreError::CorruptRow(format!("id {}: {e}", self.id)))?;
        let timestamp = DateTime::from_timestamp_millis(self.timestamp)
            .ok_or_else(|| StoreError::CorruptRow(format!("timestamp {}", self.timestamp)))?;
        let channel = if self.is_broadcast {
            ChannelId::Broadcast
        } else {
            ChannelId::Private(self.channel_id)
        };

        Ok(Message {
            id,
            sender_id: self.sender_id,
            sender_name: self.sender_name,
            content: self.content,
            timestamp,
            sent: self.is_sent,
            channel,
            latency_ms: self.latency_ms.map(|ms| ms.max(0) as u64),
        })
    }
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn insert(&self, message: &Message) -> Result<bool, StoreError> {
        let conn = self.conn.lock();

        let changed = conn.execute(
            "INSERT OR IGNORE INTO messages
                (id, sender_id, sender_name, content, timestamp, is_sent, is_broadcast, channel_id, latency_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                message.id.to_string(),
                message.sender_id,
                message.sender_name,
                message.content,
                message.timestamp.timestamp_millis(),
                message.sent,
                message.is_broadcast(),
                message.channel_id(),
                message.latency_ms.map(|ms| ms as i64),
            ],
        )?;

        if changed == 0 {
            debug!("Message already stored: {}", message.id);
            return Ok(false);
        }

        self.messages.send_replace(query_messages(&conn)?);
        self.profiles.send_replace(query_channel_profiles(&conn)?);

        debug!("Stored message: {} in channel {}", message.id, message.channel_id());
        Ok(true)
    }

    fn messages(&self) -> watch::Receiver<Vec<Message>> {
        self.messages.subscribe()
    }

    fn channel_profiles(&self) -> watch::Receiver<Vec<ChannelProfile>> {
        self.profiles.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::protocol::DecodedFrame;

    fn inbound(address: &str, sender: &str, content: &str) -> Message {
        Message::incoming(
            address,
            &DecodedFrame {
                channel_id: sender.to_string(),
                sender_name: sender.to_string(),
                content: content.to_string(),
                is_broadcast: false,
            },
        )
    }

    #[tokio::test]
    async fn insert_is_idempotent() {
        let store = SqliteMessageStore::open_in_memory().unwrap();
        let message = inbound("AA", "Alice", "hello");

        assert!(store.insert(&message).await.unwrap());
        assert!(!store.insert(&message).await.unwrap());
        assert_eq!(store.messages().borrow().len(), 1);
    }

    #[tokio::test]
    async fn rows_round_trip_through_the_database() {
        let store = SqliteMessageStore::open_in_memory().unwrap();
        let sent = Message::delivered_private("Alice", "on my way", 87);
        let broadcast = Message::outgoing_broadcast("anyone there?", false);

        store.insert(&sent).await.unwrap();
        store.insert(&broadcast).await.unwrap();

        let messages = store.messages().borrow().clone();
        assert!(messages.contains(&sent));
        assert!(messages.contains(&broadcast));
    }

    #[tokio::test]
    async fn profiles_use_latest_inbound_row() {
        let store = SqliteMessageStore::open_in_memory().unwrap();
        let mut first = inbound("OLD:ADDR", "Carol", "one");
        let second = inbound("NEW:ADDR", "Carol", "two");
        first.timestamp = second.timestamp - chrono::Duration::seconds(1);

        store.insert(&first).await.unwrap();
        store.insert(&second).await.unwrap();
        store.insert(&Message::delivered_private("Carol", "hi", 3)).await.unwrap();
        store.insert(&Message::outgoing_broadcast("all", true)).await.unwrap();

        let profiles = store.channel_profiles().borrow().clone();
        assert_eq!(profiles.len(), 1);
        assert_eq!(profiles[0].channel_id, "Carol");
        assert_eq!(profiles[0].last_address.as_deref(), Some("NEW:ADDR"));
    }

    #[tokio::test]
    async fn reopening_restores_history() {
        let dir = std::env::temp_dir().join(format!("blechat-{}.db", Uuid::new_v4()));
        let message = inbound("AA", "Dana", "persisted");

        {
            let store = SqliteMessageStore::with_path(&dir).unwrap();
            store.insert(&message).await.unwrap();
        }

        let reopened = SqliteMessageStore::with_path(&dir).unwrap();
        assert_eq!(reopened.messages().borrow().clone(), vec![message]);
        let _ = std::fs::remove_file(&dir);
    }
}

//! Message Storage Module
//!
//! The persistence collaborator: an idempotent, append-only message store
//! exposing live, timestamp-ordered views.

use async_trait::async_trait;
use log::debug;
use std::collections::HashSet;
use tokio::sync::{watch, Mutex};
use uuid::Uuid;

use super::message_types::{ChannelProfile, Message};
use crate::error::StoreError;

/// Row store the engine persists conversations into.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Insert a message keyed by id. Returns `false` when a message with the
    /// same id already exists, in which case nothing changes.
    async fn insert(&self, message: &Message) -> Result<bool, StoreError>;

    /// All messages, ascending by timestamp.
    fn messages(&self) -> watch::Receiver<Vec<Message>>;

    /// One profile per private channel, excluding self-authored rows.
    fn channel_profiles(&self) -> watch::Receiver<Vec<ChannelProfile>>;
}

/// In-memory message storage. Contents are lost when the process exits.
pub struct MemoryMessageStore {
    ids: Mutex<HashSet<Uuid>>,
    messages: watch::Sender<Vec<Message>>,
    profiles: watch::Sender<Vec<ChannelProfile>>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self {
            ids: Mutex::new(HashSet::new()),
            messages: watch::channel(Vec::new()).0,
            profiles: watch::channel(Vec::new()).0,
        }
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn insert(&self, message: &Message) -> Result<bool, StoreError> {
        // Held across check and publish so concurrent inserts stay idempotent.
        let mut ids = self.ids.lock().await;

        if !ids.insert(message.id) {
            debug!("Message already stored: {}", message.id);
            return Ok(false);
        }

        let mut snapshot = None;
        self.messages.send_modify(|messages| {
            // Equal timestamps keep arrival order.
            let pos = messages.partition_point(|m| m.timestamp <= message.timestamp);
            messages.insert(pos, message.clone());
            snapshot = Some(ChannelProfile::project(messages));
        });

        if let Some(profiles) = snapshot {
            self.profiles.send_replace(profiles);
        }

        debug!("Stored message: {} ({} chars)", message.id, message.content.len());
        Ok(true)
    }

    fn messages(&self) -> watch::Receiver<Vec<Message>> {
        self.messages.subscribe()
    }

    fn channel_profiles(&self) -> watch::Receiver<Vec<ChannelProfile>> {
        self.profiles.subscribe()
    }
}

impl Default for MemoryMessageStore {
    fn default() -> Self {
        Self::new()
    }
}

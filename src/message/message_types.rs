//! Message Type Definitions
//!
//! Defines the conversation records persisted by the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::bluetooth::protocol::{DecodedFrame, BROADCAST_CHANNEL};

/// Sender id and name recorded on messages this device authored.
pub const SELF_SENDER: &str = "Me";

/// Marker prepended to the content of a private send that did not go through.
pub const FAILED_CONTENT_PREFIX: &str = "⚠️ Failed: ";

/// Logical conversation a message belongs to.
///
/// Private channels are keyed by the peer's display name, never its radio
/// address, so address rotation does not fragment a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ChannelId {
    Broadcast,
    Private(String),
}

impl ChannelId {
    /// Parse a raw channel identifier; the reserved broadcast id maps to
    /// [`ChannelId::Broadcast`], anything else names a private channel.
    pub fn parse(raw: &str) -> Self {
        if raw == BROADCAST_CHANNEL {
            ChannelId::Broadcast
        } else {
            ChannelId::Private(raw.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ChannelId::Broadcast => BROADCAST_CHANNEL,
            ChannelId::Private(name) => name,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        matches!(self, ChannelId::Broadcast)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted conversation entry. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub sender_id: String,
    pub sender_name: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// True only for messages this device authored whose write succeeded.
    pub sent: bool,
    pub channel: ChannelId,
    /// Present only on confirmed private sends.
    pub latency_ms: Option<u64>,
}

impl Message {
    /// Message decoded from a write received from `sender_address`.
    pub fn incoming(sender_address: &str, frame: &DecodedFrame) -> Self {
        let channel = if frame.is_broadcast {
            ChannelId::Broadcast
        } else {
            ChannelId::Private(frame.channel_id.clone())
        };

        Self {
            id: Uuid::new_v4(),
            sender_id: sender_address.to_string(),
            sender_name: frame.sender_name.clone(),
            content: frame.content.clone(),
            timestamp: now_millis(),
            sent: false,
            channel,
            latency_ms: None,
        }
    }

    /// Self-authored broadcast, recorded once per fan-out.
    pub fn outgoing_broadcast(content: &str, delivered: bool) -> Self {
        Self::from_self(ChannelId::Broadcast, content.to_string(), delivered, None)
    }

    /// Self-authored private message whose write was acknowledged.
    pub fn delivered_private(peer_name: &str, content: &str, latency_ms: u64) -> Self {
        Self::from_self(
            ChannelId::Private(peer_name.to_string()),
            content.to_string(),
            true,
            Some(latency_ms),
        )
    }

    /// Self-authored private message that could not be delivered. The content
    /// is visibly marked so the sender sees it did not go through.
    pub fn failed_private(peer_name: &str, content: &str) -> Self {
        Self::from_self(
            ChannelId::Private(peer_name.to_string()),
            format!("{FAILED_CONTENT_PREFIX}{content}"),
            false,
            None,
        )
    }

    fn from_self(channel: ChannelId, content: String, sent: bool, latency_ms: Option<u64>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender_id: SELF_SENDER.to_string(),
            sender_name: SELF_SENDER.to_string(),
            content,
            timestamp: now_millis(),
            sent,
            channel,
            latency_ms,
        }
    }

    pub fn channel_id(&self) -> &str {
        self.channel.as_str()
    }

    pub fn is_broadcast(&self) -> bool {
        self.channel.is_broadcast()
    }

    pub fn is_from_self(&self) -> bool {
        self.sender_id == SELF_SENDER
    }

    /// Get formatted timestamp
    pub fn formatted_timestamp(&self) -> String {
        self.timestamp.format("%H:%M:%S").to_string()
    }
}

/// A private conversation seen in history, projected from stored messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelProfile {
    pub channel_id: String,
    pub display_name: String,
    /// Radio address of the most recent inbound message on this channel.
    pub last_address: Option<String>,
}

impl ChannelProfile {
    /// One profile per distinct private channel, ignoring broadcast and
    /// self-authored rows. `messages` must be ascending by timestamp; the
    /// latest row of a channel provides its name and address.
    pub fn project(messages: &[Message]) -> Vec<ChannelProfile> {
        let mut profiles: BTreeMap<&str, ChannelProfile> = BTreeMap::new();

        for message in messages.iter().filter(|m| !m.is_broadcast() && !m.is_from_self()) {
            profiles.insert(
                message.channel_id(),
                ChannelProfile {
                    channel_id: message.channel_id().to_string(),
                    display_name: message.sender_name.clone(),
                    last_address: Some(message.sender_id.clone()),
                },
            );
        }

        profiles.into_values().collect()
    }
}

/// Current time truncated to the millisecond precision kept by storage.
pub fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

//! Channel/Message Model
//!
//! Turns decoded frames into persisted messages and exposes the live
//! conversation views.

use log::{debug, warn};
use std::sync::Arc;
use tokio::sync::watch;

use super::message_types::{ChannelProfile, Message};
use super::storage::MessageStore;
use crate::bluetooth::protocol::DecodedFrame;
use crate::error::StoreError;
use crate::notify::Notifier;

pub struct ChannelModel {
    store: Arc<dyn MessageStore>,
    notifier: Arc<dyn Notifier>,
}

impl ChannelModel {
    pub fn new(store: Arc<dyn MessageStore>, notifier: Arc<dyn Notifier>) -> Self {
        Self { store, notifier }
    }

    /// Append a message. Persisting an id twice is a no-op; returns whether
    /// the message was new.
    pub async fn persist(&self, message: &Message) -> Result<bool, StoreError> {
        self.store.insert(message).await
    }

    /// Persist a frame received from `sender_address` and notify once it is stored.
    pub async fn record_inbound(&self, sender_address: &str, frame: &DecodedFrame) -> Result<Message, StoreError> {
        let message = Message::incoming(sender_address, frame);

        if self.persist(&message).await? {
            self.notifier.notify(
                &format!("Message from {}", message.sender_name),
                &message.content,
                message.channel_id(),
            );
        } else {
            warn!("Inbound message {} was already stored", message.id);
        }

        debug!(
            "Recorded inbound message from {} in channel {}",
            sender_address,
            message.channel_id()
        );
        Ok(message)
    }

    /// Every message, ascending by timestamp.
    pub fn all_messages(&self) -> watch::Receiver<Vec<Message>> {
        self.store.messages()
    }

    /// Private channels seen in history.
    pub fn channels_seen(&self) -> watch::Receiver<Vec<ChannelProfile>> {
        self.store.channel_profiles()
    }
}

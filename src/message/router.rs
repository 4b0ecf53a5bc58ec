//! Delivery Coordinator
//!
//! Turns user commands into deliveries: broadcasts fan out to every radio in
//! range, private messages go to the address behind a channel's name. Every
//! outcome ends up as a persisted message.

use anyhow::{Context, Result};
use futures::future::join_all;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::channel_model::ChannelModel;
use super::message_types::{ChannelId, Message};
use crate::bluetooth::peer_manager::{merge_peers, resolve_address, PeerDescriptor, PeerManager};
use crate::bluetooth::protocol::FrameCodec;
use crate::bluetooth::transport::TransportSessionManager;
use crate::error::SendError;
use crate::long_range::LongRangeTransport;

/// Result of one `send`, available through its [`DeliveryHandle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub channel: ChannelId,
    /// Write attempts made, one per radio plus the long-range transport.
    pub attempts: usize,
    pub delivered: usize,
    /// Distinct display names targeted.
    pub recipients: Vec<String>,
    /// Private sends only.
    pub latency: Option<Duration>,
    /// Private sends only.
    pub error: Option<SendError>,
    /// The message persisted for this send.
    pub message: Message,
}

/// Dropping the handle detaches the delivery; it still runs to completion.
pub type DeliveryHandle = JoinHandle<DeliveryReport>;

pub struct DeliveryCoordinator {
    transport: Arc<TransportSessionManager>,
    registry: Arc<PeerManager>,
    model: Arc<ChannelModel>,
    long_range: Option<Arc<dyn LongRangeTransport>>,
    peers: Arc<watch::Sender<Vec<PeerDescriptor>>>,
    active_channel: Arc<watch::Sender<Option<ChannelId>>>,
    current_messages: Arc<watch::Sender<Vec<Message>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DeliveryCoordinator {
    pub fn new(
        transport: Arc<TransportSessionManager>,
        registry: Arc<PeerManager>,
        model: Arc<ChannelModel>,
    ) -> Self {
        Self {
            transport,
            registry,
            model,
            long_range: None,
            peers: Arc::new(watch::channel(Vec::new()).0),
            active_channel: Arc::new(watch::channel(None).0),
            current_messages: Arc::new(watch::channel(Vec::new()).0),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Also hand broadcasts to `transport` while it reports connected.
    pub fn with_long_range(mut self, transport: Arc<dyn LongRangeTransport>) -> Self {
        self.long_range = Some(transport);
        self
    }

    /// Start the radio and keep the peer and conversation views current.
    pub async fn start(&self) -> Result<()> {
        self.transport
            .start(self.model.clone())
            .await
            .context("Failed to start transport")?;

        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return Ok(());
        }

        let mut live = self.registry.subscribe();
        let mut history = self.model.channels_seen();
        let peers = self.peers.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                let merged = merge_peers(&live.borrow_and_update().clone(), &history.borrow_and_update().clone());
                peers.send_replace(merged);

                tokio::select! {
                    changed = live.changed() => if changed.is_err() { break },
                    changed = history.changed() => if changed.is_err() { break },
                }
            }
        }));

        let mut messages = self.model.all_messages();
        let mut active = self.active_channel.subscribe();
        let current = self.current_messages.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                let channel = active.borrow_and_update().clone();
                let filtered = filter_channel(&messages.borrow_and_update(), channel.as_ref());
                current.send_replace(filtered);

                tokio::select! {
                    changed = messages.changed() => if changed.is_err() { break },
                    changed = active.changed() => if changed.is_err() { break },
                }
            }
        }));

        info!("Delivery coordinator started");
        Ok(())
    }

    pub async fn stop(&self) {
        self.transport.stop().await;
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        info!("Delivery coordinator stopped");
    }

    pub fn open_channel(&self, channel_id: &str) {
        let channel = ChannelId::parse(channel_id);
        info!("Opened channel {}", channel);
        self.active_channel.send_replace(Some(channel));
        self.publish_current();
    }

    pub fn close_channel(&self) {
        if let Some(channel) = self.active_channel.send_replace(None) {
            info!("Closed channel {}", channel);
        }
        self.publish_current();
    }

    /// Deliver `text` to the active channel. Returns `None` when no channel
    /// is open or the text is blank.
    pub fn send(&self, text: &str) -> Option<DeliveryHandle> {
        if text.trim().is_empty() {
            return None;
        }
        let channel = self.active_channel.borrow().clone()?;

        let delivery = Delivery {
            transport: self.transport.clone(),
            registry: self.registry.clone(),
            model: self.model.clone(),
            long_range: self.long_range.clone(),
            content: text.to_string(),
        };

        Some(tokio::spawn(async move {
            match channel {
                ChannelId::Broadcast => delivery.broadcast().await,
                ChannelId::Private(name) => delivery.private(name).await,
            }
        }))
    }

    /// Forget the live scan and scan again. History peers stay listed.
    pub async fn refresh_peers(&self) -> Result<()> {
        self.transport.refresh().await
    }

    /// Live peers merged with peers remembered from history.
    pub fn peers(&self) -> watch::Receiver<Vec<PeerDescriptor>> {
        self.peers.subscribe()
    }

    pub fn messages(&self) -> watch::Receiver<Vec<Message>> {
        self.model.all_messages()
    }

    pub fn active_channel(&self) -> watch::Receiver<Option<ChannelId>> {
        self.active_channel.subscribe()
    }

    /// Messages of the active channel; empty while no channel is open.
    pub fn current_channel_messages(&self) -> watch::Receiver<Vec<Message>> {
        self.current_messages.subscribe()
    }

    fn publish_current(&self) {
        let channel = self.active_channel.borrow().clone();
        let filtered = filter_channel(&self.model.all_messages().borrow(), channel.as_ref());
        self.current_messages.send_replace(filtered);
    }

    pub fn status(&self) -> Value {
        let active = self.active_channel.borrow().as_ref().map(ChannelId::to_string);
        let long_range = self.long_range.as_ref().map(|lr| {
            serde_json::json!({
                "connected": *lr.is_connected().borrow(),
                "signal_quality": *lr.signal_quality().borrow(),
            })
        });

        serde_json::json!({
            "active_channel": active,
            "message_count": self.model.all_messages().borrow().len(),
            "peer_count": self.peers.borrow().len(),
            "transport": self.transport.get_status(),
            "long_range": long_range,
        })
    }
}

fn filter_channel(messages: &[Message], channel: Option<&ChannelId>) -> Vec<Message> {
    let Some(channel) = channel else {
        return Vec::new();
    };
    let mut filtered: Vec<Message> = messages.iter().filter(|m| &m.channel == channel).cloned().collect();
    filtered.sort_by_key(|m| m.timestamp);
    filtered
}

/// One send, detached from the coordinator so channel switches do not
/// cancel it.
struct Delivery {
    transport: Arc<TransportSessionManager>,
    registry: Arc<PeerManager>,
    model: Arc<ChannelModel>,
    long_range: Option<Arc<dyn LongRangeTransport>>,
    content: String,
}

impl Delivery {
    async fn broadcast(self) -> DeliveryReport {
        let targets: Vec<PeerDescriptor> = self
            .registry
            .live_peers()
            .into_iter()
            .filter(PeerDescriptor::is_active)
            .collect();
        let recipients: BTreeSet<String> = targets.iter().map(|p| p.display_name.clone()).collect();

        debug!(
            "Broadcasting to {} radios ({} names)",
            targets.len(),
            recipients.len()
        );

        let writes = targets.iter().map(|peer| {
            let transport = self.transport.clone();
            let address = peer.address.clone();
            let content = self.content.clone();
            tokio::spawn(async move { transport.send(&address, &content, true).await })
        });
        let results = join_all(writes).await;

        let mut attempts = targets.len();
        let mut delivered = 0;
        for (peer, result) in targets.iter().zip(results) {
            match result {
                Ok(Ok(_)) => delivered += 1,
                Ok(Err(e)) => debug!("Broadcast to {} ({}) failed: {}", peer.display_name, peer.address, e),
                Err(e) => error!("Broadcast task for {} failed: {}", peer.address, e),
            }
        }

        if let Some(long_range) = &self.long_range {
            let connected = *long_range.is_connected().borrow();
            if connected {
                attempts += 1;
                let frame = FrameCodec::encode(&self.content, true, self.transport.self_name());
                match long_range.send_broadcast(&frame).await {
                    Ok(()) => delivered += 1,
                    Err(e) => debug!("Long-range broadcast failed: {}", e),
                }
            }
        }

        let message = Message::outgoing_broadcast(&self.content, delivered > 0);
        self.persist(&message).await;

        info!("Broadcast delivered to {} of {} targets", delivered, attempts);
        DeliveryReport {
            channel: ChannelId::Broadcast,
            attempts,
            delivered,
            recipients: recipients.into_iter().collect(),
            latency: None,
            error: None,
            message,
        }
    }

    async fn private(self, name: String) -> DeliveryReport {
        let history = self.model.channels_seen().borrow().clone();
        let peers = merge_peers(&self.registry.live_peers(), &history);
        let address = resolve_address(&peers, &name).unwrap_or_else(|| name.clone());

        let result = self.transport.send(&address, &self.content, false).await;
        let message = match &result {
            Ok(latency) => {
                let latency_ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
                debug!("Delivered to {} ({}) in {} ms", name, address, latency_ms);
                Message::delivered_private(&name, &self.content, latency_ms)
            }
            Err(e) => {
                warn!("Failed to deliver to {} ({}): {}", name, address, e);
                Message::failed_private(&name, &self.content)
            }
        };
        self.persist(&message).await;

        DeliveryReport {
            channel: ChannelId::Private(name.clone()),
            attempts: 1,
            delivered: usize::from(result.is_ok()),
            recipients: vec![name],
            latency: result.as_ref().ok().copied(),
            error: result.err(),
            message,
        }
    }

    async fn persist(&self, message: &Message) {
        if let Err(e) = self.model.persist(message).await {
            error!("Failed to persist message {}: {}", message.id, e);
        }
    }
}

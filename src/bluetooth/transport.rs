//! Transport Session Manager
//!
//! Runs both Bluetooth roles: the responder worker that turns inbound writes
//! into persisted messages, and the initiator that opens one short-lived
//! session per outbound frame.

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::link::{BleLink, LinkEvent};
use super::peer_manager::{PeerDescriptor, PeerManager};
use super::protocol::{FrameCodec, MESSAGE_CHARACTERISTIC_UUID, SERVICE_UUID};
use super::session::{wait_for_shutdown, OutboundSession, SessionOutcome, SessionSettings};
use crate::error::SendError;
use crate::message::channel_model::ChannelModel;

pub struct TransportSessionManager {
    link: Arc<dyn BleLink>,
    registry: Arc<PeerManager>,
    self_name: String,
    settings: SessionSettings,
    shutdown: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    is_running: AtomicBool,
}

impl TransportSessionManager {
    pub fn new(
        link: Arc<dyn BleLink>,
        registry: Arc<PeerManager>,
        self_name: &str,
        settings: SessionSettings,
    ) -> Self {
        Self {
            link,
            registry,
            self_name: self_name.to_string(),
            settings,
            shutdown: watch::channel(false).0,
            worker: Mutex::new(None),
            is_running: AtomicBool::new(false),
        }
    }

    pub fn self_name(&self) -> &str {
        &self.self_name
    }

    /// Start the radio and the responder worker. Inbound frames are
    /// persisted through `model`.
    pub async fn start(&self, model: Arc<ChannelModel>) -> Result<()> {
        if self.is_running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        info!("Starting Bluetooth transport as '{}'", self.self_name);
        self.shutdown.send_replace(false);

        let events = match self.link.start(&self.self_name).await {
            Ok(events) => events,
            Err(e) => {
                self.is_running.store(false, Ordering::SeqCst);
                return Err(e).context("Failed to start Bluetooth link");
            }
        };

        let worker = ResponderWorker {
            link: self.link.clone(),
            registry: self.registry.clone(),
            model,
        };
        let shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(async move { worker.run(events, shutdown).await });
        *self.worker.lock() = Some(handle);

        info!("Bluetooth transport started");
        Ok(())
    }

    /// Stop the radio. Open sessions fail with [`SendError::Aborted`] and
    /// release their connections.
    pub async fn stop(&self) {
        if !self.is_running.swap(false, Ordering::SeqCst) {
            return;
        }

        info!("Stopping Bluetooth transport");
        self.shutdown.send_replace(true);

        if let Err(e) = self.link.stop().await {
            warn!("Failed to stop Bluetooth link cleanly: {}", e);
        }

        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                error!("Responder worker ended abnormally: {}", e);
            }
        }
        info!("Bluetooth transport stopped");
    }

    /// Discard the live scan and scan again.
    pub async fn refresh(&self) -> Result<()> {
        self.registry.clear();
        self.link
            .restart_scan()
            .await
            .context("Failed to restart BLE scan")?;
        info!("Refreshed peer list, restarted scan");
        Ok(())
    }

    /// Deliver `content` to the radio at `address` in a fresh session.
    /// Returns the write latency.
    pub async fn send(&self, address: &str, content: &str, is_broadcast: bool) -> Result<Duration, SendError> {
        self.deliver(address, content, is_broadcast).await.result
    }

    /// Like [`send`](Self::send), also reporting the states the session went through.
    pub async fn deliver(&self, address: &str, content: &str, is_broadcast: bool) -> SessionOutcome {
        let payload = FrameCodec::encode(content, is_broadcast, &self.self_name);
        debug!("Opening session to {} for {} byte frame", address, payload.len());

        OutboundSession::new(
            self.link.as_ref(),
            address,
            payload,
            self.settings,
            self.shutdown.subscribe(),
        )
        .run()
        .await
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Get service status
    pub fn get_status(&self) -> Value {
        serde_json::json!({
            "is_running": self.is_running(),
            "display_name": self.self_name,
            "service_uuid": SERVICE_UUID.to_string(),
            "characteristic_uuid": MESSAGE_CHARACTERISTIC_UUID.to_string(),
            "requested_mtu": self.settings.requested_mtu,
            "peer_statistics": self.registry.get_statistics(),
        })
    }
}

/// Single consumer of the link event queue.
struct ResponderWorker {
    link: Arc<dyn BleLink>,
    registry: Arc<PeerManager>,
    model: Arc<ChannelModel>,
}

impl ResponderWorker {
    async fn run(self, mut events: mpsc::Receiver<LinkEvent>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => break,
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
            }
        }
        debug!("Responder worker exiting");
    }

    async fn handle_event(&self, event: LinkEvent) {
        match event {
            LinkEvent::Discovered { address, name, rssi } => {
                self.registry
                    .on_discovered(PeerDescriptor::discovered(&address, name.as_deref(), rssi));
            }
            LinkEvent::WriteReceived {
                address,
                device_name,
                characteristic,
                value,
                request_id,
                response_needed,
            } => {
                if characteristic != MESSAGE_CHARACTERISTIC_UUID {
                    debug!("Ignoring write to {} from {}", characteristic, address);
                    return;
                }

                let accepted = self.handle_write(&address, device_name.as_deref(), &value).await;

                if response_needed {
                    if let Err(e) = self.link.respond(&address, request_id, accepted).await {
                        warn!("Failed to acknowledge write from {}: {}", address, e);
                    }
                }
            }
            LinkEvent::ConnectionChanged { address, connected } => {
                debug!("GATT server connection from {}: connected={}", address, connected);
            }
        }
    }

    /// Display name for a writer whose frame carries none. Channels are keyed
    /// by name, so the address is never used on its own.
    fn sender_name(&self, address: &str, device_name: Option<&str>) -> String {
        match device_name {
            Some(name) if !name.trim().is_empty() => name.to_string(),
            _ => self
                .registry
                .get_peer(address)
                .map(|peer| peer.display_name)
                .unwrap_or_else(|| format!("Unknown ({address})")),
        }
    }

    async fn handle_write(&self, address: &str, device_name: Option<&str>, value: &[u8]) -> bool {
        let fallback_name = self.sender_name(address, device_name);

        let frame = match FrameCodec::decode_inbound(value, &fallback_name) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping {} from {}: {}", hex::encode(value), address, e);
                return false;
            }
        };

        debug!(
            "Received {} frame from {} ({} chars)",
            if frame.is_broadcast { "broadcast" } else { "private" },
            address,
            frame.content.len()
        );

        match self.model.record_inbound(address, &frame).await {
            Ok(_) => true,
            Err(e) => {
                error!("Failed to persist message from {}: {}", address, e);
                false
            }
        }
    }
}

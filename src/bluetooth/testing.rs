//! Scripted in-memory link used by the unit tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use uuid::Uuid;

use super::link::{BleLink, GattConnection, GattService, LinkEvent, LINK_EVENT_QUEUE_SIZE};
use super::protocol::{MESSAGE_CHARACTERISTIC_UUID, SERVICE_UUID};
use crate::error::LinkError;

/// How a scripted peer answers each step of a session.
#[derive(Debug, Clone)]
pub struct PeerBehavior {
    pub refuse_mtu: bool,
    pub has_service: bool,
    pub reject_write: bool,
    pub disconnect_on_discover: bool,
    pub disconnect_on_write: bool,
    pub write_delay: Option<Duration>,
}

impl Default for PeerBehavior {
    fn default() -> Self {
        Self {
            refuse_mtu: false,
            has_service: true,
            reject_write: false,
            disconnect_on_discover: false,
            disconnect_on_write: false,
            write_delay: None,
        }
    }
}

#[derive(Default)]
struct PeerRecord {
    behavior: PeerBehavior,
    writes: Vec<Vec<u8>>,
    connects: usize,
    closes: usize,
    write_started: Arc<Notify>,
}

type Peers = Arc<Mutex<HashMap<String, PeerRecord>>>;

pub struct FakeLink {
    peers: Peers,
    events: Mutex<Option<mpsc::Sender<LinkEvent>>>,
    responses: Mutex<Vec<(String, u32, bool)>>,
    scan_restarts: AtomicUsize,
}

impl FakeLink {
    pub fn new() -> Self {
        Self {
            peers: Arc::new(Mutex::new(HashMap::new())),
            events: Mutex::new(None),
            responses: Mutex::new(Vec::new()),
            scan_restarts: AtomicUsize::new(0),
        }
    }

    pub fn add_peer(&self, address: &str, behavior: PeerBehavior) {
        self.peers.lock().insert(
            address.to_string(),
            PeerRecord {
                behavior,
                ..PeerRecord::default()
            },
        );
    }

    pub fn writes_to(&self, address: &str) -> Vec<Vec<u8>> {
        self.peers
            .lock()
            .get(address)
            .map(|p| p.writes.clone())
            .unwrap_or_default()
    }

    pub fn total_writes(&self) -> usize {
        self.peers.lock().values().map(|p| p.writes.len()).sum()
    }

    pub fn connects(&self, address: &str) -> usize {
        self.peers.lock().get(address).map(|p| p.connects).unwrap_or(0)
    }

    pub fn closes(&self, address: &str) -> usize {
        self.peers.lock().get(address).map(|p| p.closes).unwrap_or(0)
    }

    pub fn responses(&self) -> Vec<(String, u32, bool)> {
        self.responses.lock().clone()
    }

    pub fn scan_restarts(&self) -> usize {
        self.scan_restarts.load(Ordering::SeqCst)
    }

    /// Push an event as if the radio raised it. Requires `start`.
    pub async fn emit(&self, event: LinkEvent) {
        let sender = self.events.lock().clone();
        if let Some(sender) = sender {
            sender.send(event).await.expect("event queue closed");
        }
    }

    pub async fn wait_for_write_started(&self, address: &str) {
        let notify = self
            .peers
            .lock()
            .get(address)
            .map(|p| p.write_started.clone())
            .expect("unknown peer");
        notify.notified().await;
    }
}

#[async_trait]
impl BleLink for FakeLink {
    async fn start(&self, _advertised_name: &str) -> Result<mpsc::Receiver<LinkEvent>, LinkError> {
        let (tx, rx) = mpsc::channel(LINK_EVENT_QUEUE_SIZE);
        *self.events.lock() = Some(tx);
        Ok(rx)
    }

    async fn restart_scan(&self) -> Result<(), LinkError> {
        self.scan_restarts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn connect(&self, address: &str) -> Result<Box<dyn GattConnection>, LinkError> {
        let mut peers = self.peers.lock();
        let record = peers
            .get_mut(address)
            .ok_or_else(|| LinkError::DeviceNotFound(address.to_string()))?;
        record.connects += 1;

        Ok(Box::new(FakeConnection {
            address: address.to_string(),
            behavior: record.behavior.clone(),
            peers: self.peers.clone(),
            lost: watch::channel(false).0,
            write_started: record.write_started.clone(),
        }))
    }

    async fn respond(&self, address: &str, request_id: u32, success: bool) -> Result<(), LinkError> {
        self.responses.lock().push((address.to_string(), request_id, success));
        Ok(())
    }

    async fn stop(&self) -> Result<(), LinkError> {
        self.events.lock().take();
        Ok(())
    }
}

struct FakeConnection {
    address: String,
    behavior: PeerBehavior,
    peers: Peers,
    lost: watch::Sender<bool>,
    write_started: Arc<Notify>,
}

#[async_trait]
impl GattConnection for FakeConnection {
    async fn request_mtu(&self, mtu: u16) -> Result<u16, LinkError> {
        if self.behavior.refuse_mtu {
            Err(LinkError::Unsupported)
        } else {
            Ok(mtu)
        }
    }

    async fn discover_services(&self) -> Result<Vec<GattService>, LinkError> {
        if self.behavior.disconnect_on_discover {
            self.lost.send_replace(true);
            std::future::pending::<()>().await;
        }
        if self.behavior.has_service {
            Ok(vec![GattService {
                uuid: SERVICE_UUID,
                characteristics: vec![MESSAGE_CHARACTERISTIC_UUID],
            }])
        } else {
            Ok(vec![GattService {
                uuid: Uuid::from_u128(0x1800),
                characteristics: vec![Uuid::from_u128(0x2a00)],
            }])
        }
    }

    async fn write(&self, _service: Uuid, _characteristic: Uuid, value: &[u8]) -> Result<(), LinkError> {
        if let Some(record) = self.peers.lock().get_mut(&self.address) {
            record.writes.push(value.to_vec());
        }
        self.write_started.notify_one();

        if self.behavior.disconnect_on_write {
            self.lost.send_replace(true);
            std::future::pending::<()>().await;
        }
        if let Some(delay) = self.behavior.write_delay {
            tokio::time::sleep(delay).await;
        }
        if self.behavior.reject_write {
            return Err(LinkError::Backend("write not permitted".to_string()));
        }
        Ok(())
    }

    async fn link_lost(&self) {
        let mut rx = self.lost.subscribe();
        let _ = rx.wait_for(|lost| *lost).await;
    }

    async fn close(self: Box<Self>) {
        if let Some(record) = self.peers.lock().get_mut(&self.address) {
            record.closes += 1;
        }
    }
}

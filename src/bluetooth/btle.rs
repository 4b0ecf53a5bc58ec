//! btleplug backend for the link layer.
//!
//! btleplug drives the central role only: it scans, connects and writes,
//! but cannot host a GATT server, so no `WriteReceived` events are raised
//! and `respond` is unsupported.

use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::stream::StreamExt;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time;
use uuid::Uuid;

use super::link::{BleLink, GattConnection, GattService, LinkEvent, LINK_EVENT_QUEUE_SIZE};
use super::protocol::SERVICE_UUID;
use crate::error::LinkError;

const SCAN_RESTART_PAUSE: Duration = Duration::from_millis(100);

pub struct BtleplugLink {
    adapter: Arc<Mutex<Option<Adapter>>>,
    peripherals: Arc<RwLock<HashMap<String, Peripheral>>>,
    disconnects: broadcast::Sender<String>,
    scan_restart_interval: Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BtleplugLink {
    pub fn new(scan_restart_interval: Duration) -> Self {
        Self {
            adapter: Arc::new(Mutex::new(None)),
            peripherals: Arc::new(RwLock::new(HashMap::new())),
            disconnects: broadcast::channel(64).0,
            scan_restart_interval,
            tasks: Mutex::new(Vec::new()),
        }
    }

    fn scan_filter() -> ScanFilter {
        ScanFilter {
            services: vec![SERVICE_UUID],
        }
    }

    async fn adapter(&self) -> Result<Adapter, LinkError> {
        self.adapter
            .lock()
            .await
            .clone()
            .ok_or_else(|| LinkError::Backend("Bluetooth adapter not initialized".to_string()))
    }
}

#[async_trait]
impl BleLink for BtleplugLink {
    async fn start(&self, advertised_name: &str) -> Result<mpsc::Receiver<LinkEvent>, LinkError> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| LinkError::Backend("No Bluetooth adapters found".to_string()))?;

        match adapter.adapter_info().await {
            Ok(info) => info!("Using Bluetooth adapter: {}", info),
            Err(e) => debug!("Adapter info unavailable: {}", e),
        }
        warn!(
            "This backend cannot host a GATT server; '{}' will not receive inbound writes",
            advertised_name
        );

        let central_events = adapter.events().await?;
        adapter.start_scan(Self::scan_filter()).await?;
        *self.adapter.lock().await = Some(adapter.clone());

        let (tx, rx) = mpsc::channel(LINK_EVENT_QUEUE_SIZE);

        let pump = EventPump {
            adapter: adapter.clone(),
            peripherals: self.peripherals.clone(),
            disconnects: self.disconnects.clone(),
            events: tx,
        };
        let pump_task = tokio::spawn(async move {
            let mut central_events = central_events;
            while let Some(event) = central_events.next().await {
                if !pump.handle(event).await {
                    break;
                }
            }
            debug!("Central event stream ended");
        });

        // Some platforms stop reporting after a while without a restart.
        let interval = self.scan_restart_interval;
        let restart_task = tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let _ = adapter.stop_scan().await;
                time::sleep(SCAN_RESTART_PAUSE).await;
                if let Err(e) = adapter.start_scan(Self::scan_filter()).await {
                    error!("Failed to restart scan: {}", e);
                }
            }
        });

        self.tasks.lock().await.extend([pump_task, restart_task]);
        info!("BLE scan started for service {}", SERVICE_UUID);
        Ok(rx)
    }

    async fn restart_scan(&self) -> Result<(), LinkError> {
        let adapter = self.adapter().await?;
        self.peripherals.write().await.clear();
        let _ = adapter.stop_scan().await;
        time::sleep(SCAN_RESTART_PAUSE).await;
        adapter.start_scan(Self::scan_filter()).await?;
        Ok(())
    }

    async fn connect(&self, address: &str) -> Result<Box<dyn GattConnection>, LinkError> {
        let peripheral = self
            .peripherals
            .read()
            .await
            .get(address)
            .cloned()
            .ok_or_else(|| LinkError::DeviceNotFound(address.to_string()))?;

        // Subscribe before connecting so an early drop is not missed.
        let disconnects = self.disconnects.subscribe();
        peripheral.connect().await?;
        debug!("Connected to {}", address);

        Ok(Box::new(BtleplugConnection {
            address: address.to_string(),
            peripheral,
            disconnects: Mutex::new(disconnects),
        }))
    }

    async fn respond(&self, _address: &str, _request_id: u32, _success: bool) -> Result<(), LinkError> {
        Err(LinkError::Unsupported)
    }

    async fn stop(&self) -> Result<(), LinkError> {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        if let Some(adapter) = self.adapter.lock().await.take() {
            adapter.stop_scan().await?;
        }
        self.peripherals.write().await.clear();
        Ok(())
    }
}

/// Address the engine uses for a peripheral. The platform id is unique per
/// radio; `BDAddr` is not, since CoreBluetooth reports all zeroes.
fn link_address(id: &PeripheralId) -> String {
    id.to_string()
}

/// Translates btleplug central events into link events.
struct EventPump {
    adapter: Adapter,
    peripherals: Arc<RwLock<HashMap<String, Peripheral>>>,
    disconnects: broadcast::Sender<String>,
    events: mpsc::Sender<LinkEvent>,
}

impl EventPump {
    /// Returns false once the consumer has gone away.
    async fn handle(&self, event: CentralEvent) -> bool {
        match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                match self.discovered(&id).await {
                    Ok(Some(event)) => return self.events.send(event).await.is_ok(),
                    Ok(None) => {}
                    Err(e) => debug!("Could not read properties of {:?}: {}", id, e),
                }
            }
            CentralEvent::DeviceDisconnected(id) => {
                let address = link_address(&id);
                debug!("Device disconnected: {}", address);
                let _ = self.disconnects.send(address);
            }
            _ => {}
        }
        true
    }

    async fn discovered(&self, id: &PeripheralId) -> Result<Option<LinkEvent>, LinkError> {
        let peripheral = self.adapter.peripheral(id).await?;
        let Some(properties) = peripheral.properties().await? else {
            return Ok(None);
        };

        let address = link_address(id);
        self.peripherals
            .write()
            .await
            .insert(address.clone(), peripheral);

        Ok(Some(LinkEvent::Discovered {
            address,
            name: properties.local_name,
            rssi: properties.rssi,
        }))
    }
}

struct BtleplugConnection {
    address: String,
    peripheral: Peripheral,
    disconnects: Mutex<broadcast::Receiver<String>>,
}

impl BtleplugConnection {
    fn characteristic(&self, service: Uuid, characteristic: Uuid) -> Option<Characteristic> {
        self.peripheral
            .services()
            .into_iter()
            .find(|s| s.uuid == service)?
            .characteristics
            .into_iter()
            .find(|c| c.uuid == characteristic)
    }
}

#[async_trait]
impl GattConnection for BtleplugConnection {
    async fn request_mtu(&self, _mtu: u16) -> Result<u16, LinkError> {
        Err(LinkError::Unsupported)
    }

    async fn discover_services(&self) -> Result<Vec<GattService>, LinkError> {
        self.peripheral.discover_services().await?;
        Ok(self
            .peripheral
            .services()
            .into_iter()
            .map(|s| GattService {
                uuid: s.uuid,
                characteristics: s.characteristics.into_iter().map(|c| c.uuid).collect(),
            })
            .collect())
    }

    async fn write(&self, service: Uuid, characteristic: Uuid, value: &[u8]) -> Result<(), LinkError> {
        let characteristic = self
            .characteristic(service, characteristic)
            .ok_or(LinkError::Unsupported)?;
        self.peripheral
            .write(&characteristic, value, WriteType::WithResponse)
            .await?;
        Ok(())
    }

    async fn link_lost(&self) {
        let mut disconnects = self.disconnects.lock().await;
        loop {
            match disconnects.recv().await {
                Ok(address) if address == self.address => return,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    async fn close(self: Box<Self>) {
        if let Err(e) = self.peripheral.disconnect().await {
            debug!("Disconnect from {} failed: {}", self.address, e);
        }
    }
}

//! Link-layer abstraction.
//!
//! The engine drives the radio through these traits: [`BleLink`] owns
//! scanning, advertising and the GATT server; [`GattConnection`] is one
//! outbound point-to-point connection.

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::LinkError;

/// Event queue depth between the radio backend and the responder worker.
pub const LINK_EVENT_QUEUE_SIZE: usize = 256;

/// Events raised by the radio, consumed by a single worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A radio advertising the message service was heard.
    Discovered {
        address: String,
        name: Option<String>,
        rssi: Option<i16>,
    },
    /// A remote central wrote to one of our characteristics.
    WriteReceived {
        address: String,
        device_name: Option<String>,
        characteristic: Uuid,
        value: Vec<u8>,
        request_id: u32,
        response_needed: bool,
    },
    /// Inbound connection state on the GATT server.
    ConnectionChanged { address: String, connected: bool },
}

/// A GATT service and the characteristics it exposes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<Uuid>,
}

/// One outbound connection to a peer.
#[async_trait]
pub trait GattConnection: Send + Sync {
    /// Ask for a larger MTU. Returns the negotiated size.
    async fn request_mtu(&self, mtu: u16) -> Result<u16, LinkError>;

    async fn discover_services(&self) -> Result<Vec<GattService>, LinkError>;

    /// Write with response; resolves once the peer acknowledges.
    async fn write(&self, service: Uuid, characteristic: Uuid, value: &[u8]) -> Result<(), LinkError>;

    /// Resolves when the peer drops the link.
    async fn link_lost(&self);

    /// Tear the connection down.
    async fn close(self: Box<Self>);
}

/// The local radio.
#[async_trait]
pub trait BleLink: Send + Sync {
    /// Start scanning, advertising and the GATT server. Returns the event
    /// queue; may only be called once per link.
    async fn start(&self, advertised_name: &str) -> Result<mpsc::Receiver<LinkEvent>, LinkError>;

    async fn restart_scan(&self) -> Result<(), LinkError>;

    async fn connect(&self, address: &str) -> Result<Box<dyn GattConnection>, LinkError>;

    /// Answer a write that asked for a response.
    async fn respond(&self, address: &str, request_id: u32, success: bool) -> Result<(), LinkError>;

    async fn stop(&self) -> Result<(), LinkError>;
}

//! blechat - infrastructure-free text messaging between nearby devices over
//! Bluetooth LE.
//!
//! Peers find each other by scanning for a shared service UUID and deliver
//! each message by writing a short text frame to a well-known characteristic.
//! Conversations are either the shared broadcast channel or a private channel
//! keyed by the peer's display name.
//!
//! The bundled [`BtleplugLink`] backend runs the central role only. It scans,
//! connects and writes, but cannot host a GATT server or advertise, so a node
//! built on it sends messages and never receives them. Receiving needs a
//! [`BleLink`] implementation with peripheral support.

pub mod bluetooth;
pub mod config;
pub mod error;
pub mod long_range;
pub mod message;
pub mod notify;

pub use bluetooth::{BleLink, BtleplugLink, PeerDescriptor, PeerManager, TransportSessionManager};
pub use config::NodeConfig;
pub use error::{FrameError, LinkError, SendError, StoreError};
pub use message::{
    ChannelId, ChannelModel, DeliveryCoordinator, DeliveryHandle, DeliveryReport, MemoryMessageStore, Message,
    MessageStore, SqliteMessageStore,
};

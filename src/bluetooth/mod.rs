//! Bluetooth LE Transport Module
//!
//! Discovery, the wire codec, and the per-message GATT sessions used to
//! deliver frames between nearby devices.

pub mod btle;
pub mod link;
pub mod peer_manager;
pub mod protocol;
pub mod session;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use btle::BtleplugLink;
pub use link::{BleLink, GattConnection, LinkEvent};
pub use peer_manager::{PeerDescriptor, PeerManager};
pub use protocol::FrameCodec;
pub use transport::TransportSessionManager;

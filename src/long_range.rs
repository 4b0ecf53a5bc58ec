//! Alternate long-range broadcast transport.
//!
//! A secondary radio (e.g. a serial LoRa modem) that carries broadcast
//! traffic alongside Bluetooth. Bytes handed to it are opaque.

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::LinkError;

#[async_trait]
pub trait LongRangeTransport: Send + Sync {
    /// Live connection state of the radio.
    fn is_connected(&self) -> watch::Receiver<bool>;

    /// Signal quality (SNR) of the last packet heard.
    fn signal_quality(&self) -> watch::Receiver<i32>;

    async fn send_broadcast(&self, data: &[u8]) -> Result<(), LinkError>;
}

//! Error taxonomy shared by the transport, codec and storage layers.

use thiserror::Error;

/// Why an outbound send did not complete.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    /// No session could be opened, or the link dropped before the write began.
    #[error("peer unreachable")]
    PeerUnreachable,
    /// The peer does not expose the message service or characteristic.
    #[error("message service not found on peer")]
    ServiceNotFound,
    /// The write was refused, timed out, or the peer disconnected mid-write.
    #[error("write rejected by peer")]
    WriteRejected,
    /// The session was forced closed by shutdown.
    #[error("session aborted by shutdown")]
    Aborted,
}

/// Payload that is not a recognizable frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("unrecognized frame")]
    UnrecognizedFrame,
}

/// Failures reported by the link layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("link disconnected")]
    Disconnected,
    #[error("operation not supported by this link")]
    Unsupported,
    #[error("link operation timed out")]
    Timeout,
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("bluetooth backend error: {0}")]
    Backend(String),
}

impl From<btleplug::Error> for LinkError {
    fn from(err: btleplug::Error) -> Self {
        match err {
            btleplug::Error::NotConnected => LinkError::Disconnected,
            btleplug::Error::NotSupported(_) => LinkError::Unsupported,
            btleplug::Error::TimedOut(_) => LinkError::Timeout,
            btleplug::Error::DeviceNotFound => LinkError::DeviceNotFound("unknown".to_string()),
            other => LinkError::Backend(other.to_string()),
        }
    }
}

/// Failures of the persistence collaborator.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("corrupt row: {0}")]
    CorruptRow(String),
}

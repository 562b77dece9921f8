/// Reasons a status notification could not be turned into a [`crate::protocol::StatusFrame`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("Response too short: {len} bytes, expected >= {}", crate::protocol::MIN_RESPONSE_LENGTH)]
    TooShort { len: usize },
    #[error("Unexpected response marker {marker:#04X}")]
    WrongMarker { marker: u8 },
}

/// Failures of the underlying BLE link.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Connect failed: {0}")]
    ConnectFailed(String),
    #[error("Write failed: {0}")]
    WriteFailed(String),
    #[error("Notify subscription failed: {0}")]
    NotifySubscribeFailed(String),
    /// Another session already owns the device; the BMS only accepts a single BLE client.
    #[error("Device {0} is already in use by another session")]
    AlreadyInUse(String),
    #[error("Not connected")]
    NotConnected,
    #[error("Notification stream closed")]
    LinkLost,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Timeout waiting for response")]
    Timeout,
    #[error("Connection disabled")]
    Disabled,
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Error {
        Error::Timeout
    }
}

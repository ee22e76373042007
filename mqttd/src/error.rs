//! Error types for mqttd.

use std::io;

use crate::packet::ReasonCode;

/// Result type alias for mqttd.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for mqttd operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Protocol error, reported to the client with the given reason code.
    #[error("protocol error: {0:?}")]
    Protocol(ReasonCode),

    /// Packet codec failure.
    #[error("codec error: {0}")]
    Codec(String),

    /// Connection refused during the handshake.
    #[error("connection refused: {0:?}")]
    ConnectionRefused(ReasonCode),

    /// Connection closed by peer.
    #[error("connection closed")]
    ConnectionClosed,

    /// Timeout error.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Invalid configuration.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Unknown credential provider name.
    #[error("unknown auth provider: {0}")]
    UnknownProvider(String),

    /// Persistence backend failure.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    /// Malformed subscription blob.
    #[error("subscriptions: {0}")]
    Subscriptions(String),

    /// Outbound packet does not fit the negotiated maximum packet size.
    #[error("packet too large: {size} > {max}")]
    PacketTooLarge { size: usize, max: u32 },

    /// Outbound pipeline is not running.
    #[error("writer stopped")]
    WriterStopped,

    /// Manager is shutting down.
    #[error("manager shutting down")]
    ShuttingDown,

    /// Connection handling panicked.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<rumqttc::mqttbytes::Error> for Error {
    fn from(e: rumqttc::mqttbytes::Error) -> Self {
        Error::Codec(e.to_string())
    }
}

impl From<rumqttc::v5::mqttbytes::Error> for Error {
    fn from(e: rumqttc::v5::mqttbytes::Error) -> Self {
        Error::Codec(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}

/// Errors returned by persistence backends.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("persistence: not found")]
    NotFound,

    #[error("persistence: storage error: {0}")]
    Storage(String),

    #[error("persistence: decode error: {0}")]
    Decode(String),
}

/// Result type for persistence operations.
pub type PersistenceResult<T> = std::result::Result<T, PersistenceError>;

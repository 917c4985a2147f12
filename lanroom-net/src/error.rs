//! Error types for room, codec and relay operations.

use std::io;
use thiserror::Error;

/// Errors returned by the room registry, the blob codec and the relay.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("Tunnel driver not available")]
    DriverUnavailable,

    #[error("Failed to create adapter {0}")]
    AdapterCreateFailed(String),

    #[error("Failed to apply configuration (driver error {code})")]
    ApplyFailed { code: u32 },

    #[error("Failed to change adapter state (driver error {code})")]
    AdapterState { code: u32 },

    #[error("Name already in use: {0}")]
    DuplicateName(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid address: {0}")]
    AddressFormat(String),

    #[error("Buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },

    #[error("Configuration layout error: {0}")]
    Layout(String),

    #[error("Failed to create room {room}: {source}")]
    CreateFailed {
        room: String,
        #[source]
        source: Box<NetError>,
    },

    #[error("Failed to bind adapter: {0}")]
    Bind(String),

    #[error("Invalid key: {0}")]
    Key(String),

    #[error("Capture driver error {code}")]
    Capture { code: u32 },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl NetError {
    /// Native driver error code carried by this error, if any.
    pub fn driver_code(&self) -> Option<u32> {
        match self {
            NetError::ApplyFailed { code }
            | NetError::AdapterState { code }
            | NetError::Capture { code } => Some(*code),
            NetError::CreateFailed { source, .. } => source.driver_code(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, NetError>;

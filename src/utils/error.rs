use thiserror::Error;

use crate::network::dht::NodeId;

pub type Result<T> = std::result::Result<T, DhtError>;

#[derive(Error, Debug)]
pub enum DhtError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("Key not found: {0}")]
    NotFound(NodeId),

    #[error("No response from {0}")]
    NoResponse(String),

    #[error("Content checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: NodeId, actual: NodeId },

    #[error("Refusing to send to own address {0}")]
    SendToSelf(String),

    #[error("Bootstrap failed: {0}")]
    BootstrapFailed(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<std::io::Error> for DhtError {
    fn from(err: std::io::Error) -> Self {
        DhtError::Io(err.to_string())
    }
}

impl From<bincode::Error> for DhtError {
    fn from(err: bincode::Error) -> Self {
        DhtError::MalformedMessage(err.to_string())
    }
}

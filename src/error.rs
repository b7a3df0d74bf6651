use thiserror::Error;

/// Error types that can occur in the gateway engine.
///
/// This enum represents all possible error conditions that can arise
/// during mesh message processing, broker publishing, and system operations.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A communication channel was closed unexpectedly
    #[error("Channel closed unexpectedly")]
    ChannelClosed,

    /// Configuration validation failed
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Wire-format violation or parsing error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Broker link failure
    #[error("Broker error: {0}")]
    Broker(String),
}

pub type Result<T> = std::result::Result<T, GatewayError>;

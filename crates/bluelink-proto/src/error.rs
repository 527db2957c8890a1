//! Codec error types

use thiserror::Error;

/// Errors produced while decoding control or event records
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Record shorter than its fixed size
    #[error("Truncated record: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    /// Command byte outside the known command set
    #[error("Unknown command: {0:#04x}")]
    UnknownCommand(u8),

    /// Status byte outside the known status set
    #[error("Unknown response status: {0:#04x}")]
    UnknownStatus(u8),

    /// Profile byte is neither A2DP nor SCO
    #[error("Invalid transport profile: {0:#04x}")]
    InvalidProfile(u8),

    /// Direction byte is not playback, capture or duplex
    #[error("Invalid stream direction: {0:#04x}")]
    InvalidDirection(u8),

    /// Event mask carries bits no event kind is assigned to
    #[error("Unknown event bits in mask: {0:#010x}")]
    UnknownEventBits(u32),

    /// Payload length does not fit the expected record layout
    #[error("Invalid payload length: {len} bytes")]
    PayloadLength { len: usize },

    /// Open response without the transport's byte channel attached
    #[error("Open response carried no byte channel")]
    MissingDescriptor,

    /// Malformed textual Bluetooth address
    #[error("Invalid Bluetooth address: {0}")]
    InvalidAddress(String),
}

/// Result type for codec operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;

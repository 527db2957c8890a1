//! Client error types

use bluelink_proto::{ProtocolError, Status};
use std::io;
use thiserror::Error;

/// Errors that can occur while talking to the daemon or streaming audio
#[derive(Error, Debug)]
pub enum LinkError {
    /// Control or event channel unusable (EOF, reset, broken pipe)
    #[error("Daemon channel failure: {0}")]
    Connection(#[source] io::Error),

    /// Requested transport does not exist
    #[error("Transport not found")]
    NotFound,

    /// Transport exists but is in use
    #[error("Transport busy")]
    Busy,

    /// Daemon answered with a non-success status
    #[error("Request rejected by daemon: {0}")]
    Rejected(Status),

    /// Malformed message on the wire
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Ring buffer over/underrun
    #[error("Stream over/underrun")]
    XRun,

    /// Byte channel closed under a running stream
    #[error("Transport lost")]
    TransportLost,

    /// No transport attached
    #[error("No device attached")]
    NoDevice,

    #[error("Invalid Bluetooth address: {0}")]
    InvalidAddress(String),

    #[error("Invalid stream parameters: {0}")]
    InvalidParams(String),

    #[error("Invalid state: {0}")]
    InvalidState(&'static str),

    /// Local I/O failure (eventfd, poll, thread spawn)
    #[error("I/O error: {0}")]
    Io(#[source] io::Error),
}

impl LinkError {
    /// Map a response status to a result
    pub fn check_status(status: Status) -> LinkResult<()> {
        match status {
            Status::Ok => Ok(()),
            Status::NotFound => Err(LinkError::NotFound),
            Status::Busy => Err(LinkError::Busy),
            other => Err(LinkError::Rejected(other)),
        }
    }

    /// Errors after which retrying the same operation can succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            LinkError::NotFound | LinkError::Busy | LinkError::XRun | LinkError::TransportLost
        )
    }

    pub(crate) fn closed(what: &str) -> Self {
        LinkError::Connection(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("{what} closed by peer"),
        ))
    }
}

/// Result type for client operations
pub type LinkResult<T> = Result<T, LinkError>;

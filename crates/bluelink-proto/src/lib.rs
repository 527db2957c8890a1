//! Bluelink wire protocol
//!
//! Data types and the binary codec shared by the transport daemon and its
//! clients. All integers are little-endian and every record has a fixed
//! size, so both ends can read exactly one record at a time from a stream
//! socket.
//!
//! - [`address`]: Bluetooth device addresses
//! - [`transport`]: transport descriptors (profile, direction, codec, format)
//! - [`message`]: control requests and response headers
//! - [`event`]: transport change notifications
//!
//! This crate performs no I/O.

pub mod address;
pub mod error;
pub mod event;
pub mod message;
pub mod transport;

pub use address::BluetoothAddress;
pub use error::{ProtocolError, ProtocolResult};
pub use event::{EventKind, EventMask, EventRecord, EVENT_RECORD_SIZE};
pub use message::{
    decode_delay, Command, Request, ResponseHeader, Status, DELAY_PAYLOAD_SIZE, REQUEST_SIZE,
    RESPONSE_HEADER_SIZE,
};
pub use transport::{Codec, Profile, StreamDirection, TransportInfo, TRANSPORT_RECORD_SIZE};

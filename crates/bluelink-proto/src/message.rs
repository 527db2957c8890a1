//! Control requests and responses
//!
//! Every request is a fixed 24-byte record. The daemon answers each one with
//! an 8-byte header followed by `payload_len` bytes of payload.

use crate::address::BluetoothAddress;
use crate::error::{ProtocolError, ProtocolResult};
use crate::event::EventMask;
use crate::transport::{Codec, Profile, StreamDirection, TransportInfo, TRANSPORT_RECORD_SIZE};
use std::fmt;

/// Size of an encoded request in bytes
pub const REQUEST_SIZE: usize = 24;

/// Size of a response header in bytes
pub const RESPONSE_HEADER_SIZE: usize = 8;

/// Size of the `GetTransportDelay` payload
pub const DELAY_PAYLOAD_SIZE: usize = 4;

const FLAG_ENABLE: u8 = 0x01;

/// Command byte of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    ListTransports = 1,
    GetTransport = 2,
    OpenTransport = 3,
    CloseTransport = 4,
    PauseTransport = 5,
    DrainTransport = 6,
    GetTransportDelay = 7,
    Subscribe = 8,
}

impl TryFrom<u8> for Command {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Command::ListTransports,
            2 => Command::GetTransport,
            3 => Command::OpenTransport,
            4 => Command::CloseTransport,
            5 => Command::PauseTransport,
            6 => Command::DrainTransport,
            7 => Command::GetTransportDelay,
            8 => Command::Subscribe,
            other => return Err(ProtocolError::UnknownCommand(other)),
        })
    }
}

/// Response status byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Status {
    Ok = 0,
    NotFound = 1,
    Busy = 2,
    InvalidRequest = 3,
    NotSupported = 4,
    Failed = 5,
}

impl TryFrom<u8> for Status {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Status::Ok,
            1 => Status::NotFound,
            2 => Status::Busy,
            3 => Status::InvalidRequest,
            4 => Status::NotSupported,
            5 => Status::Failed,
            other => return Err(ProtocolError::UnknownStatus(other)),
        })
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Ok => "ok",
            Status::NotFound => "not found",
            Status::Busy => "busy",
            Status::InvalidRequest => "invalid request",
            Status::NotSupported => "not supported",
            Status::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A control request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    ListTransports,
    GetTransport {
        address: BluetoothAddress,
        profile: Profile,
        direction: StreamDirection,
    },
    /// Open the transport for the direction carried in the record
    OpenTransport(TransportInfo),
    CloseTransport(TransportInfo),
    PauseTransport {
        transport: TransportInfo,
        enable: bool,
    },
    DrainTransport(TransportInfo),
    GetTransportDelay(TransportInfo),
    Subscribe(EventMask),
}

impl Request {
    pub fn command(&self) -> Command {
        match self {
            Request::ListTransports => Command::ListTransports,
            Request::GetTransport { .. } => Command::GetTransport,
            Request::OpenTransport(_) => Command::OpenTransport,
            Request::CloseTransport(_) => Command::CloseTransport,
            Request::PauseTransport { .. } => Command::PauseTransport,
            Request::DrainTransport(_) => Command::DrainTransport,
            Request::GetTransportDelay(_) => Command::GetTransportDelay,
            Request::Subscribe(_) => Command::Subscribe,
        }
    }

    pub fn encode(&self) -> [u8; REQUEST_SIZE] {
        let mut buf = [0u8; REQUEST_SIZE];
        buf[0] = self.command() as u8;

        let mut record = None;
        match *self {
            Request::ListTransports => {}
            Request::GetTransport {
                address,
                profile,
                direction,
            } => {
                record = Some(TransportInfo {
                    address,
                    profile,
                    direction,
                    codec: Codec::default(),
                    sample_rate: 0,
                    channels: 0,
                });
            }
            Request::OpenTransport(t)
            | Request::CloseTransport(t)
            | Request::DrainTransport(t)
            | Request::GetTransportDelay(t) => record = Some(t),
            Request::PauseTransport { transport, enable } => {
                if enable {
                    buf[1] |= FLAG_ENABLE;
                }
                record = Some(transport);
            }
            Request::Subscribe(mask) => {
                buf[20..24].copy_from_slice(&mask.bits().to_le_bytes());
            }
        }

        if let Some(record) = record {
            buf[4..4 + TRANSPORT_RECORD_SIZE].copy_from_slice(&record.encode());
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> ProtocolResult<Self> {
        if buf.len() < REQUEST_SIZE {
            return Err(ProtocolError::Truncated {
                expected: REQUEST_SIZE,
                actual: buf.len(),
            });
        }

        let command = Command::try_from(buf[0])?;
        let record = || TransportInfo::decode(&buf[4..4 + TRANSPORT_RECORD_SIZE]);

        Ok(match command {
            Command::ListTransports => Request::ListTransports,
            Command::GetTransport => {
                let t = record()?;
                Request::GetTransport {
                    address: t.address,
                    profile: t.profile,
                    direction: t.direction,
                }
            }
            Command::OpenTransport => Request::OpenTransport(record()?),
            Command::CloseTransport => Request::CloseTransport(record()?),
            Command::PauseTransport => Request::PauseTransport {
                transport: record()?,
                enable: buf[1] & FLAG_ENABLE != 0,
            },
            Command::DrainTransport => Request::DrainTransport(record()?),
            Command::GetTransportDelay => Request::GetTransportDelay(record()?),
            Command::Subscribe => Request::Subscribe(EventMask::from_bits(u32::from_le_bytes([
                buf[20], buf[21], buf[22], buf[23],
            ]))?),
        })
    }
}

/// Header preceding every response payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub status: Status,
    pub payload_len: u32,
}

impl ResponseHeader {
    pub fn new(status: Status, payload_len: usize) -> Self {
        Self {
            status,
            payload_len: payload_len as u32,
        }
    }

    pub fn encode(&self) -> [u8; RESPONSE_HEADER_SIZE] {
        let mut buf = [0u8; RESPONSE_HEADER_SIZE];
        buf[0] = self.status as u8;
        buf[4..8].copy_from_slice(&self.payload_len.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> ProtocolResult<Self> {
        if buf.len() < RESPONSE_HEADER_SIZE {
            return Err(ProtocolError::Truncated {
                expected: RESPONSE_HEADER_SIZE,
                actual: buf.len(),
            });
        }
        Ok(Self {
            status: Status::try_from(buf[0])?,
            payload_len: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
        })
    }
}

/// Decode a `GetTransportDelay` payload (units of 0.1 ms)
pub fn decode_delay(payload: &[u8]) -> ProtocolResult<u32> {
    let bytes: [u8; DELAY_PAYLOAD_SIZE] = payload
        .try_into()
        .map_err(|_| ProtocolError::PayloadLength { len: payload.len() })?;
    Ok(u32::from_le_bytes(bytes))
}

//! Transport registry client
//!
//! Request/response exchange with the daemon over its control socket. One
//! request is in flight at a time; callers serialize access (`&mut self`).

use crate::channel::ByteChannel;
use crate::error::{LinkError, LinkResult};
use crate::sys;
use bluelink_proto::{
    decode_delay, BluetoothAddress, Profile, ProtocolError, Request, ResponseHeader, Status,
    StreamDirection, TransportInfo, RESPONSE_HEADER_SIZE, TRANSPORT_RECORD_SIZE,
};
use std::io::{self, Read, Write};
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::path::Path;

/// Upper bound on a response payload (4096 transport records)
const MAX_PAYLOAD: usize = 4096 * TRANSPORT_RECORD_SIZE;

/// Operations on the daemon's transport registry
///
/// The attach machine and the handle work against this trait so they can be
/// driven by an in-memory registry as well as a socket client.
pub trait TransportRegistry: Send {
    /// All transports currently known to the daemon, in registry order
    fn list_transports(&mut self) -> LinkResult<Vec<TransportInfo>>;

    /// Look up one transport by its identity
    fn get_transport(
        &mut self,
        address: BluetoothAddress,
        profile: Profile,
        direction: StreamDirection,
    ) -> LinkResult<TransportInfo>;

    /// Open `transport` for `direction` and return its byte channel
    ///
    /// On success `transport.direction` holds the negotiated direction.
    fn open_transport(
        &mut self,
        transport: &mut TransportInfo,
        direction: StreamDirection,
    ) -> LinkResult<ByteChannel>;

    /// Close an opened transport; closing an unknown transport succeeds
    fn close_transport(&mut self, transport: &TransportInfo) -> LinkResult<()>;

    fn pause_transport(&mut self, transport: &TransportInfo, enable: bool) -> LinkResult<()>;

    fn drain_transport(&mut self, transport: &TransportInfo) -> LinkResult<()>;

    /// Codec/link delay of the transport in frames
    fn transport_delay(&mut self, transport: &TransportInfo) -> LinkResult<usize>;
}

/// Convert a daemon delay (units of 0.1 ms) to frames
pub fn delay_frames(tenths_ms: u32, sample_rate: u32) -> usize {
    (sample_rate as usize / 100) * tenths_ms as usize / 100
}

struct Response {
    header: ResponseHeader,
    payload: Vec<u8>,
    fd: Option<OwnedFd>,
}

/// Socket client for the daemon's control channel
pub struct RegistryClient {
    stream: UnixStream,
}

impl RegistryClient {
    /// Connect to the control socket at `path`
    pub fn connect(path: &Path) -> LinkResult<Self> {
        log::debug!("RegistryClient: connecting to {:?}", path);
        let stream = UnixStream::connect(path).map_err(LinkError::Connection)?;
        Ok(Self::from_stream(stream))
    }

    /// Wrap an already connected control stream
    pub fn from_stream(stream: UnixStream) -> Self {
        Self { stream }
    }

    fn transact(&mut self, request: &Request) -> LinkResult<Response> {
        log::trace!("RegistryClient: -> {:?}", request.command());

        self.stream
            .write_all(&request.encode())
            .map_err(LinkError::Connection)?;

        let (header, fd) = self.read_header()?;
        let len = header.payload_len as usize;
        if len > MAX_PAYLOAD {
            return Err(ProtocolError::PayloadLength { len }.into());
        }

        let mut payload = vec![0u8; len];
        self.stream.read_exact(&mut payload).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                LinkError::closed("control channel")
            } else {
                LinkError::Connection(e)
            }
        })?;

        log::trace!(
            "RegistryClient: <- {} ({} bytes{})",
            header.status,
            len,
            if fd.is_some() { ", fd" } else { "" }
        );
        Ok(Response {
            header,
            payload,
            fd,
        })
    }

    /// Read the response header; a passed descriptor rides on these bytes
    fn read_header(&mut self) -> LinkResult<(ResponseHeader, Option<OwnedFd>)> {
        let mut buf = [0u8; RESPONSE_HEADER_SIZE];
        let mut filled = 0;
        let mut fd = None;

        while filled < buf.len() {
            let (n, received) =
                sys::recv_with_fd(&self.stream, &mut buf[filled..]).map_err(LinkError::Connection)?;
            if n == 0 {
                return Err(LinkError::closed("control channel"));
            }
            if received.is_some() {
                fd = received;
            }
            filled += n;
        }

        Ok((ResponseHeader::decode(&buf)?, fd))
    }

    fn single_record(payload: &[u8]) -> LinkResult<TransportInfo> {
        if payload.len() != TRANSPORT_RECORD_SIZE {
            return Err(ProtocolError::PayloadLength { len: payload.len() }.into());
        }
        Ok(TransportInfo::decode(payload)?)
    }
}

impl TransportRegistry for RegistryClient {
    fn list_transports(&mut self) -> LinkResult<Vec<TransportInfo>> {
        let response = self.transact(&Request::ListTransports)?;
        LinkError::check_status(response.header.status)?;
        Ok(TransportInfo::decode_list(&response.payload)?)
    }

    fn get_transport(
        &mut self,
        address: BluetoothAddress,
        profile: Profile,
        direction: StreamDirection,
    ) -> LinkResult<TransportInfo> {
        let response = self.transact(&Request::GetTransport {
            address,
            profile,
            direction,
        })?;
        LinkError::check_status(response.header.status)?;
        Self::single_record(&response.payload)
    }

    fn open_transport(
        &mut self,
        transport: &mut TransportInfo,
        direction: StreamDirection,
    ) -> LinkResult<ByteChannel> {
        let mut requested = *transport;
        requested.direction = direction;

        let response = self.transact(&Request::OpenTransport(requested))?;
        LinkError::check_status(response.header.status)?;

        let opened = Self::single_record(&response.payload)?;
        let fd = response.fd.ok_or(ProtocolError::MissingDescriptor)?;

        transport.direction = opened.direction;
        log::debug!("RegistryClient: opened {}", transport);
        Ok(ByteChannel::from_fd(fd))
    }

    fn close_transport(&mut self, transport: &TransportInfo) -> LinkResult<()> {
        let response = self.transact(&Request::CloseTransport(*transport))?;
        match response.header.status {
            Status::NotFound => {
                log::debug!("RegistryClient: close of unknown transport {}", transport);
                Ok(())
            }
            status => LinkError::check_status(status),
        }
    }

    fn pause_transport(&mut self, transport: &TransportInfo, enable: bool) -> LinkResult<()> {
        let response = self.transact(&Request::PauseTransport {
            transport: *transport,
            enable,
        })?;
        LinkError::check_status(response.header.status)
    }

    fn drain_transport(&mut self, transport: &TransportInfo) -> LinkResult<()> {
        let response = self.transact(&Request::DrainTransport(*transport))?;
        LinkError::check_status(response.header.status)
    }

    fn transport_delay(&mut self, transport: &TransportInfo) -> LinkResult<usize> {
        let response = self.transact(&Request::GetTransportDelay(*transport))?;
        LinkError::check_status(response.header.status)?;
        let tenths = decode_delay(&response.payload)?;
        Ok(delay_frames(tenths, transport.sample_rate))
    }
}

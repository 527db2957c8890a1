//! In-process stand-ins for the daemon side, shared by the unit tests

use crate::bridge::ChannelSource;
use crate::channel::ByteChannel;
use crate::error::{LinkError, LinkResult};
use crate::events::EventSubscriber;
use crate::registry::{RegistryClient, TransportRegistry};
use crate::sys::{self, EventFd};
use bluelink_proto::{
    BluetoothAddress, Codec, EventMask, EventRecord, Profile, Request, ResponseHeader, Status,
    StreamDirection, TransportInfo, REQUEST_SIZE,
};
use std::io::{Read, Write};
use std::net::Shutdown;
use std::os::fd::{AsFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

pub(crate) fn capture_transport() -> TransportInfo {
    TransportInfo {
        address: "00:1A:7D:DA:71:13".parse().unwrap(),
        profile: Profile::A2dp,
        direction: StreamDirection::Capture,
        codec: Codec::SBC,
        sample_rate: 44100,
        channels: 2,
    }
}

/// Same device as [`capture_transport`], other direction
pub(crate) fn playback_transport() -> TransportInfo {
    TransportInfo {
        direction: StreamDirection::Playback,
        ..capture_transport()
    }
}

/// Route library logs to the test harness; `RUST_LOG` picks the level
pub(crate) fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Poll `cond` for up to two seconds
pub(crate) fn wait_until(cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

fn same_endpoint(listed: &TransportInfo, wanted: &TransportInfo) -> bool {
    listed.address == wanted.address
        && listed.profile == wanted.profile
        && listed.direction.accepts(wanted.direction)
}

fn channel_pair() -> (ByteChannel, UnixStream) {
    let (ours, peer) = UnixStream::pair().unwrap();
    (ByteChannel::from_fd(OwnedFd::from(ours)), peer)
}

// ─── Fake daemon over a socket pair ───

#[derive(Default)]
struct DaemonState {
    transports: Vec<TransportInfo>,
    open: Vec<TransportInfo>,
    peers: Vec<UnixStream>,
    pauses: Vec<bool>,
    delay: u32,
}

/// Serves the control protocol on one end of a socket pair
pub(crate) struct FakeDaemon {
    state: Arc<Mutex<DaemonState>>,
    control: UnixStream,
    thread: Option<thread::JoinHandle<()>>,
}

impl FakeDaemon {
    pub(crate) fn spawn(transports: Vec<TransportInfo>) -> (Self, RegistryClient) {
        init_logging();
        let (client, server) = UnixStream::pair().unwrap();
        let state = Arc::new(Mutex::new(DaemonState {
            transports,
            ..DaemonState::default()
        }));

        let control = server.try_clone().unwrap();
        let thread_state = state.clone();
        let thread = thread::spawn(move || serve(server, thread_state));

        let daemon = Self {
            state,
            control,
            thread: Some(thread),
        };
        (daemon, RegistryClient::from_stream(client))
    }

    pub(crate) fn set_transports(&self, transports: Vec<TransportInfo>) {
        self.state.lock().unwrap().transports = transports;
    }

    /// Daemon side of the most recently opened byte channel
    pub(crate) fn take_peer(&self) -> Option<UnixStream> {
        self.state.lock().unwrap().peers.pop()
    }

    pub(crate) fn open_count(&self) -> usize {
        self.state.lock().unwrap().open.len()
    }

    pub(crate) fn pause_log(&self) -> Vec<bool> {
        self.state.lock().unwrap().pauses.clone()
    }

    /// Delay reported for every transport, in 0.1 ms
    pub(crate) fn set_delay(&self, tenths_ms: u32) {
        self.state.lock().unwrap().delay = tenths_ms;
    }

    /// Hang up the control connection
    pub(crate) fn shutdown(&self) {
        let _ = self.control.shutdown(Shutdown::Both);
    }
}

impl Drop for FakeDaemon {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn reply(stream: &UnixStream, status: Status, payload: &[u8], fd: Option<&UnixStream>) {
    let header = ResponseHeader::new(status, payload.len()).encode();
    sys::send_with_fd(stream, &header, fd.map(|s| s.as_fd())).unwrap();
    let mut writer = stream;
    writer.write_all(payload).unwrap();
}

fn serve(mut stream: UnixStream, state: Arc<Mutex<DaemonState>>) {
    let mut buf = [0u8; REQUEST_SIZE];
    while stream.read_exact(&mut buf).is_ok() {
        let Ok(request) = Request::decode(&buf) else {
            reply(&stream, Status::InvalidRequest, &[], None);
            continue;
        };

        let mut st = state.lock().unwrap();
        match request {
            Request::ListTransports => {
                let payload: Vec<u8> = st.transports.iter().flat_map(|t| t.encode()).collect();
                reply(&stream, Status::Ok, &payload, None);
            }
            Request::GetTransport {
                address,
                profile,
                direction,
            } => {
                let found = st.transports.iter().find(|t| {
                    t.address == address && t.profile == profile && t.direction.accepts(direction)
                });
                match found {
                    Some(t) => reply(&stream, Status::Ok, &t.encode(), None),
                    None => reply(&stream, Status::NotFound, &[], None),
                }
            }
            Request::OpenTransport(wanted) => {
                let Some(listed) = st.transports.iter().find(|t| same_endpoint(t, &wanted)).copied()
                else {
                    reply(&stream, Status::NotFound, &[], None);
                    continue;
                };
                if st.open.contains(&wanted) {
                    reply(&stream, Status::Busy, &[], None);
                    continue;
                }

                let opened = TransportInfo {
                    direction: wanted.direction,
                    ..listed
                };
                let (client_end, daemon_end) = UnixStream::pair().unwrap();
                reply(&stream, Status::Ok, &opened.encode(), Some(&client_end));
                st.open.push(opened);
                st.peers.push(daemon_end);
            }
            Request::CloseTransport(t) => match st.open.iter().position(|o| *o == t) {
                Some(index) => {
                    st.open.remove(index);
                    reply(&stream, Status::Ok, &[], None);
                }
                None => reply(&stream, Status::NotFound, &[], None),
            },
            Request::PauseTransport { enable, .. } => {
                st.pauses.push(enable);
                reply(&stream, Status::Ok, &[], None);
            }
            Request::DrainTransport(_) => reply(&stream, Status::Ok, &[], None),
            Request::GetTransportDelay(_) => {
                reply(&stream, Status::Ok, &st.delay.to_le_bytes(), None);
            }
            Request::Subscribe(_) => reply(&stream, Status::NotSupported, &[], None),
        }
    }
}

// ─── Event feed ───

/// Daemon side of an event channel
pub(crate) struct FakeEventFeed {
    stream: UnixStream,
}

impl FakeEventFeed {
    /// The subscribe answer is queued up front so `subscribe` never waits
    pub(crate) fn new() -> (Self, EventSubscriber) {
        Self::with_status(Status::Ok)
    }

    pub(crate) fn with_status(status: Status) -> (Self, EventSubscriber) {
        init_logging();
        let (client, server) = UnixStream::pair().unwrap();
        (&server)
            .write_all(&ResponseHeader::new(status, 0).encode())
            .unwrap();
        (Self { stream: server }, EventSubscriber::from_stream(client))
    }

    pub(crate) fn expect_subscribe(&mut self) -> EventMask {
        let mut buf = [0u8; REQUEST_SIZE];
        self.stream.read_exact(&mut buf).unwrap();
        match Request::decode(&buf).unwrap() {
            Request::Subscribe(mask) => mask,
            other => panic!("expected subscribe, got {:?}", other),
        }
    }

    pub(crate) fn send(&mut self, event: EventRecord) {
        self.stream.write_all(&event.encode()).unwrap();
    }

    pub(crate) fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).unwrap();
    }

    /// Hang up cleanly
    ///
    /// Unread requests are drained first: closing a socket with pending input
    /// resets the peer instead of giving it EOF.
    pub(crate) fn close(self) {
        self.stream.set_nonblocking(true).unwrap();
        let mut sink = [0u8; 256];
        while let Ok(n) = (&self.stream).read(&mut sink) {
            if n == 0 {
                break;
            }
        }
        let _ = self.stream.shutdown(Shutdown::Write);
    }
}

// ─── In-memory registry ───

#[derive(Default)]
struct MockState {
    transports: Vec<TransportInfo>,
    live: Vec<TransportInfo>,
    opened: Vec<TransportInfo>,
    closed: Vec<TransportInfo>,
    max_open: usize,
    list_calls: usize,
    fail_next_open: Option<LinkError>,
    peers: Vec<UnixStream>,
    pauses: Vec<bool>,
    drains: usize,
    delay_frames: usize,
    delay_calls: usize,
}

/// Registry double that records every call; clones share state
#[derive(Clone, Default)]
pub(crate) struct MockRegistry {
    state: Arc<Mutex<MockState>>,
}

impl MockRegistry {
    pub(crate) fn new(transports: Vec<TransportInfo>) -> Self {
        init_logging();
        let registry = Self::default();
        registry.set_transports(transports);
        registry
    }

    pub(crate) fn set_transports(&self, transports: Vec<TransportInfo>) {
        self.state.lock().unwrap().transports = transports;
    }

    pub(crate) fn fail_next_open(&self, error: LinkError) {
        self.state.lock().unwrap().fail_next_open = Some(error);
    }

    pub(crate) fn opened(&self) -> Vec<TransportInfo> {
        self.state.lock().unwrap().opened.clone()
    }

    pub(crate) fn closed(&self) -> Vec<TransportInfo> {
        self.state.lock().unwrap().closed.clone()
    }

    /// Transports currently open
    pub(crate) fn open_now(&self) -> usize {
        self.state.lock().unwrap().live.len()
    }

    /// Most transports ever open at the same time
    pub(crate) fn max_open(&self) -> usize {
        self.state.lock().unwrap().max_open
    }

    pub(crate) fn list_calls(&self) -> usize {
        self.state.lock().unwrap().list_calls
    }

    pub(crate) fn take_peer(&self) -> Option<UnixStream> {
        self.state.lock().unwrap().peers.pop()
    }

    pub(crate) fn pauses(&self) -> Vec<bool> {
        self.state.lock().unwrap().pauses.clone()
    }

    pub(crate) fn drains(&self) -> usize {
        self.state.lock().unwrap().drains
    }

    pub(crate) fn set_delay(&self, frames: usize) {
        self.state.lock().unwrap().delay_frames = frames;
    }

    pub(crate) fn delay_calls(&self) -> usize {
        self.state.lock().unwrap().delay_calls
    }
}

impl TransportRegistry for MockRegistry {
    fn list_transports(&mut self) -> LinkResult<Vec<TransportInfo>> {
        let mut st = self.state.lock().unwrap();
        st.list_calls += 1;
        Ok(st.transports.clone())
    }

    fn get_transport(
        &mut self,
        address: BluetoothAddress,
        profile: Profile,
        direction: StreamDirection,
    ) -> LinkResult<TransportInfo> {
        let st = self.state.lock().unwrap();
        st.transports
            .iter()
            .find(|t| {
                t.address == address && t.profile == profile && t.direction.accepts(direction)
            })
            .copied()
            .ok_or(LinkError::NotFound)
    }

    fn open_transport(
        &mut self,
        transport: &mut TransportInfo,
        direction: StreamDirection,
    ) -> LinkResult<ByteChannel> {
        let mut st = self.state.lock().unwrap();
        if let Some(error) = st.fail_next_open.take() {
            return Err(error);
        }

        let wanted = TransportInfo {
            direction,
            ..*transport
        };
        if !st.transports.iter().any(|t| same_endpoint(t, &wanted)) {
            return Err(LinkError::NotFound);
        }
        if st.live.contains(&wanted) {
            return Err(LinkError::Busy);
        }

        transport.direction = direction;
        st.live.push(*transport);
        st.opened.push(*transport);
        st.max_open = st.max_open.max(st.live.len());

        let (channel, peer) = channel_pair();
        st.peers.push(peer);
        Ok(channel)
    }

    fn close_transport(&mut self, transport: &TransportInfo) -> LinkResult<()> {
        let mut st = self.state.lock().unwrap();
        if let Some(index) = st.live.iter().position(|t| t == transport) {
            st.live.remove(index);
            st.closed.push(*transport);
        }
        Ok(())
    }

    fn pause_transport(&mut self, _transport: &TransportInfo, enable: bool) -> LinkResult<()> {
        self.state.lock().unwrap().pauses.push(enable);
        Ok(())
    }

    fn drain_transport(&mut self, _transport: &TransportInfo) -> LinkResult<()> {
        self.state.lock().unwrap().drains += 1;
        Ok(())
    }

    fn transport_delay(&mut self, _transport: &TransportInfo) -> LinkResult<usize> {
        let mut st = self.state.lock().unwrap();
        st.delay_calls += 1;
        Ok(st.delay_frames)
    }
}

// ─── Channel source ───

/// Hands out one fixed channel until asked to reconnect
pub(crate) struct StaticSource {
    channel: Mutex<Option<Arc<ByteChannel>>>,
    attach: EventFd,
    generation: AtomicU64,
    reconnects: AtomicUsize,
}

impl StaticSource {
    pub(crate) fn empty() -> Self {
        init_logging();
        Self {
            channel: Mutex::new(None),
            attach: EventFd::new().unwrap(),
            generation: AtomicU64::new(0),
            reconnects: AtomicUsize::new(0),
        }
    }

    /// A source holding one end of a fresh socket pair, and the other end
    pub(crate) fn connected() -> (Arc<Self>, UnixStream) {
        let (channel, peer) = channel_pair();
        let source = Self::empty();
        *source.channel.lock().unwrap() = Some(Arc::new(channel));
        (Arc::new(source), peer)
    }

    pub(crate) fn reconnects(&self) -> usize {
        self.reconnects.load(Ordering::Relaxed)
    }
}

impl ChannelSource for StaticSource {
    fn channel(&self) -> Option<Arc<ByteChannel>> {
        self.channel.lock().unwrap().clone()
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::Relaxed)
    }

    fn attach_signal(&self) -> &EventFd {
        &self.attach
    }

    fn reconnect(&self, dead: &Arc<ByteChannel>) {
        let mut channel = self.channel.lock().unwrap();
        if channel.as_ref().is_some_and(|current| Arc::ptr_eq(current, dead)) {
            *channel = None;
            self.generation.fetch_add(1, Ordering::Relaxed);
        }
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }
}

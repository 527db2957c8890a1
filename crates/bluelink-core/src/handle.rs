//! Client handle
//!
//! Owns the two daemon connections, the attach machine and the streaming
//! bridge. A monitor thread follows daemon events and keeps the attach
//! machine in sync; the bridge worker gets its byte channel through the
//! same shared state.
//!
//! ```no_run
//! use bluelink_core::{Handle, StreamConfig};
//! use bluelink_proto::Profile;
//!
//! # fn main() -> bluelink_core::LinkResult<()> {
//! let mut handle = Handle::open("hci0")?;
//! handle.set_device(Some("00:1A:7D:DA:71:13"), Profile::A2dp)?;
//! handle.prepare(&StreamConfig::default())?;
//!
//! let mut buf = vec![0u8; 4 * 882];
//! let frames = handle.read_frames(&mut buf)?;
//! # let _ = frames;
//! # Ok(())
//! # }
//! ```

use crate::attach::{AttachMachine, AttachOutcome, AttachState, DeviceFilter};
use crate::bridge::{BridgeState, ChannelSource, StreamingBridge, StreamParams};
use crate::channel::ByteChannel;
use crate::config::{default_link_config_path, load_link_config, LinkConfig, StreamConfig};
use crate::error::{LinkError, LinkResult};
use crate::events::{EventSubscriber, ShutdownHandle};
use crate::registry::{RegistryClient, TransportRegistry};
use crate::sys::EventFd;
use bluelink_proto::{BluetoothAddress, EventMask, Profile, StreamDirection, TransportInfo};
use flume::{Receiver, Sender};
use std::fmt::Write as _;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// Asynchronous failures queued before the oldest ones are dropped
const ERROR_QUEUE_CAPACITY: usize = 32;

/// Everything the monitor thread mutates
struct Session {
    registry: Box<dyn TransportRegistry>,
    attach: AttachMachine,
}

impl Session {
    fn parts(&mut self) -> (&mut dyn TransportRegistry, &mut AttachMachine) {
        (self.registry.as_mut(), &mut self.attach)
    }
}

/// State shared by the handle, the monitor thread and the bridge worker
struct LinkShared {
    /// Interface name, used as the log prefix
    name: String,
    direction: StreamDirection,
    session: Mutex<Session>,
    attach_signal: EventFd,
    errors: Sender<LinkError>,
    closing: AtomicBool,
    /// Attach generation as of the last session change, readable without the lock
    generation: AtomicU64,
}

impl LinkShared {
    fn lock(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run the attach machine under the lock and publish its generation
    fn with_session<T>(
        &self,
        op: impl FnOnce(&mut dyn TransportRegistry, &mut AttachMachine) -> T,
    ) -> T {
        let mut session = self.lock();
        let (registry, attach) = session.parts();
        let result = op(registry, attach);
        self.generation.store(attach.generation(), Ordering::Relaxed);
        result
    }

    fn report(&self, error: LinkError) {
        if self.errors.try_send(error).is_err() {
            log::warn!("[link {}] error channel full, dropping error", self.name);
        }
    }

    /// Bookkeeping after the attach machine ran
    fn attached(&self, outcome: &AttachOutcome) {
        if let AttachOutcome::Attached(info) = outcome {
            log::debug!("[link {}] signalling attach of {}", self.name, info);
            if let Err(e) = self.attach_signal.signal(1) {
                log::warn!("[link {}] failed to signal attach: {}", self.name, e);
            }
        }
    }
}

impl ChannelSource for LinkShared {
    fn channel(&self) -> Option<Arc<ByteChannel>> {
        self.lock().attach.channel()
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::Relaxed)
    }

    fn attach_signal(&self) -> &EventFd {
        &self.attach_signal
    }

    fn reconnect(&self, dead: &Arc<ByteChannel>) {
        let outcome = self.with_session(|registry, attach| {
            // Already replaced by a device switch or a removal
            if !attach.channel().is_some_and(|current| Arc::ptr_eq(&current, dead)) {
                return None;
            }
            if let Err(e) = attach.detach(registry) {
                log::warn!("[link {}] closing dead transport failed: {}", self.name, e);
            }
            Some(attach.evaluate(registry))
        });

        match outcome {
            None => log::debug!("[link {}] dead channel no longer attached", self.name),
            Some(Ok(outcome)) => {
                if outcome == AttachOutcome::Unchanged {
                    log::info!("[link {}] waiting for the transport to come back", self.name);
                }
                self.attached(&outcome);
            }
            Some(Err(e)) => {
                log::warn!("[link {}] reconnect failed: {}", self.name, e);
                self.report(e);
            }
        }
    }
}

/// Follow daemon events until the event channel closes
fn monitor_loop(shared: Arc<LinkShared>, mut events: EventSubscriber) {
    log::debug!("[link {}] monitor started", shared.name);

    loop {
        let event = match events.next_event() {
            Ok(event) => event,
            Err(e) => {
                if shared.closing.load(Ordering::Relaxed) {
                    log::debug!("[link {}] event channel closed", shared.name);
                } else {
                    log::error!("[link {}] event channel failed: {}", shared.name, e);
                    shared.report(e);
                }
                break;
            }
        };

        log::debug!("[link {}] event {} for {}", shared.name, event.mask, event.transport);
        let outcome = shared.with_session(|registry, attach| attach.handle_event(registry, &event));

        match outcome {
            Ok(outcome) => shared.attached(&outcome),
            Err(e) => {
                log::warn!("[link {}] handling event failed: {}", shared.name, e);
                shared.report(e);
            }
        }
    }

    log::debug!("[link {}] monitor stopped", shared.name);
}

/// A connection to the transport daemon with at most one attached transport
pub struct Handle {
    shared: Arc<LinkShared>,
    config: LinkConfig,
    monitor: Option<JoinHandle<()>>,
    events: ShutdownHandle,
    errors: Receiver<LinkError>,
    bridge: Option<StreamingBridge>,
    /// Last time the codec delay was asked from the daemon
    delay_refreshed: Option<Instant>,
}

impl Handle {
    /// Connect to the daemon serving `interface`, using the user config
    pub fn open(interface: &str) -> LinkResult<Self> {
        let mut config = load_link_config(&default_link_config_path());
        config.interface = interface.to_string();
        Self::open_with_config(&config)
    }

    pub fn open_with_config(config: &LinkConfig) -> LinkResult<Self> {
        let path = config.control_socket_path();
        log::info!("[link {}] connecting to {:?}", config.interface, path);

        let registry = RegistryClient::connect(&path)?;
        let events = EventSubscriber::connect(&path)?;
        Self::from_parts(registry, events, config)
    }

    /// Build a handle on already connected channels
    pub fn from_parts(
        registry: impl TransportRegistry + 'static,
        mut events: EventSubscriber,
        config: &LinkConfig,
    ) -> LinkResult<Self> {
        events.subscribe(EventMask::TRANSPORTS)?;
        let shutdown = events.shutdown_handle()?;

        let (tx, rx) = flume::bounded(ERROR_QUEUE_CAPACITY);
        let shared = Arc::new(LinkShared {
            name: config.interface.clone(),
            direction: config.direction,
            session: Mutex::new(Session {
                registry: Box::new(registry),
                attach: AttachMachine::new(),
            }),
            attach_signal: EventFd::new().map_err(LinkError::Io)?,
            errors: tx,
            closing: AtomicBool::new(false),
            generation: AtomicU64::new(0),
        });

        let monitor_shared = shared.clone();
        let monitor = thread::Builder::new()
            .name("bluelink-monitor".to_string())
            .spawn(move || monitor_loop(monitor_shared, events))
            .map_err(LinkError::Io)?;

        log::info!("[link {}] opened ({})", config.interface, config.direction);
        Ok(Self {
            shared,
            config: config.clone(),
            monitor: Some(monitor),
            events: shutdown,
            errors: rx,
            bridge: None,
            delay_refreshed: None,
        })
    }

    /// Select the device to attach to and attach right away if it is present
    ///
    /// `None` accepts any device.
    pub fn set_device(&self, address: Option<&str>, profile: Profile) -> LinkResult<AttachOutcome> {
        let address = match address {
            Some(text) => text
                .parse::<BluetoothAddress>()
                .map_err(|_| LinkError::InvalidAddress(text.to_string()))?,
            None => BluetoothAddress::ANY,
        };
        self.apply_filter(Some(DeviceFilter::new(address, profile, self.shared.direction)))
    }

    /// Forget the device filter and release any attached transport
    pub fn clear_device(&self) -> LinkResult<AttachOutcome> {
        self.apply_filter(None)
    }

    fn apply_filter(&self, filter: Option<DeviceFilter>) -> LinkResult<AttachOutcome> {
        let outcome = self
            .shared
            .with_session(|registry, attach| attach.set_device(registry, filter))?;
        self.shared.attached(&outcome);
        Ok(outcome)
    }

    pub fn attach_state(&self) -> AttachState {
        self.shared.lock().attach.state()
    }

    pub fn transport(&self) -> Option<TransportInfo> {
        self.shared.lock().attach.transport()
    }

    pub fn device_filter(&self) -> Option<DeviceFilter> {
        self.shared.lock().attach.filter()
    }

    /// Failures from the monitor and the streaming worker
    pub fn errors(&self) -> &Receiver<LinkError> {
        &self.errors
    }

    pub fn direction(&self) -> StreamDirection {
        self.shared.direction
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Run `op` against the daemon for the attached transport
    fn with_transport<T>(
        &self,
        op: impl FnOnce(&mut dyn TransportRegistry, &TransportInfo) -> LinkResult<T>,
    ) -> LinkResult<T> {
        let mut session = self.shared.lock();
        let (registry, attach) = session.parts();
        let transport = attach.transport().ok_or(LinkError::NoDevice)?;
        op(registry, &transport)
    }

    fn bridge_mut(&mut self) -> LinkResult<&mut StreamingBridge> {
        self.bridge
            .as_mut()
            .ok_or(LinkError::InvalidState("stream not prepared"))
    }

    fn bridge_ref(&self) -> LinkResult<&StreamingBridge> {
        self.bridge
            .as_ref()
            .ok_or(LinkError::InvalidState("stream not prepared"))
    }

    /// Size the bridge for the attached transport and reset it
    ///
    /// A bridge with matching parameters is reused.
    pub fn prepare(&mut self, stream: &StreamConfig) -> LinkResult<()> {
        let transport = self.transport().ok_or(LinkError::NoDevice)?;
        let params = StreamParams::for_transport(&transport, self.shared.direction, stream)?;

        let reusable = self
            .bridge
            .as_ref()
            .is_some_and(|bridge| *bridge.params() == params);
        if !reusable {
            if let Some(mut old) = self.bridge.take() {
                old.stop();
            }
            let source: Arc<dyn ChannelSource> = self.shared.clone();
            self.bridge = Some(StreamingBridge::new(
                params,
                source,
                self.shared.errors.clone(),
                self.config.reconnect_retry(),
            )?);
            log::info!(
                "[link {}] stream {}Hz {}ch, period {} frames, buffer {} frames",
                self.shared.name,
                params.rate,
                params.channels,
                params.period_frames,
                params.buffer_frames
            );
        }

        self.delay_refreshed = None;
        self.bridge_mut()?.prepare()
    }

    pub fn start(&mut self) -> LinkResult<()> {
        self.bridge_ref()?;
        self.with_transport(|registry, t| registry.pause_transport(t, false))?;
        self.bridge_mut()?.start()
    }

    pub fn pause(&mut self, enable: bool) -> LinkResult<()> {
        self.bridge_ref()?;
        self.with_transport(|registry, t| registry.pause_transport(t, enable))?;
        self.bridge_mut()?.pause(enable)
    }

    /// Wait for queued playback to leave, then let the daemon flush its side
    pub fn drain(&mut self) -> LinkResult<()> {
        self.bridge_mut()?.drain()?;
        if self.shared.direction == StreamDirection::Playback {
            self.with_transport(|registry, t| registry.drain_transport(t))?;
        }
        Ok(())
    }

    /// Stop streaming and drop the bridge
    pub fn stop(&mut self) {
        if let Some(mut bridge) = self.bridge.take() {
            bridge.stop();
            log::debug!("[link {}] stream stopped", self.shared.name);
        }
    }

    pub fn read_frames(&mut self, buf: &mut [u8]) -> LinkResult<usize> {
        self.bridge_mut()?.read(buf)
    }

    pub fn write_frames(&mut self, buf: &[u8]) -> LinkResult<usize> {
        self.bridge_mut()?.write(buf)
    }

    /// Frames between the application and the air
    pub fn delay(&mut self) -> LinkResult<usize> {
        let bridge = self.bridge.as_ref().ok_or(LinkError::InvalidState("stream not prepared"))?;
        let frame_size = bridge.params().frame_size;
        let mut delay = bridge.queued_frames();

        if let Some(channel) = self.shared.channel() {
            match channel.bytes_queued() {
                Ok(bytes) => delay += bytes / frame_size,
                Err(e) => log::debug!("[link {}] FIONREAD failed: {}", self.shared.name, e),
            }
        }

        let playing = bridge.state() == BridgeState::Running;
        if self.shared.direction == StreamDirection::Playback && playing {
            let due = self
                .delay_refreshed
                .map_or(true, |at| at.elapsed() >= self.config.delay.refresh_interval());
            if due {
                let mut session = self.shared.lock();
                let (registry, attach) = session.parts();
                if let Some(transport) = attach.transport() {
                    match registry.transport_delay(&transport) {
                        Ok(frames) => bridge.set_codec_delay(frames),
                        Err(e) => {
                            log::warn!("[link {}] delay query failed: {}", self.shared.name, e)
                        }
                    }
                }
                self.delay_refreshed = Some(Instant::now());
            }
        }

        Ok(delay + bridge.codec_delay() + self.config.delay.extra_frames)
    }

    /// Worker position inside the ring, in frames
    pub fn pointer(&self) -> LinkResult<usize> {
        self.bridge_ref()?.pointer()
    }

    /// Descriptor that becomes readable when the stream makes progress
    pub fn poll_descriptor(&self) -> LinkResult<RawFd> {
        Ok(self.bridge_ref()?.poll_descriptor())
    }

    pub fn bridge_state(&self) -> Option<BridgeState> {
        self.bridge.as_ref().map(|bridge| bridge.state())
    }

    /// Multi-line human-readable summary
    pub fn describe(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Bluetooth link {} ({})", self.shared.name, self.shared.direction);
        match self.device_filter() {
            Some(filter) => {
                let _ = writeln!(out, "  device: {}", filter);
            }
            None => out.push_str("  device: none\n"),
        }
        match self.transport() {
            Some(t) => {
                let _ = writeln!(out, "  transport: {}", t);
            }
            None => out.push_str("  transport: not attached\n"),
        }
        if let Some(bridge) = &self.bridge {
            let params = bridge.params();
            let pos = bridge.positions();
            let _ = writeln!(
                out,
                "  stream: {:?}, period {} / buffer {} frames, hw_ptr {} appl_ptr {}",
                bridge.state(),
                params.period_frames,
                params.buffer_frames,
                pos.hw_ptr,
                pos.appl_ptr
            );
        }
        out
    }

    /// Release everything and report whether the transport closed cleanly
    pub fn close(mut self) -> LinkResult<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> LinkResult<()> {
        self.stop();

        let Some(monitor) = self.monitor.take() else {
            return Ok(());
        };
        self.shared.closing.store(true, Ordering::Relaxed);
        self.events.shutdown();
        if monitor.join().is_err() {
            log::error!("[link {}] monitor panicked", self.shared.name);
        }

        self.shared.with_session(|registry, attach| attach.detach(registry))?;
        log::info!("[link {}] closed", self.shared.name);
        Ok(())
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::warn!("[link {}] close failed: {}", self.shared.name, e);
        }
    }
}

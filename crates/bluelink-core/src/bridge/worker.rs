//! Streaming worker thread
//!
//! Moves one period at a time between the ring buffer and the transport's
//! byte channel. Every blocking wait includes the wake eventfd so state
//! changes and stop requests are seen promptly.

use super::pacing::RateSync;
use super::params::StreamParams;
use super::state::{distance, BridgeShared, BridgeState};
use super::ChannelSource;
use crate::channel::ByteChannel;
use crate::error::{LinkError, LinkResult};
use crate::sys::{self, Readiness};
use bluelink_proto::StreamDirection;
use flume::Sender;
use rtrb::chunks::ChunkError;
use rtrb::{Consumer, Producer};
use std::io;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// The worker's end of the ring
pub(super) enum WorkerEnd {
    /// Playback: the worker drains what the application wrote
    Playback(Consumer<u8>),
    /// Capture: the worker fills what the application reads
    Capture(Producer<u8>),
}

/// Result of one transfer attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Transferred(usize),
    /// Woken mid-transfer by a state change; nothing committed
    Interrupted,
    XRun,
    /// Draining playback ran out of queued frames
    Drained,
    /// Byte channel had no writer yet
    RetryLater,
    /// Byte channel closed after data flowed
    Reconnect,
}

enum Fill {
    Complete,
    Eof(usize),
    Interrupted,
}

pub(super) struct Worker {
    params: StreamParams,
    shared: Arc<BridgeShared>,
    end: WorkerEnd,
    source: Arc<dyn ChannelSource>,
    errors: Sender<LinkError>,
    reconnect_retry: Duration,
    channel: Option<Arc<ByteChannel>>,
    /// Source generation `channel` was taken at
    channel_generation: u64,
    data_flowed: bool,
    sync: RateSync,
}

impl Worker {
    pub(super) fn new(
        params: StreamParams,
        shared: Arc<BridgeShared>,
        end: WorkerEnd,
        source: Arc<dyn ChannelSource>,
        errors: Sender<LinkError>,
        reconnect_retry: Duration,
    ) -> Self {
        Self {
            sync: RateSync::new(params.rate),
            params,
            shared,
            end,
            source,
            errors,
            reconnect_retry,
            channel: None,
            channel_generation: 0,
            data_flowed: false,
        }
    }

    pub(super) fn spawn(self) -> io::Result<thread::JoinHandle<()>> {
        thread::Builder::new()
            .name(format!("bluelink-{}", self.params.direction))
            .spawn(move || self.run())
    }

    fn run(mut self) {
        log::info!(
            "Bridge: {} worker started ({}Hz {}ch, period {} / buffer {} frames)",
            self.params.direction,
            self.params.rate,
            self.params.channels,
            self.params.period_frames,
            self.params.buffer_frames
        );

        let mut parked = true;
        loop {
            if let Err(e) = self.shared.wake.take() {
                log::warn!("Bridge: failed to clear wake signal: {}", e);
            }
            if self.shared.stop_requested() {
                break;
            }

            if !self.shared.state().is_transferring() {
                parked = true;
                if let Err(e) = self.shared.wake.wait(None) {
                    self.fail(LinkError::Io(e));
                    break;
                }
                continue;
            }
            if parked {
                self.sync.reset();
                parked = false;
            }

            let Some(channel) = self.acquire_channel() else {
                self.wait_for_attach();
                continue;
            };

            let io_ptr = self.shared.positions().io_ptr;
            let frames = self.params.period_frames.min(self.params.buffer_frames - io_ptr);

            let step = match &mut self.end {
                WorkerEnd::Capture(producer) => capture_period(
                    producer,
                    &channel,
                    frames,
                    &self.params,
                    &self.shared,
                    &mut self.data_flowed,
                ),
                WorkerEnd::Playback(consumer) => {
                    playback_period(consumer, &channel, frames, &self.params, &self.shared)
                }
            };

            // End of stream on a channel the source already replaced is a
            // transport switch, not a failure
            let ended = matches!(
                step,
                Ok(Step::RetryLater | Step::Reconnect) | Err(LinkError::TransportLost)
            );
            if ended && self.is_replaced(&channel) {
                log::info!("Bridge: transport changed, switching byte channel");
                self.channel = None;
                continue;
            }

            match step {
                Ok(Step::Transferred(done)) => {
                    self.shared
                        .advance_hw(done, self.params.buffer_frames, self.params.boundary);
                    self.shared.notify_consumer();
                    if self.params.direction == StreamDirection::Playback {
                        if let Some(wait) = self.sync.advance(done) {
                            self.sleep(wait);
                        }
                    }
                }
                Ok(Step::Interrupted) => {}
                Ok(Step::XRun) => {
                    if self.shared.transition(BridgeState::Running, BridgeState::XRun)
                        || self.shared.transition(BridgeState::Draining, BridgeState::XRun)
                    {
                        let pos = self.shared.positions();
                        log::warn!(
                            "Bridge: {} xrun (hw_ptr {}, appl_ptr {})",
                            self.params.direction,
                            pos.hw_ptr,
                            pos.appl_ptr
                        );
                    }
                    self.shared.notify_consumer();
                }
                Ok(Step::Drained) => {
                    if self.shared.transition(BridgeState::Draining, BridgeState::Prepared) {
                        log::debug!("Bridge: drained");
                    }
                    self.shared.notify_consumer();
                }
                Ok(Step::RetryLater) => {
                    log::trace!("Bridge: byte channel not ready, retrying");
                    self.sleep(self.reconnect_retry);
                }
                Ok(Step::Reconnect) => {
                    log::info!("Bridge: byte channel closed, reconnecting");
                    self.channel = None;
                    self.source.reconnect(&channel);
                }
                Err(e) => self.fail(e),
            }
        }

        log::info!("Bridge: {} worker stopped", self.params.direction);
    }

    fn is_stale(&self) -> bool {
        self.source.generation() != self.channel_generation
    }

    /// Whether `channel` is no longer the one the source hands out
    ///
    /// Asks the source itself, which waits out a switch still in progress.
    fn is_replaced(&self, channel: &Arc<ByteChannel>) -> bool {
        self.is_stale()
            || !self
                .source
                .channel()
                .is_some_and(|current| Arc::ptr_eq(&current, channel))
    }

    /// Current byte channel, fetching a fresh one from the source if needed
    fn acquire_channel(&mut self) -> Option<Arc<ByteChannel>> {
        if self.channel.is_some() && self.is_stale() {
            log::info!("Bridge: transport changed, dropping old byte channel");
            self.channel = None;
        }
        if self.channel.is_none() {
            // Read before the channel so a concurrent switch shows up as stale
            self.channel_generation = self.source.generation();
            let channel = self.source.channel()?;
            if let Err(e) = channel.set_nonblocking(true) {
                log::warn!("Bridge: cannot make byte channel non-blocking: {}", e);
            }
            if self.params.direction == StreamDirection::Playback {
                channel.limit_buffering();
            }
            log::debug!("Bridge: using byte channel fd {}", channel.as_raw_fd());
            self.data_flowed = false;
            self.channel = Some(channel);
        }
        self.channel.clone()
    }

    /// Park until a transport is attached or the worker is woken
    fn wait_for_attach(&self) {
        let attach = self.source.attach_signal();
        match sys::wait_fd(attach.as_raw_fd(), libc::POLLIN, &self.shared.wake, None) {
            Ok(Readiness::Ready) => {
                let _ = attach.take();
            }
            Ok(_) => {}
            Err(e) => log::warn!("Bridge: waiting for attach failed: {}", e),
        }
    }

    /// Interruptible sleep
    fn sleep(&self, duration: Duration) {
        if let Err(e) = self.shared.wake.wait(Some(duration)) {
            log::warn!("Bridge: pacing wait failed: {}", e);
        }
    }

    fn fail(&mut self, error: LinkError) {
        log::error!("Bridge: {} stream failed: {}", self.params.direction, error);
        self.channel = None;
        self.shared.set_state(BridgeState::Terminated);
        if self.errors.try_send(error).is_err() {
            log::warn!("Bridge: error channel full, dropping error");
        }
        self.shared.notify_consumer();
    }
}

fn capture_period(
    producer: &mut Producer<u8>,
    channel: &ByteChannel,
    frames: usize,
    params: &StreamParams,
    shared: &BridgeShared,
    data_flowed: &mut bool,
) -> LinkResult<Step> {
    // No room for a whole period: the application fell behind
    let mut chunk = match producer.write_chunk(frames * params.frame_size) {
        Ok(chunk) => chunk,
        Err(ChunkError::TooFewSlots(_)) => return Ok(Step::XRun),
    };

    let (first, second) = chunk.as_mut_slices();
    let mut total = 0;
    for part in [first, second] {
        let len = part.len();
        match read_full(channel, part, shared, total)? {
            Fill::Complete => total += len,
            Fill::Eof(read) => {
                total += read;
                return Ok(if total == 0 && !*data_flowed {
                    Step::RetryLater
                } else {
                    Step::Reconnect
                });
            }
            Fill::Interrupted => return Ok(Step::Interrupted),
        }
    }

    chunk.commit_all();
    *data_flowed = true;
    Ok(Step::Transferred(frames))
}

fn playback_period(
    consumer: &mut Consumer<u8>,
    channel: &ByteChannel,
    frames: usize,
    params: &StreamParams,
    shared: &BridgeShared,
) -> LinkResult<Step> {
    let pos = shared.positions();
    let queued = distance(pos.hw_ptr, pos.appl_ptr, params.boundary);

    // Hardware pointer ahead of the application
    if queued > params.buffer_frames {
        return Ok(Step::XRun);
    }

    let frames = if shared.state() == BridgeState::Draining {
        if queued == 0 {
            return Ok(Step::Drained);
        }
        frames.min(queued)
    } else if queued < frames {
        return Ok(Step::XRun);
    } else {
        frames
    };

    let chunk = match consumer.read_chunk(frames * params.frame_size) {
        Ok(chunk) => chunk,
        Err(ChunkError::TooFewSlots(_)) => return Ok(Step::XRun),
    };

    let (first, second) = chunk.as_slices();
    for part in [first, second] {
        if !write_full(channel, part, shared)? {
            return Ok(Step::Interrupted);
        }
    }

    chunk.commit_all();
    Ok(Step::Transferred(frames))
}

/// Fill `buf` from the channel; `before` bytes of the period are already in
///
/// A stop request aborts the read. Leaving the transferring states aborts it
/// only while the period is still empty: once bytes were taken from the
/// channel the period is finished, so no frame is ever split.
fn read_full(
    channel: &ByteChannel,
    buf: &mut [u8],
    shared: &BridgeShared,
    before: usize,
) -> LinkResult<Fill> {
    let mut filled = 0;
    while filled < buf.len() {
        match channel.read(&mut buf[filled..]) {
            Ok(0) => return Ok(Fill::Eof(filled)),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                let ready = sys::wait_fd(channel.as_raw_fd(), libc::POLLIN, &shared.wake, None)
                    .map_err(LinkError::Io)?;
                if ready == Readiness::Woken {
                    let _ = shared.wake.take();
                    let idle = !shared.state().is_transferring() && before + filled == 0;
                    if shared.stop_requested() || idle {
                        return Ok(Fill::Interrupted);
                    }
                }
            }
            Err(e) => return Err(LinkError::Io(e)),
        }
    }
    Ok(Fill::Complete)
}

/// Write all of `buf` to the channel; false if a stop request cut it short
///
/// Pausing does not interrupt a write, so a period is never split.
fn write_full(channel: &ByteChannel, buf: &[u8], shared: &BridgeShared) -> LinkResult<bool> {
    let mut written = 0;
    while written < buf.len() {
        match channel.write(&buf[written..]) {
            Ok(0) => return Err(LinkError::TransportLost),
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                let ready = sys::wait_fd(channel.as_raw_fd(), libc::POLLOUT, &shared.wake, None)
                    .map_err(LinkError::Io)?;
                if ready == Readiness::Woken {
                    let _ = shared.wake.take();
                    if shared.stop_requested() {
                        return Ok(false);
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => return Err(LinkError::TransportLost),
            Err(e) => return Err(LinkError::Io(e)),
        }
    }
    Ok(true)
}

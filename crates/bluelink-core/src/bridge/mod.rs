//! Streaming bridge
//!
//! Pumps PCM frames between an application-side circular buffer and the
//! byte channel of the attached transport on a dedicated worker thread.
//!
//! # Pointers
//!
//! - `appl_ptr`: frames the application wrote (playback) or read (capture)
//! - `hw_ptr`: frames the worker moved through the byte channel
//! - `io_ptr`: the worker's offset inside the ring, `hw_ptr mod buffer`
//!
//! `hw_ptr` and `appl_ptr` wrap at the boundary, a multiple of the buffer
//! size, so their distance is well defined across wraps.
//!
//! # Threads
//!
//! The ring is an `rtrb` SPSC byte queue: the application owns one end, the
//! worker the other. Pointers and the state live in atomics. The worker
//! blocks only in `poll` with the wake eventfd in its set; the application
//! blocks on the notify eventfd, which is also exposed for external polling.

mod pacing;
mod params;
mod state;
mod worker;

pub use pacing::RateSync;
pub use params::{
    StreamParams, MAX_BUFFER_BYTES, MAX_PERIODS, MAX_PERIOD_BYTES, MIN_PERIODS, SAMPLE_BYTES,
};
pub use state::{BridgeState, Positions};

use crate::channel::ByteChannel;
use crate::error::{LinkError, LinkResult};
use crate::sys::EventFd;
use bluelink_proto::StreamDirection;
use flume::Sender;
use rtrb::{Consumer, Producer, RingBuffer};
use state::{distance, BridgeShared};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use worker::{Worker, WorkerEnd};

/// Where the worker gets its byte channel from
///
/// Implemented by the handle, which owns the attach machine.
pub trait ChannelSource: Send + Sync {
    /// Channel of the currently attached transport
    fn channel(&self) -> Option<Arc<ByteChannel>>;

    /// Changes whenever [`channel`](Self::channel) would return another channel
    ///
    /// Checked once per period, so it must not block.
    fn generation(&self) -> u64;

    /// Raised whenever a new channel becomes available
    fn attach_signal(&self) -> &EventFd;

    /// `dead` hit end of stream; look for a transport again if it is still
    /// the attached one
    fn reconnect(&self, dead: &Arc<ByteChannel>);
}

/// The application's end of the ring
enum AppEnd {
    Playback(Producer<u8>),
    Capture(Consumer<u8>),
}

pub struct StreamingBridge {
    params: StreamParams,
    shared: Arc<BridgeShared>,
    source: Arc<dyn ChannelSource>,
    errors: Sender<LinkError>,
    reconnect_retry: Duration,
    app: Option<AppEnd>,
    /// Worker end of a freshly prepared ring, until the worker is spawned
    pending: Option<WorkerEnd>,
    worker: Option<JoinHandle<()>>,
}

impl StreamingBridge {
    pub fn new(
        params: StreamParams,
        source: Arc<dyn ChannelSource>,
        errors: Sender<LinkError>,
        reconnect_retry: Duration,
    ) -> LinkResult<Self> {
        Ok(Self {
            params,
            shared: Arc::new(BridgeShared::new().map_err(LinkError::Io)?),
            source,
            errors,
            reconnect_retry,
            app: None,
            pending: None,
            worker: None,
        })
    }

    pub fn params(&self) -> &StreamParams {
        &self.params
    }

    pub fn state(&self) -> BridgeState {
        self.shared.state()
    }

    pub fn positions(&self) -> Positions {
        self.shared.positions()
    }

    fn is_playback(&self) -> bool {
        self.params.direction == StreamDirection::Playback
    }

    /// Stop any transfer and start over with an empty ring
    pub fn prepare(&mut self) -> LinkResult<()> {
        self.join_worker();

        let (producer, consumer) = RingBuffer::new(self.params.buffer_bytes());
        let (app, end) = if self.is_playback() {
            (AppEnd::Playback(producer), WorkerEnd::Playback(consumer))
        } else {
            (AppEnd::Capture(consumer), WorkerEnd::Capture(producer))
        };
        self.app = Some(app);
        self.pending = Some(end);

        self.shared.reset_positions();
        let _ = self.shared.notify.take();
        self.shared.set_state(BridgeState::Prepared);

        // The whole buffer is writable
        if self.is_playback() {
            self.shared.notify_consumer();
        }

        log::debug!(
            "Bridge: prepared {} stream, {} x {} frames",
            self.params.direction,
            self.params.buffer_frames / self.params.period_frames,
            self.params.period_frames
        );
        Ok(())
    }

    pub fn start(&mut self) -> LinkResult<()> {
        match self.state() {
            BridgeState::Prepared => self.launch(BridgeState::Running),
            BridgeState::Running => Ok(()),
            BridgeState::Idle => Err(LinkError::InvalidState("stream not prepared")),
            BridgeState::Paused | BridgeState::Draining => {
                Err(LinkError::InvalidState("stream paused or draining"))
            }
            BridgeState::XRun => Err(LinkError::XRun),
            BridgeState::Terminated => Err(LinkError::NoDevice),
        }
    }

    /// Enter a transferring state, spawning the worker on first use
    fn launch(&mut self, state: BridgeState) -> LinkResult<()> {
        self.shared.set_state(state);

        let Some(end) = self.pending.take() else {
            self.shared.wake_worker();
            return Ok(());
        };

        let worker = Worker::new(
            self.params,
            self.shared.clone(),
            end,
            self.source.clone(),
            self.errors.clone(),
            self.reconnect_retry,
        );
        match worker.spawn() {
            Ok(handle) => {
                self.worker = Some(handle);
                Ok(())
            }
            Err(e) => {
                log::error!("Bridge: failed to spawn worker: {}", e);
                self.app = None;
                self.shared.set_state(BridgeState::Idle);
                Err(LinkError::Io(e))
            }
        }
    }

    pub fn pause(&mut self, enable: bool) -> LinkResult<()> {
        let (from, to) = if enable {
            (BridgeState::Running, BridgeState::Paused)
        } else {
            (BridgeState::Paused, BridgeState::Running)
        };

        // Pollers must not sleep through a pause toggle
        self.shared.notify_consumer();

        if !self.shared.transition(from, to) {
            if self.state() == to {
                return Ok(());
            }
            return Err(LinkError::InvalidState(if enable {
                "stream not running"
            } else {
                "stream not paused"
            }));
        }

        log::debug!("Bridge: {}", if enable { "paused" } else { "resumed" });
        self.shared.wake_worker();
        Ok(())
    }

    /// Playback: block until everything queued has been sent, then `Prepared`
    ///
    /// Capture: stop transferring; frames already captured stay readable.
    pub fn drain(&mut self) -> LinkResult<()> {
        if !self.is_playback() {
            if self.shared.transition(BridgeState::Running, BridgeState::Prepared)
                || self.shared.transition(BridgeState::Paused, BridgeState::Prepared)
            {
                self.shared.wake_worker();
                self.shared.notify_consumer();
            }
            return self.check_usable();
        }

        if self.state() == BridgeState::Prepared {
            if self.queued_frames() == 0 {
                return Ok(());
            }
            log::debug!("Bridge: draining {} frames", self.queued_frames());
            self.launch(BridgeState::Draining)?;
        } else if self.shared.transition(BridgeState::Running, BridgeState::Draining)
            || self.shared.transition(BridgeState::Paused, BridgeState::Draining)
        {
            log::debug!("Bridge: draining {} frames", self.queued_frames());
            self.shared.wake_worker();
        }

        loop {
            match self.state() {
                BridgeState::Draining => self.wait_notify()?,
                BridgeState::Prepared => return Ok(()),
                BridgeState::XRun => return Err(LinkError::XRun),
                BridgeState::Terminated => return Err(LinkError::NoDevice),
                BridgeState::Idle | BridgeState::Running | BridgeState::Paused => {
                    return Err(LinkError::InvalidState("drain interrupted"))
                }
            }
        }
    }

    /// Stop the worker and release both ring ends
    pub fn stop(&mut self) {
        self.join_worker();
        self.app = None;
        self.pending = None;
        self.shared.set_state(BridgeState::Idle);
        self.shared.notify_consumer();
    }

    fn join_worker(&mut self) {
        if let Some(handle) = self.worker.take() {
            self.shared.set_stop(true);
            self.shared.wake_worker();
            log::debug!("Bridge: waiting for worker to stop...");
            if handle.join().is_err() {
                log::error!("Bridge: worker panicked");
            }
            self.shared.set_stop(false);
        }
    }

    /// Queue interleaved frames for playback; returns frames accepted
    ///
    /// Blocks while the ring is full, starting a prepared stream first.
    pub fn write(&mut self, data: &[u8]) -> LinkResult<usize> {
        let fs = self.params.frame_size;
        self.check_frames(data.len())?;

        loop {
            self.check_usable()?;
            if self.state() == BridgeState::Draining {
                return Err(LinkError::InvalidState("stream draining"));
            }

            let Some(AppEnd::Playback(producer)) = self.app.as_mut() else {
                return Err(LinkError::InvalidState("not a playback stream"));
            };

            let room = producer.slots() / fs * fs;
            if room > 0 || data.is_empty() {
                let bytes = room.min(data.len());
                let mut chunk = producer.write_chunk(bytes).map_err(|_| LinkError::XRun)?;
                let (first, second) = chunk.as_mut_slices();
                let split = first.len();
                first.copy_from_slice(&data[..split]);
                second.copy_from_slice(&data[split..bytes]);
                chunk.commit_all();

                self.shared.advance_appl(bytes / fs, self.params.boundary);
                return Ok(bytes / fs);
            }

            self.block()?;
        }
    }

    /// Take captured frames; returns frames read
    ///
    /// Blocks while the ring is empty, starting a prepared stream first.
    pub fn read(&mut self, data: &mut [u8]) -> LinkResult<usize> {
        let fs = self.params.frame_size;
        self.check_frames(data.len())?;

        loop {
            self.check_usable()?;

            let Some(AppEnd::Capture(consumer)) = self.app.as_mut() else {
                return Err(LinkError::InvalidState("not a capture stream"));
            };

            let ready = consumer.slots() / fs * fs;
            if ready > 0 || data.is_empty() {
                let bytes = ready.min(data.len());
                let chunk = consumer.read_chunk(bytes).map_err(|_| LinkError::XRun)?;
                let (first, second) = chunk.as_slices();
                data[..first.len()].copy_from_slice(first);
                data[first.len()..bytes].copy_from_slice(second);
                chunk.commit_all();

                self.shared.advance_appl(bytes / fs, self.params.boundary);
                return Ok(bytes / fs);
            }

            self.block()?;
        }
    }

    fn check_frames(&self, len: usize) -> LinkResult<()> {
        if len % self.params.frame_size != 0 {
            return Err(LinkError::InvalidParams(format!(
                "{} bytes is not a whole number of {}-byte frames",
                len, self.params.frame_size
            )));
        }
        Ok(())
    }

    fn check_usable(&self) -> LinkResult<()> {
        match self.state() {
            BridgeState::XRun => Err(LinkError::XRun),
            BridgeState::Terminated => Err(LinkError::NoDevice),
            BridgeState::Idle => Err(LinkError::InvalidState("stream not prepared")),
            _ => Ok(()),
        }
    }

    /// The transfer would block: start a prepared stream, or wait for the worker
    fn block(&mut self) -> LinkResult<()> {
        match self.state() {
            BridgeState::Prepared => self.start(),
            BridgeState::Paused => Err(LinkError::InvalidState("stream paused")),
            _ => self.wait_notify(),
        }
    }

    fn wait_notify(&self) -> LinkResult<()> {
        self.shared.notify.wait(None).map_err(LinkError::Io)?;
        self.shared.notify.take().map_err(LinkError::Io)?;
        Ok(())
    }

    /// Frames the application can transfer without blocking
    pub fn avail(&self) -> usize {
        if self.is_playback() {
            self.params.buffer_frames.saturating_sub(self.queued_frames())
        } else {
            self.queued_frames()
        }
    }

    /// Frames in the ring not yet consumed by the other side
    pub fn queued_frames(&self) -> usize {
        let pos = self.shared.positions();
        let queued = if self.is_playback() {
            distance(pos.hw_ptr, pos.appl_ptr, self.params.boundary)
        } else {
            distance(pos.appl_ptr, pos.hw_ptr, self.params.boundary)
        };
        queued.min(self.params.buffer_frames)
    }

    /// Worker position inside the ring
    pub fn pointer(&self) -> LinkResult<usize> {
        if self.source.channel().is_none() {
            return Err(LinkError::NoDevice);
        }
        Ok(self.shared.positions().io_ptr)
    }

    /// Readable whenever the stream made progress or changed state
    pub fn poll_descriptor(&self) -> RawFd {
        self.shared.notify.as_raw_fd()
    }

    /// Codec/link delay last reported by the daemon
    pub fn codec_delay(&self) -> usize {
        self.shared.codec_delay()
    }

    pub fn set_codec_delay(&self, frames: usize) {
        self.shared.set_codec_delay(frames);
    }
}

impl Drop for StreamingBridge {
    fn drop(&mut self) {
        self.join_worker();
    }
}

//! State shared between the application side and the streaming worker

use crate::sys::EventFd;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

/// Streaming bridge lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BridgeState {
    Idle = 0,
    Prepared = 1,
    Running = 2,
    Paused = 3,
    /// Playback finishing what the application queued
    Draining = 4,
    /// Over/underrun; needs `prepare`
    XRun = 5,
    /// Byte channel failed; the bridge is unusable
    Terminated = 6,
}

impl BridgeState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => BridgeState::Prepared,
            2 => BridgeState::Running,
            3 => BridgeState::Paused,
            4 => BridgeState::Draining,
            5 => BridgeState::XRun,
            6 => BridgeState::Terminated,
            _ => BridgeState::Idle,
        }
    }

    /// States in which the worker moves data
    pub fn is_transferring(self) -> bool {
        matches!(self, BridgeState::Running | BridgeState::Draining)
    }
}

/// Point-in-time copy of the stream pointers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Positions {
    /// Worker position inside the ring, wraps at the buffer size
    pub io_ptr: usize,
    /// Frames moved through the byte channel, wraps at the boundary
    pub hw_ptr: usize,
    /// Frames moved by the application, wraps at the boundary
    pub appl_ptr: usize,
}

/// Lock-free bridge state
///
/// Pointers are written by one side each (`io_ptr`/`hw_ptr` by the worker,
/// `appl_ptr` by the application) and read by anyone.
#[derive(Debug)]
pub struct BridgeShared {
    state: AtomicU8,
    io_ptr: AtomicUsize,
    hw_ptr: AtomicUsize,
    appl_ptr: AtomicUsize,
    /// Codec/link delay reported by the daemon, in frames
    codec_delay: AtomicUsize,
    /// Worker exit request
    stop: AtomicBool,
    /// Wakes the worker out of any blocking wait
    pub wake: EventFd,
    /// Raised after each transferred period and on every state change
    pub notify: EventFd,
}

impl BridgeShared {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            state: AtomicU8::new(BridgeState::Idle as u8),
            io_ptr: AtomicUsize::new(0),
            hw_ptr: AtomicUsize::new(0),
            appl_ptr: AtomicUsize::new(0),
            codec_delay: AtomicUsize::new(0),
            stop: AtomicBool::new(false),
            wake: EventFd::new()?,
            notify: EventFd::new()?,
        })
    }

    #[inline]
    pub fn state(&self) -> BridgeState {
        BridgeState::from_u8(self.state.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn set_state(&self, state: BridgeState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    /// Move from `from` to `to` unless another side changed the state first
    pub fn transition(&self, from: BridgeState, to: BridgeState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    #[inline]
    pub fn positions(&self) -> Positions {
        Positions {
            io_ptr: self.io_ptr.load(Ordering::Relaxed),
            hw_ptr: self.hw_ptr.load(Ordering::Relaxed),
            appl_ptr: self.appl_ptr.load(Ordering::Relaxed),
        }
    }

    /// Worker side: `frames` went through the byte channel
    pub fn advance_hw(&self, frames: usize, buffer_frames: usize, boundary: usize) {
        let io = self.io_ptr.load(Ordering::Relaxed);
        let hw = self.hw_ptr.load(Ordering::Relaxed);
        self.io_ptr.store((io + frames) % buffer_frames, Ordering::Relaxed);
        self.hw_ptr.store((hw + frames) % boundary, Ordering::Relaxed);
    }

    /// Application side: `frames` went through the ring
    pub fn advance_appl(&self, frames: usize, boundary: usize) {
        let appl = self.appl_ptr.load(Ordering::Relaxed);
        self.appl_ptr.store((appl + frames) % boundary, Ordering::Relaxed);
    }

    #[cfg(test)]
    pub(crate) fn set_hw_ptr(&self, frames: usize) {
        self.hw_ptr.store(frames, Ordering::Relaxed);
    }

    pub fn reset_positions(&self) {
        self.io_ptr.store(0, Ordering::Relaxed);
        self.hw_ptr.store(0, Ordering::Relaxed);
        self.appl_ptr.store(0, Ordering::Relaxed);
        self.codec_delay.store(0, Ordering::Relaxed);
    }

    #[inline]
    pub fn codec_delay(&self) -> usize {
        self.codec_delay.load(Ordering::Relaxed)
    }

    pub fn set_codec_delay(&self, frames: usize) {
        self.codec_delay.store(frames, Ordering::Relaxed);
    }

    #[inline]
    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    pub fn set_stop(&self, stop: bool) {
        self.stop.store(stop, Ordering::Relaxed);
    }

    /// Kick the worker out of whatever it is waiting on
    pub fn wake_worker(&self) {
        if let Err(e) = self.wake.signal(1) {
            log::warn!("Bridge: failed to wake worker: {}", e);
        }
    }

    /// Tell a polling consumer that something changed
    pub fn notify_consumer(&self) {
        if let Err(e) = self.notify.signal(1) {
            log::warn!("Bridge: failed to notify consumer: {}", e);
        }
    }
}

/// Frames between two pointers that wrap at `boundary`
#[inline]
pub fn distance(from: usize, to: usize, boundary: usize) -> usize {
    (to + boundary - from) % boundary
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        let shared = BridgeShared::new().unwrap();
        assert_eq!(shared.state(), BridgeState::Idle);

        shared.set_state(BridgeState::Running);
        assert!(shared.transition(BridgeState::Running, BridgeState::XRun));
        assert!(!shared.transition(BridgeState::Running, BridgeState::Prepared));
        assert_eq!(shared.state(), BridgeState::XRun);
        assert!(!shared.state().is_transferring());
    }

    #[test]
    fn test_pointer_wrapping() {
        let shared = BridgeShared::new().unwrap();
        for _ in 0..5 {
            shared.advance_hw(100, 400, 800);
        }
        let pos = shared.positions();
        assert_eq!(pos.io_ptr, 100);
        assert_eq!(pos.hw_ptr, 500);

        for _ in 0..9 {
            shared.advance_appl(100, 800);
        }
        assert_eq!(shared.positions().appl_ptr, 100);

        shared.reset_positions();
        assert_eq!(shared.positions(), Positions::default());
    }

    #[test]
    fn test_distance() {
        assert_eq!(distance(100, 300, 800), 200);
        assert_eq!(distance(700, 100, 800), 200);
        assert_eq!(distance(300, 300, 800), 0);
        // application behind hardware
        assert_eq!(distance(200, 100, 800), 700);
    }
}

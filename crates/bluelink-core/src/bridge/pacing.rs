//! Sample-rate pacing for playback
//!
//! Writing into the byte channel never blocks for long (the daemon drains
//! it quickly), so the worker sleeps between periods to keep its output at
//! the nominal rate.

use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct RateSync {
    rate: u32,
    started: Instant,
    frames: u64,
}

impl RateSync {
    pub fn new(rate: u32) -> Self {
        Self {
            rate,
            started: Instant::now(),
            frames: 0,
        }
    }

    /// Restart the clock, e.g. after the stream was parked
    pub fn reset(&mut self) {
        self.started = Instant::now();
        self.frames = 0;
    }

    /// Account for `frames` just transferred
    ///
    /// Returns how long to wait until they are due at the nominal rate, or
    /// `None` when the stream is already behind.
    pub fn advance(&mut self, frames: usize) -> Option<Duration> {
        self.frames += frames as u64;
        let nanos = u128::from(self.frames) * 1_000_000_000 / u128::from(self.rate.max(1));
        let due = Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX));
        due.checked_sub(self.started.elapsed())
            .filter(|wait| !wait.is_zero())
    }

    /// Frames accounted since the last reset
    pub fn frames(&self) -> u64 {
        self.frames
    }
}

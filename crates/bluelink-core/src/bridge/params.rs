//! Stream geometry and its hardware constraints

use crate::config::StreamConfig;
use crate::error::{LinkError, LinkResult};
use bluelink_proto::{StreamDirection, TransportInfo};

/// Bytes per sample; transports carry signed 16-bit little-endian PCM
pub const SAMPLE_BYTES: usize = 2;

pub const MIN_PERIODS: usize = 2;
pub const MAX_PERIODS: usize = 1024;
/// Largest period in bytes
pub const MAX_PERIOD_BYTES: usize = 16 * 1024;
/// Largest ring buffer in bytes
pub const MAX_BUFFER_BYTES: usize = 16 * 1024 * 1024;

/// Hardware positions wrap below this limit
const BOUNDARY_LIMIT: usize = u32::MAX as usize;

/// Validated stream parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamParams {
    /// Playback or capture
    pub direction: StreamDirection,
    pub rate: u32,
    pub channels: u8,
    /// Bytes per frame
    pub frame_size: usize,
    pub period_frames: usize,
    pub buffer_frames: usize,
    /// Wrap point of the hardware and application pointers
    pub boundary: usize,
}

impl StreamParams {
    /// Build parameters for `buffer_frames / period_frames` periods
    ///
    /// Periods must be at least 10 ms, buffers at least 200 ms.
    pub fn new(
        direction: StreamDirection,
        rate: u32,
        channels: u8,
        period_frames: usize,
        buffer_frames: usize,
    ) -> LinkResult<Self> {
        let invalid = |msg: String| Err(LinkError::InvalidParams(msg));

        if direction == StreamDirection::Duplex {
            return invalid("a stream is either playback or capture".to_string());
        }
        if rate == 0 || channels == 0 {
            return invalid(format!("format {}Hz/{}ch", rate, channels));
        }
        if period_frames == 0 || buffer_frames % period_frames != 0 {
            return invalid(format!(
                "buffer of {} frames is not a whole number of {}-frame periods",
                buffer_frames, period_frames
            ));
        }

        let periods = buffer_frames / period_frames;
        if !(MIN_PERIODS..=MAX_PERIODS).contains(&periods) {
            return invalid(format!(
                "{} periods outside {}..={}",
                periods, MIN_PERIODS, MAX_PERIODS
            ));
        }

        let frame_size = channels as usize * SAMPLE_BYTES;
        let bytes_per_sec = rate as usize * frame_size;

        let period_bytes = period_frames * frame_size;
        if period_bytes < bytes_per_sec / 100 || period_bytes > MAX_PERIOD_BYTES {
            return invalid(format!(
                "period of {} bytes outside {}..={}",
                period_bytes,
                bytes_per_sec / 100,
                MAX_PERIOD_BYTES
            ));
        }

        let buffer_bytes = buffer_frames * frame_size;
        if buffer_bytes < bytes_per_sec / 5 || buffer_bytes > MAX_BUFFER_BYTES {
            return invalid(format!(
                "buffer of {} bytes outside {}..={}",
                buffer_bytes,
                bytes_per_sec / 5,
                MAX_BUFFER_BYTES
            ));
        }

        let mut boundary = buffer_frames;
        while boundary <= BOUNDARY_LIMIT / 2 {
            boundary *= 2;
        }

        Ok(Self {
            direction,
            rate,
            channels,
            frame_size,
            period_frames,
            buffer_frames,
            boundary,
        })
    }

    /// Parameters for streaming `direction` over an opened transport
    pub fn for_transport(
        transport: &TransportInfo,
        direction: StreamDirection,
        config: &StreamConfig,
    ) -> LinkResult<Self> {
        let (period, buffer) = config.frames_for(transport.sample_rate);
        Self::new(
            direction,
            transport.sample_rate,
            transport.channels,
            period,
            buffer,
        )
    }

    /// Override the pointer wrap point; must be a multiple of the buffer size
    pub fn with_boundary(mut self, boundary: usize) -> LinkResult<Self> {
        if boundary < self.buffer_frames || boundary % self.buffer_frames != 0 {
            return Err(LinkError::InvalidParams(format!(
                "boundary {} is not a multiple of the {}-frame buffer",
                boundary, self.buffer_frames
            )));
        }
        self.boundary = boundary;
        Ok(self)
    }

    pub fn period_bytes(&self) -> usize {
        self.period_frames * self.frame_size
    }

    pub fn buffer_bytes(&self) -> usize {
        self.buffer_frames * self.frame_size
    }
}

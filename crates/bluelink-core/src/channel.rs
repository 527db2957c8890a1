//! Byte channel of an opened transport
//!
//! The daemon hands out one descriptor per opened transport (a FIFO or a
//! socket). PCM bytes flow through it in the transport's direction.

use crate::sys;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

/// Pipe buffer size requested for playback channels
pub const PLAYBACK_PIPE_SIZE: usize = 2048;

/// Owned PCM byte channel; the descriptor is closed when the channel drops
#[derive(Debug)]
pub struct ByteChannel {
    file: File,
}

impl ByteChannel {
    pub fn from_fd(fd: OwnedFd) -> Self {
        Self {
            file: File::from(fd),
        }
    }

    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.file).read(buf)
    }

    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        (&self.file).write(buf)
    }

    /// Bytes written by the peer and not yet consumed
    pub fn bytes_queued(&self) -> io::Result<usize> {
        sys::bytes_queued(self.as_raw_fd())
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        sys::set_nonblocking(self.as_raw_fd(), nonblocking)
    }

    /// Cut the channel off for every holder of this descriptor
    ///
    /// Sockets are shut down, so a worker still holding a clone reads EOF.
    /// Pipes end once the daemon closes its side.
    pub fn revoke(&self) {
        if let Err(e) = sys::shutdown_socket(self.as_raw_fd()) {
            log::debug!("ByteChannel: shutdown of fd {} skipped: {}", self.as_raw_fd(), e);
        }
    }

    /// Shrink the pipe buffer to bound playback latency
    ///
    /// Channels that are not pipes keep their buffering.
    pub fn limit_buffering(&self) {
        match sys::set_pipe_size(self.as_raw_fd(), PLAYBACK_PIPE_SIZE) {
            Ok(size) => log::debug!("ByteChannel: pipe buffer set to {} bytes", size),
            Err(e) => log::debug!("ByteChannel: pipe buffer left unchanged: {}", e),
        }
    }
}

impl AsRawFd for ByteChannel {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl AsFd for ByteChannel {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

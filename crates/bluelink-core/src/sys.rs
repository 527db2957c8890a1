//! Thin wrappers over the Linux primitives the client relies on
//!
//! eventfd signals, `poll(2)` with a wake descriptor, `SCM_RIGHTS` descriptor
//! passing and a few `ioctl`/`fcntl` helpers for byte channels.

use std::io;
use std::mem;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::time::Duration;

/// Non-blocking eventfd used as a level-triggered wake/notify signal
#[derive(Debug)]
pub struct EventFd(OwnedFd);

impl EventFd {
    pub fn new() -> io::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self(unsafe { OwnedFd::from_raw_fd(fd) }))
    }

    /// Add `value` to the counter, making the descriptor readable
    pub fn signal(&self, value: u64) -> io::Result<()> {
        let buf = value.to_ne_bytes();
        let ret = unsafe { libc::write(self.0.as_raw_fd(), buf.as_ptr().cast(), buf.len()) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // Counter saturated: the descriptor is readable anyway
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }

    /// Read and reset the counter; 0 if it was not signalled
    pub fn take(&self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        let ret = unsafe { libc::read(self.0.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(0);
            }
            return Err(err);
        }
        Ok(u64::from_ne_bytes(buf))
    }

    /// Block until the counter is non-zero (or the timeout elapses)
    ///
    /// Returns true if signalled. The counter is left untouched.
    pub fn wait(&self, timeout: Option<Duration>) -> io::Result<bool> {
        let mut fds = [pollfd(self.0.as_raw_fd(), libc::POLLIN)];
        Ok(poll(&mut fds, timeout)? > 0)
    }
}

impl AsRawFd for EventFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

impl AsFd for EventFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

pub fn pollfd(fd: RawFd, events: libc::c_short) -> libc::pollfd {
    libc::pollfd {
        fd,
        events,
        revents: 0,
    }
}

/// `poll(2)`, restarted on `EINTR`; `None` waits forever
pub fn poll(fds: &mut [libc::pollfd], timeout: Option<Duration>) -> io::Result<usize> {
    let timeout_ms = match timeout {
        Some(t) => t.as_millis().min(libc::c_int::MAX as u128) as libc::c_int,
        None => -1,
    };
    loop {
        let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if ret >= 0 {
            return Ok(ret as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Outcome of waiting on a descriptor together with a wake signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// The descriptor is ready (or hung up / in error, the next I/O call will tell)
    Ready,
    /// The wake signal fired first
    Woken,
    TimedOut,
}

/// Wait for `events` on `fd`, or for `wake` to become readable
///
/// A pending wake takes priority over descriptor readiness.
pub fn wait_fd(
    fd: RawFd,
    events: libc::c_short,
    wake: &EventFd,
    timeout: Option<Duration>,
) -> io::Result<Readiness> {
    let mut fds = [pollfd(fd, events), pollfd(wake.as_raw_fd(), libc::POLLIN)];
    if poll(&mut fds, timeout)? == 0 {
        return Ok(Readiness::TimedOut);
    }
    if fds[1].revents != 0 {
        return Ok(Readiness::Woken);
    }
    Ok(Readiness::Ready)
}

const FD_SIZE: libc::c_uint = mem::size_of::<RawFd>() as libc::c_uint;

/// Send `data`, attaching `fd` as `SCM_RIGHTS` ancillary data
pub fn send_with_fd(
    sock: &impl AsRawFd,
    data: &[u8],
    fd: Option<BorrowedFd<'_>>,
) -> io::Result<usize> {
    let mut iov = libc::iovec {
        iov_base: data.as_ptr() as *mut libc::c_void,
        iov_len: data.len(),
    };
    // u64 storage keeps the control buffer aligned for cmsghdr
    let mut control = [0u64; 8];

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;

    if let Some(fd) = fd {
        msg.msg_control = control.as_mut_ptr().cast();
        msg.msg_controllen = unsafe { libc::CMSG_SPACE(FD_SIZE) } as _;
        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(FD_SIZE) as _;
            ptr::write_unaligned(libc::CMSG_DATA(cmsg).cast::<RawFd>(), fd.as_raw_fd());
        }
    }

    let ret = unsafe { libc::sendmsg(sock.as_raw_fd(), &msg, libc::MSG_NOSIGNAL) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ret as usize)
}

/// Receive into `buf`, collecting a descriptor passed as `SCM_RIGHTS`
///
/// Received descriptors are close-on-exec.
pub fn recv_with_fd(sock: &impl AsRawFd, buf: &mut [u8]) -> io::Result<(usize, Option<OwnedFd>)> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: buf.len(),
    };
    let mut control = [0u64; 8];

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr().cast();
    msg.msg_controllen = mem::size_of_val(&control) as _;

    let ret = loop {
        let ret = unsafe { libc::recvmsg(sock.as_raw_fd(), &mut msg, libc::MSG_CMSG_CLOEXEC) };
        if ret >= 0 {
            break ret as usize;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    };

    let mut received = None;
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let raw = ptr::read_unaligned(libc::CMSG_DATA(cmsg).cast::<RawFd>());
                received = Some(OwnedFd::from_raw_fd(raw));
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    Ok((ret, received))
}

/// Bytes waiting to be read on a pipe or socket (`FIONREAD`)
pub fn bytes_queued(fd: RawFd) -> io::Result<usize> {
    let mut queued: libc::c_int = 0;
    let ret = unsafe { libc::ioctl(fd, libc::FIONREAD, &mut queued) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(queued.max(0) as usize)
}

pub fn set_nonblocking(fd: RawFd, nonblocking: bool) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let flags = if nonblocking {
        flags | libc::O_NONBLOCK
    } else {
        flags & !libc::O_NONBLOCK
    };
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Shut a socket down in both directions (`shutdown(2)`)
///
/// Every duplicate of the descriptor sees EOF/`EPIPE` afterwards. Fails with
/// `ENOTSOCK` on pipes.
pub fn shutdown_socket(fd: RawFd) -> io::Result<()> {
    if unsafe { libc::shutdown(fd, libc::SHUT_RDWR) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Resize a pipe buffer (`F_SETPIPE_SZ`); fails with `EBADF`/`EINVAL` on non-pipes
pub fn set_pipe_size(fd: RawFd, size: usize) -> io::Result<usize> {
    let ret = unsafe { libc::fcntl(fd, libc::F_SETPIPE_SZ, size as libc::c_int) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ret as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_eventfd_signal_and_take() {
        let efd = EventFd::new().unwrap();
        assert_eq!(efd.take().unwrap(), 0);
        assert!(!efd.wait(Some(Duration::from_millis(1))).unwrap());

        efd.signal(1).unwrap();
        efd.signal(2).unwrap();
        assert!(efd.wait(Some(Duration::ZERO)).unwrap());
        assert_eq!(efd.take().unwrap(), 3);
        assert_eq!(efd.take().unwrap(), 0);
    }

    #[test]
    fn test_wait_fd_prefers_wake() {
        let (a, mut b) = UnixStream::pair().unwrap();
        let wake = EventFd::new().unwrap();

        assert_eq!(
            wait_fd(a.as_raw_fd(), libc::POLLIN, &wake, Some(Duration::from_millis(1))).unwrap(),
            Readiness::TimedOut
        );

        b.write_all(b"x").unwrap();
        assert_eq!(
            wait_fd(a.as_raw_fd(), libc::POLLIN, &wake, None).unwrap(),
            Readiness::Ready
        );

        wake.signal(1).unwrap();
        assert_eq!(
            wait_fd(a.as_raw_fd(), libc::POLLIN, &wake, None).unwrap(),
            Readiness::Woken
        );
    }

    #[test]
    fn test_descriptor_passing() {
        let (tx, rx) = UnixStream::pair().unwrap();
        let (mut ours, theirs) = UnixStream::pair().unwrap();

        let sent = send_with_fd(&tx, b"hdr", Some(theirs.as_fd())).unwrap();
        assert_eq!(sent, 3);
        drop(theirs);

        let mut buf = [0u8; 8];
        let (n, fd) = recv_with_fd(&rx, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hdr");

        // The passed descriptor is the peer of `ours`
        let mut passed = UnixStream::from(fd.unwrap());
        ours.write_all(b"ping").unwrap();
        let mut got = [0u8; 4];
        passed.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"ping");
        assert_eq!(bytes_queued(passed.as_raw_fd()).unwrap(), 0);

        // Plain data carries no descriptor
        send_with_fd(&tx, b"x", None).unwrap();
        let (n, fd) = recv_with_fd(&rx, &mut buf).unwrap();
        assert_eq!(n, 1);
        assert!(fd.is_none());
    }

    #[test]
    fn test_bytes_queued_and_nonblocking() {
        let (mut a, b) = UnixStream::pair().unwrap();
        a.write_all(&[0u8; 12]).unwrap();
        assert_eq!(bytes_queued(b.as_raw_fd()).unwrap(), 12);

        set_nonblocking(b.as_raw_fd(), true).unwrap();
        let mut buf = [0u8; 32];
        assert_eq!((&b).read(&mut buf).unwrap(), 12);
        let err = (&b).read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

        // Sockets are not pipes
        assert!(set_pipe_size(b.as_raw_fd(), 2048).is_err());
    }

    #[test]
    fn test_shutdown_socket() {
        let (a, mut b) = UnixStream::pair().unwrap();
        let dup = a.try_clone().unwrap();
        shutdown_socket(a.as_raw_fd()).unwrap();

        // Both the duplicate and the peer see the connection end
        let mut buf = [0u8; 4];
        assert_eq!((&dup).read(&mut buf).unwrap(), 0);
        assert_eq!(b.read(&mut buf).unwrap(), 0);

        let mut fds = [0 as libc::c_int; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (r, _w) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        assert!(shutdown_socket(r.as_raw_fd()).is_err());
    }
}

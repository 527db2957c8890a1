//! Event subscriber
//!
//! A second connection to the daemon that, once subscribed, carries nothing
//! but fixed-size event records.

use crate::error::{LinkError, LinkResult};
use crate::sys;
use bluelink_proto::{
    EventMask, EventRecord, ProtocolError, Request, ResponseHeader, EVENT_RECORD_SIZE,
    RESPONSE_HEADER_SIZE,
};
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::path::Path;

/// A transport notification received from the daemon
pub type Event = EventRecord;

/// Reader side of the daemon's event channel
pub struct EventSubscriber {
    stream: UnixStream,
    subscribed: bool,
    finished: bool,
}

/// Cancels a blocked [`EventSubscriber::next_event`] from another thread
#[derive(Debug)]
pub struct ShutdownHandle(UnixStream);

impl ShutdownHandle {
    /// Make any in-progress or future wait on the channel return `Connection`
    pub fn shutdown(&self) {
        if let Err(e) = self.0.shutdown(Shutdown::Both) {
            // Already disconnected
            log::debug!("EventSubscriber: shutdown: {}", e);
        }
    }
}

impl EventSubscriber {
    pub fn connect(path: &Path) -> LinkResult<Self> {
        log::debug!("EventSubscriber: connecting to {:?}", path);
        let stream = UnixStream::connect(path).map_err(LinkError::Connection)?;
        Ok(Self::from_stream(stream))
    }

    pub fn from_stream(stream: UnixStream) -> Self {
        Self {
            stream,
            subscribed: false,
            finished: false,
        }
    }

    /// Ask the daemon for events of the kinds in `mask`
    pub fn subscribe(&mut self, mask: EventMask) -> LinkResult<()> {
        self.stream
            .write_all(&Request::Subscribe(mask).encode())
            .map_err(LinkError::Connection)?;

        let mut buf = [0u8; RESPONSE_HEADER_SIZE];
        self.read_record(&mut buf)?;
        let header = ResponseHeader::decode(&buf)?;

        // Anything after the header would be parsed as events
        if header.payload_len != 0 {
            let len = header.payload_len as usize;
            return Err(ProtocolError::PayloadLength { len }.into());
        }

        LinkError::check_status(header.status)?;
        log::debug!("EventSubscriber: subscribed to {}", mask);
        self.subscribed = true;
        Ok(())
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed
    }

    /// Block until the next event arrives
    pub fn next_event(&mut self) -> LinkResult<Event> {
        if !self.subscribed {
            return Err(LinkError::InvalidState("event channel not subscribed"));
        }

        let mut fds = [sys::pollfd(self.stream.as_raw_fd(), libc::POLLIN)];
        sys::poll(&mut fds, None).map_err(LinkError::Connection)?;

        let mut buf = [0u8; EVENT_RECORD_SIZE];
        self.read_record(&mut buf)?;
        let event = EventRecord::decode(&buf)?;
        log::trace!("EventSubscriber: {} {}", event.mask, event.transport);
        Ok(event)
    }

    /// A handle that can cancel waits on this channel from another thread
    pub fn shutdown_handle(&self) -> LinkResult<ShutdownHandle> {
        Ok(ShutdownHandle(self.stream.try_clone().map_err(LinkError::Io)?))
    }

    /// Read exactly `buf.len()` bytes
    ///
    /// EOF before the first byte is a closed channel, EOF inside the record
    /// is a truncated record.
    fn read_record(&mut self, buf: &mut [u8]) -> LinkResult<()> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.stream.read(&mut buf[filled..]) {
                Ok(0) if filled == 0 => return Err(LinkError::closed("event channel")),
                Ok(0) => {
                    return Err(ProtocolError::Truncated {
                        expected: buf.len(),
                        actual: filled,
                    }
                    .into())
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(LinkError::Connection(e)),
            }
        }
        Ok(())
    }
}

/// Yields events until the first error; the error itself is the last item
impl Iterator for EventSubscriber {
    type Item = LinkResult<Event>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.next_event() {
            Ok(event) => Some(Ok(event)),
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{capture_transport, FakeEventFeed};
    use bluelink_proto::{EventKind, Status};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_subscribe_then_receive() {
        let (mut feed, mut events) = FakeEventFeed::new();
        events.subscribe(EventMask::TRANSPORTS).unwrap();
        assert_eq!(feed.expect_subscribe(), EventMask::TRANSPORTS);

        feed.send(EventRecord::new(EventKind::TransportAdded, capture_transport()));
        let event = events.next_event().unwrap();
        assert!(event.mask.contains(EventKind::TransportAdded));
        assert_eq!(event.transport, capture_transport());
    }

    #[test]
    fn test_next_event_requires_subscription() {
        let (_feed, mut events) = FakeEventFeed::new();
        assert!(matches!(
            events.next_event(),
            Err(LinkError::InvalidState(_))
        ));
    }

    #[test]
    fn test_subscribe_rejected() {
        let (_feed, mut events) = FakeEventFeed::with_status(Status::NotSupported);
        assert!(matches!(
            events.subscribe(EventMask::TRANSPORTS),
            Err(LinkError::Rejected(Status::NotSupported))
        ));
        assert!(!events.is_subscribed());
    }

    #[test]
    fn test_subscribe_rejects_payload() {
        let (client, server) = UnixStream::pair().unwrap();
        let header = ResponseHeader::new(Status::Ok, 1 << 30).encode();
        (&server).write_all(&header).unwrap();

        let mut events = EventSubscriber::from_stream(client);
        assert!(matches!(
            events.subscribe(EventMask::TRANSPORTS),
            Err(LinkError::Protocol(ProtocolError::PayloadLength { len })) if len == 1 << 30
        ));
        assert!(!events.is_subscribed());
    }

    #[test]
    fn test_eof_at_boundary_and_inside_record() {
        let (mut feed, mut events) = FakeEventFeed::new();
        events.subscribe(EventMask::TRANSPORTS).unwrap();

        let record = EventRecord::new(EventKind::TransportChanged, capture_transport()).encode();
        feed.send_raw(&record[..7]);
        feed.close();
        assert!(matches!(
            events.next_event(),
            Err(LinkError::Protocol(_))
        ));

        let (feed, mut events) = FakeEventFeed::new();
        events.subscribe(EventMask::TRANSPORTS).unwrap();
        feed.close();
        assert!(matches!(
            events.next_event(),
            Err(LinkError::Connection(_))
        ));
    }

    #[test]
    fn test_malformed_event() {
        let (mut feed, mut events) = FakeEventFeed::new();
        events.subscribe(EventMask::TRANSPORTS).unwrap();

        let mut raw = EventRecord::new(EventKind::TransportAdded, capture_transport()).encode();
        raw[0] = 0xE0;
        feed.send_raw(&raw);
        assert!(matches!(
            events.next_event(),
            Err(LinkError::Protocol(ProtocolError::UnknownEventBits(_)))
        ));
    }

    #[test]
    fn test_shutdown_cancels_wait() {
        let (_feed, mut events) = FakeEventFeed::new();
        events.subscribe(EventMask::TRANSPORTS).unwrap();
        let cancel = events.shutdown_handle().unwrap();

        let waiter = thread::spawn(move || events.next_event());
        thread::sleep(Duration::from_millis(20));
        cancel.shutdown();

        let result = waiter.join().unwrap();
        assert!(matches!(result, Err(LinkError::Connection(_))));
    }

    #[test]
    fn test_iterator_stops_after_error() {
        let (mut feed, mut events) = FakeEventFeed::new();
        events.subscribe(EventMask::TRANSPORTS).unwrap();

        feed.send(EventRecord::new(EventKind::TransportAdded, capture_transport()));
        feed.send(EventRecord::new(EventKind::TransportRemoved, capture_transport()));
        feed.close();

        let items: Vec<_> = events.by_ref().collect();
        assert_eq!(items.len(), 3);
        assert!(items[0].is_ok());
        assert!(items[1].is_ok());
        assert!(items[2].is_err());
        assert!(events.next().is_none());
    }
}

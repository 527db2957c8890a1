//! Device attach state machine
//!
//! Keeps at most one transport open: the first transport in registry order
//! that matches the device filter. Re-evaluated whenever the caller changes
//! the filter or the daemon reports a transport change.

use crate::channel::ByteChannel;
use crate::error::LinkResult;
use crate::events::Event;
use crate::registry::TransportRegistry;
use bluelink_proto::{BluetoothAddress, EventKind, Profile, StreamDirection, TransportInfo};
use std::fmt;
use std::sync::Arc;

/// Which transports the client wants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceFilter {
    /// [`BluetoothAddress::ANY`] accepts every device
    pub address: BluetoothAddress,
    pub profile: Profile,
    /// Direction the client streams in
    pub direction: StreamDirection,
}

impl DeviceFilter {
    pub fn new(address: BluetoothAddress, profile: Profile, direction: StreamDirection) -> Self {
        Self {
            address,
            profile,
            direction,
        }
    }

    /// Candidate test, applied to each transport's own address
    pub fn matches(&self, transport: &TransportInfo) -> bool {
        self.address.matches(&transport.address)
            && self.profile == transport.profile
            && transport.direction.accepts(self.direction)
    }
}

impl fmt::Display for DeviceFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.address.is_any() {
            write!(f, "any {} {}", self.profile, self.direction)
        } else {
            write!(f, "{} {} {}", self.address, self.profile, self.direction)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachState {
    Unattached,
    Attached,
}

/// What an attach step changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachOutcome {
    Unchanged,
    /// A transport was opened; consumers should pick up the new channel
    Attached(TransportInfo),
    Detached,
}

/// An opened transport and its byte channel, always updated together
#[derive(Debug, Clone)]
pub struct OpenTransport {
    pub info: TransportInfo,
    pub channel: Arc<ByteChannel>,
}

impl OpenTransport {
    /// Whether a listed transport is the one this was opened from
    fn is_listed_as(&self, listed: &TransportInfo) -> bool {
        listed.address == self.info.address
            && listed.profile == self.info.profile
            && listed.direction.accepts(self.info.direction)
    }
}

#[derive(Debug, Default)]
pub struct AttachMachine {
    filter: Option<DeviceFilter>,
    open: Option<OpenTransport>,
    /// Bumped every time the open transport is replaced or released
    generation: u64,
}

impl AttachMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> AttachState {
        if self.open.is_some() {
            AttachState::Attached
        } else {
            AttachState::Unattached
        }
    }

    pub fn filter(&self) -> Option<DeviceFilter> {
        self.filter
    }

    pub fn transport(&self) -> Option<TransportInfo> {
        self.open.as_ref().map(|open| open.info)
    }

    pub fn channel(&self) -> Option<Arc<ByteChannel>> {
        self.open.as_ref().map(|open| open.channel.clone())
    }

    /// Changes whenever the channel returned by [`channel`](Self::channel) does
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Replace the device filter and attach to the best match right away
    ///
    /// Any open transport is closed first, so a failed evaluation leaves the
    /// machine unattached.
    pub fn set_device(
        &mut self,
        registry: &mut dyn TransportRegistry,
        filter: Option<DeviceFilter>,
    ) -> LinkResult<AttachOutcome> {
        let was_attached = self.open.is_some();
        if let Err(e) = self.detach(registry) {
            log::warn!("Attach: closing previous transport failed: {}", e);
        }

        self.filter = filter;
        match filter {
            Some(f) => log::info!("Attach: device filter set to {}", f),
            None => log::info!("Attach: device filter cleared"),
        }

        let outcome = self.evaluate(registry)?;
        if outcome == AttachOutcome::Unchanged && was_attached {
            return Ok(AttachOutcome::Detached);
        }
        Ok(outcome)
    }

    /// Compare the registry against the filter and attach/detach accordingly
    pub fn evaluate(&mut self, registry: &mut dyn TransportRegistry) -> LinkResult<AttachOutcome> {
        let Some(filter) = self.filter else {
            log::debug!("Attach: no device filter, nothing to evaluate");
            return Ok(AttachOutcome::Unchanged);
        };

        let transports = registry.list_transports()?;
        let mut candidates = transports.iter().filter(|t| filter.matches(t)).peekable();

        let Some(first) = candidates.peek().copied() else {
            if self.open.is_some() {
                log::info!("Attach: no transport matches {}, detaching", filter);
                return self.detach(registry);
            }
            log::debug!("Attach: no transport matches {}", filter);
            return Ok(AttachOutcome::Unchanged);
        };

        if let Some(open) = &self.open {
            if candidates.any(|c| open.is_listed_as(c)) {
                return Ok(AttachOutcome::Unchanged);
            }
            log::info!("Attach: {} is no longer available", open.info);
            if let Err(e) = self.detach(registry) {
                log::warn!("Attach: closing stale transport failed: {}", e);
            }
        }

        let mut info = *first;
        let channel = registry.open_transport(&mut info, filter.direction)?;
        log::info!("Attach: attached to {}", info);

        self.generation += 1;
        self.open = Some(OpenTransport {
            info,
            channel: Arc::new(channel),
        });
        Ok(AttachOutcome::Attached(info))
    }

    /// React to a daemon event
    pub fn handle_event(
        &mut self,
        registry: &mut dyn TransportRegistry,
        event: &Event,
    ) -> LinkResult<AttachOutcome> {
        if !event.affects_transports() {
            return Ok(AttachOutcome::Unchanged);
        }
        let Some(filter) = self.filter else {
            return Ok(AttachOutcome::Unchanged);
        };
        if !filter.address.matches(&event.transport.address) {
            return Ok(AttachOutcome::Unchanged);
        }

        if event.mask.contains(EventKind::TransportRemoved) {
            if let Some(open) = &self.open {
                if open.is_listed_as(&event.transport) {
                    log::info!("Attach: {} removed", open.info);
                    return self.detach(registry);
                }
            }
        }

        self.evaluate(registry)
    }

    /// Close the open transport, if any, and revoke its channel
    ///
    /// The channel is cut off even where other clones of it are still held.
    /// Local state is cleared even when the daemon call fails.
    pub fn detach(&mut self, registry: &mut dyn TransportRegistry) -> LinkResult<AttachOutcome> {
        let Some(open) = self.open.take() else {
            return Ok(AttachOutcome::Unchanged);
        };
        self.generation += 1;
        open.channel.revoke();
        let closed = registry.close_transport(&open.info);
        drop(open);
        log::debug!("Attach: detached");
        closed.map(|_| AttachOutcome::Detached)
    }
}

//! Transport change notifications

use crate::error::{ProtocolError, ProtocolResult};
use crate::transport::{TransportInfo, TRANSPORT_RECORD_SIZE};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Size of an encoded event record in bytes
pub const EVENT_RECORD_SIZE: usize = 4 + TRANSPORT_RECORD_SIZE;

/// A single kind of event the daemon can emit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    TransportAdded,
    TransportChanged,
    TransportRemoved,
    BatteryUpdated,
    VolumeUpdated,
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        EventKind::TransportAdded,
        EventKind::TransportChanged,
        EventKind::TransportRemoved,
        EventKind::BatteryUpdated,
        EventKind::VolumeUpdated,
    ];

    /// Bit assigned to this kind in an [`EventMask`]
    pub const fn bit(self) -> u32 {
        match self {
            EventKind::TransportAdded => 1 << 0,
            EventKind::TransportChanged => 1 << 1,
            EventKind::TransportRemoved => 1 << 2,
            EventKind::BatteryUpdated => 1 << 3,
            EventKind::VolumeUpdated => 1 << 4,
        }
    }
}

/// Set of event kinds, used both for subscriptions and in event records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EventMask(u32);

impl EventMask {
    pub const NONE: EventMask = EventMask(0);
    pub const TRANSPORT_ADDED: EventMask = EventMask(EventKind::TransportAdded.bit());
    pub const TRANSPORT_CHANGED: EventMask = EventMask(EventKind::TransportChanged.bit());
    pub const TRANSPORT_REMOVED: EventMask = EventMask(EventKind::TransportRemoved.bit());
    pub const BATTERY_UPDATED: EventMask = EventMask(EventKind::BatteryUpdated.bit());
    pub const VOLUME_UPDATED: EventMask = EventMask(EventKind::VolumeUpdated.bit());

    /// Every kind that affects which transports exist
    pub const TRANSPORTS: EventMask = EventMask(
        EventKind::TransportAdded.bit()
            | EventKind::TransportChanged.bit()
            | EventKind::TransportRemoved.bit(),
    );

    const KNOWN: u32 = 0x1F;

    /// Build a mask from raw bits, rejecting bits no kind is assigned to
    pub fn from_bits(bits: u32) -> ProtocolResult<Self> {
        if bits & !Self::KNOWN != 0 {
            return Err(ProtocolError::UnknownEventBits(bits));
        }
        Ok(Self(bits))
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, kind: EventKind) -> bool {
        self.0 & kind.bit() != 0
    }

    /// True if any of the bits in `other` are set
    pub const fn intersects(self, other: EventMask) -> bool {
        self.0 & other.0 != 0
    }

    /// Kinds present in the mask, in bit order
    pub fn kinds(self) -> impl Iterator<Item = EventKind> {
        EventKind::ALL.into_iter().filter(move |k| self.contains(*k))
    }
}

impl From<EventKind> for EventMask {
    fn from(kind: EventKind) -> Self {
        EventMask(kind.bit())
    }
}

impl BitOr for EventMask {
    type Output = EventMask;

    fn bitor(self, rhs: EventMask) -> EventMask {
        EventMask(self.0 | rhs.0)
    }
}

impl BitOrAssign for EventMask {
    fn bitor_assign(&mut self, rhs: EventMask) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for EventMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        let mut first = true;
        for kind in self.kinds() {
            if !first {
                f.write_str("|")?;
            }
            first = false;
            write!(f, "{kind:?}")?;
        }
        Ok(())
    }
}

/// One notification: what happened, and to which transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventRecord {
    pub mask: EventMask,
    pub transport: TransportInfo,
}

impl EventRecord {
    pub fn new(mask: impl Into<EventMask>, transport: TransportInfo) -> Self {
        Self {
            mask: mask.into(),
            transport,
        }
    }

    pub fn encode(&self) -> [u8; EVENT_RECORD_SIZE] {
        let mut buf = [0u8; EVENT_RECORD_SIZE];
        buf[0..4].copy_from_slice(&self.mask.bits().to_le_bytes());
        buf[4..].copy_from_slice(&self.transport.encode());
        buf
    }

    pub fn decode(buf: &[u8]) -> ProtocolResult<Self> {
        if buf.len() < EVENT_RECORD_SIZE {
            return Err(ProtocolError::Truncated {
                expected: EVENT_RECORD_SIZE,
                actual: buf.len(),
            });
        }
        let mask = EventMask::from_bits(u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]))?;
        let transport = TransportInfo::decode(&buf[4..EVENT_RECORD_SIZE])?;
        Ok(Self { mask, transport })
    }

    /// Whether the event changes the set of available transports
    pub fn affects_transports(&self) -> bool {
        self.mask.intersects(EventMask::TRANSPORTS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Codec, Profile, StreamDirection};

    fn transport() -> TransportInfo {
        TransportInfo {
            address: "AA:BB:CC:DD:EE:FF".parse().unwrap(),
            profile: Profile::Sco,
            direction: StreamDirection::Duplex,
            codec: Codec::CVSD,
            sample_rate: 8000,
            channels: 1,
        }
    }

    #[test]
    fn test_mask_bits() {
        assert_eq!(EventMask::TRANSPORT_ADDED.bits(), 0x01);
        assert_eq!(EventMask::TRANSPORT_REMOVED.bits(), 0x04);
        assert_eq!(EventMask::VOLUME_UPDATED.bits(), 0x10);
        assert_eq!(EventMask::TRANSPORTS.bits(), 0x07);

        let mask = EventMask::TRANSPORT_ADDED | EventMask::BATTERY_UPDATED;
        assert!(mask.contains(EventKind::BatteryUpdated));
        assert!(!mask.contains(EventKind::TransportRemoved));
        assert_eq!(
            mask.kinds().collect::<Vec<_>>(),
            vec![EventKind::TransportAdded, EventKind::BatteryUpdated]
        );
        assert_eq!(mask.to_string(), "TransportAdded|BatteryUpdated");
        assert_eq!(EventMask::NONE.to_string(), "none");
    }

    #[test]
    fn test_unknown_bits_rejected() {
        assert_eq!(
            EventMask::from_bits(0x20),
            Err(ProtocolError::UnknownEventBits(0x20))
        );
        assert!(EventMask::from_bits(0x1F).is_ok());
    }

    #[test]
    fn test_record_codec() {
        let event = EventRecord::new(EventKind::TransportRemoved, transport());
        let buf = event.encode();

        assert_eq!(&buf[0..4], &[0x04, 0, 0, 0]);
        assert_eq!(EventRecord::decode(&buf).unwrap(), event);
        assert!(event.affects_transports());

        let battery = EventRecord::new(EventKind::BatteryUpdated, transport());
        assert!(!battery.affects_transports());
    }

    #[test]
    fn test_malformed_record() {
        let mut buf = EventRecord::new(EventKind::TransportAdded, transport()).encode();
        buf[3] = 0x80;
        assert!(matches!(
            EventRecord::decode(&buf),
            Err(ProtocolError::UnknownEventBits(_))
        ));

        assert!(matches!(
            EventRecord::decode(&buf[..12]),
            Err(ProtocolError::Truncated { expected: 20, actual: 12 })
        ));
    }
}

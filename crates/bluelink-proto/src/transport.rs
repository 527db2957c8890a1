//! Transport descriptors
//!
//! A transport is one negotiated Bluetooth audio session: device address,
//! profile, stream direction and the PCM format the daemon exposes for it.

use crate::address::BluetoothAddress;
use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Size of an encoded transport record in bytes
pub const TRANSPORT_RECORD_SIZE: usize = 16;

/// Bluetooth audio profile carrying the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Profile {
    /// Advanced Audio Distribution Profile (media audio)
    A2dp = 1,
    /// Synchronous Connection-Oriented link (voice audio)
    Sco = 2,
}

impl Profile {
    /// Decode a profile from its wire byte
    pub fn from_wire(value: u8) -> ProtocolResult<Self> {
        match value {
            1 => Ok(Self::A2dp),
            2 => Ok(Self::Sco),
            other => Err(ProtocolError::InvalidProfile(other)),
        }
    }

    /// Lowercase profile name as used in configuration
    pub fn as_str(self) -> &'static str {
        match self {
            Self::A2dp => "a2dp",
            Self::Sco => "sco",
        }
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Profile {
    type Err = ProtocolError;

    /// Case-insensitive: "a2dp", "A2DP", "sco", ...
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("a2dp") {
            Ok(Self::A2dp)
        } else if s.eq_ignore_ascii_case("sco") {
            Ok(Self::Sco)
        } else {
            Err(ProtocolError::InvalidProfile(0))
        }
    }
}

/// Direction of the PCM stream, seen from the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum StreamDirection {
    /// Client writes frames, the daemon sends them to the device
    Playback = 1,
    /// Client reads frames received from the device
    Capture = 2,
    /// Both directions on the same transport
    Duplex = 3,
}

impl StreamDirection {
    /// Decode a direction from its wire byte
    pub fn from_wire(value: u8) -> ProtocolResult<Self> {
        match value {
            1 => Ok(Self::Playback),
            2 => Ok(Self::Capture),
            3 => Ok(Self::Duplex),
            other => Err(ProtocolError::InvalidDirection(other)),
        }
    }

    /// Whether a transport advertising this direction can serve `needed`
    ///
    /// A duplex transport serves both directions.
    pub fn accepts(self, needed: StreamDirection) -> bool {
        self == needed || self == Self::Duplex
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Playback => "playback",
            Self::Capture => "capture",
            Self::Duplex => "duplex",
        }
    }
}

impl fmt::Display for StreamDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Codec identifier negotiated for a transport
///
/// The numbering space depends on the profile: A2DP uses the media codec
/// type assigned numbers, SCO uses the HFP codec ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Codec(pub u16);

impl Codec {
    /// SBC - mandatory A2DP codec
    pub const SBC: Codec = Codec(0x0000);
    /// MPEG-1,2 Audio
    pub const MPEG12: Codec = Codec(0x0001);
    /// MPEG-2,4 AAC
    pub const AAC: Codec = Codec(0x0002);
    /// aptX (vendor codec, mapped)
    pub const APTX: Codec = Codec(0x0004);
    /// LDAC (vendor codec, mapped)
    pub const LDAC: Codec = Codec(0x0005);
    /// HFP narrow band voice
    pub const CVSD: Codec = Codec(0x0001);
    /// HFP wide band voice
    pub const MSBC: Codec = Codec(0x0002);

    /// Human readable codec name for the given profile
    pub fn name(self, profile: Profile) -> &'static str {
        match (profile, self) {
            (Profile::A2dp, Self::SBC) => "SBC",
            (Profile::A2dp, Self::MPEG12) => "MPEG-1,2",
            (Profile::A2dp, Self::AAC) => "AAC",
            (Profile::A2dp, Self::APTX) => "aptX",
            (Profile::A2dp, Self::LDAC) => "LDAC",
            (Profile::Sco, Self::CVSD) => "CVSD",
            (Profile::Sco, Self::MSBC) => "mSBC",
            _ => "unknown",
        }
    }
}

/// Transport descriptor as exchanged with the daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportInfo {
    pub address: BluetoothAddress,
    pub profile: Profile,
    pub direction: StreamDirection,
    pub codec: Codec,
    /// Sample rate in Hz
    pub sample_rate: u32,
    pub channels: u8,
}

impl TransportInfo {
    /// Identity of a transport: the same device, profile and direction
    ///
    /// Codec and format may be renegotiated by the daemon without the
    /// transport becoming a different one.
    pub fn same_endpoint(&self, other: &TransportInfo) -> bool {
        self.address == other.address
            && self.profile == other.profile
            && self.direction == other.direction
    }

    /// Encode as a fixed-size transport record
    pub fn encode(&self) -> [u8; TRANSPORT_RECORD_SIZE] {
        let mut buf = [0u8; TRANSPORT_RECORD_SIZE];
        buf[0..6].copy_from_slice(&self.address.to_wire());
        buf[6] = self.profile as u8;
        buf[7] = self.direction as u8;
        buf[8..10].copy_from_slice(&self.codec.0.to_le_bytes());
        buf[10] = self.channels;
        buf[12..16].copy_from_slice(&self.sample_rate.to_le_bytes());
        buf
    }

    /// Decode a transport record
    ///
    /// Extra trailing bytes are ignored; callers slice records themselves.
    pub fn decode(buf: &[u8]) -> ProtocolResult<Self> {
        if buf.len() < TRANSPORT_RECORD_SIZE {
            return Err(ProtocolError::Truncated {
                expected: TRANSPORT_RECORD_SIZE,
                actual: buf.len(),
            });
        }

        let mut wire_addr = [0u8; 6];
        wire_addr.copy_from_slice(&buf[0..6]);

        Ok(Self {
            address: BluetoothAddress::from_wire(wire_addr),
            profile: Profile::from_wire(buf[6])?,
            direction: StreamDirection::from_wire(buf[7])?,
            codec: Codec(u16::from_le_bytes([buf[8], buf[9]])),
            channels: buf[10],
            sample_rate: u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]),
        })
    }

    /// Decode a payload made of consecutive transport records
    pub fn decode_list(payload: &[u8]) -> ProtocolResult<Vec<Self>> {
        if payload.len() % TRANSPORT_RECORD_SIZE != 0 {
            return Err(ProtocolError::PayloadLength { len: payload.len() });
        }
        payload
            .chunks_exact(TRANSPORT_RECORD_SIZE)
            .map(Self::decode)
            .collect()
    }
}

impl fmt::Display for TransportInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {}Hz {}ch",
            self.address,
            self.profile,
            self.direction,
            self.codec.name(self.profile),
            self.sample_rate,
            self.channels
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TransportInfo {
        TransportInfo {
            address: "00:1A:7D:DA:71:13".parse().unwrap(),
            profile: Profile::A2dp,
            direction: StreamDirection::Capture,
            codec: Codec::SBC,
            sample_rate: 44100,
            channels: 2,
        }
    }

    #[test]
    fn test_record_layout() {
        let buf = sample().encode();

        assert_eq!(&buf[0..6], &[0x13, 0x71, 0xDA, 0x7D, 0x1A, 0x00]);
        assert_eq!(buf[6], 1);
        assert_eq!(buf[7], 2);
        assert_eq!(&buf[8..10], &[0, 0]);
        assert_eq!(buf[10], 2);
        assert_eq!(buf[11], 0);
        assert_eq!(u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]), 44100);

        assert_eq!(TransportInfo::decode(&buf).unwrap(), sample());
    }

    #[test]
    fn test_decode_rejects_bad_fields() {
        let mut buf = sample().encode();
        buf[6] = 9;
        assert_eq!(
            TransportInfo::decode(&buf),
            Err(ProtocolError::InvalidProfile(9))
        );

        let mut buf = sample().encode();
        buf[7] = 0;
        assert_eq!(
            TransportInfo::decode(&buf),
            Err(ProtocolError::InvalidDirection(0))
        );

        assert!(matches!(
            TransportInfo::decode(&buf[..10]),
            Err(ProtocolError::Truncated { expected: 16, actual: 10 })
        ));
    }

    #[test]
    fn test_decode_list() {
        let mut second = sample();
        second.direction = StreamDirection::Playback;

        let mut payload = Vec::new();
        payload.extend_from_slice(&sample().encode());
        payload.extend_from_slice(&second.encode());

        let list = TransportInfo::decode_list(&payload).unwrap();
        assert_eq!(list, vec![sample(), second]);

        assert!(TransportInfo::decode_list(&[]).unwrap().is_empty());
        assert_eq!(
            TransportInfo::decode_list(&payload[..20]),
            Err(ProtocolError::PayloadLength { len: 20 })
        );
    }

    #[test]
    fn test_direction_accepts() {
        use StreamDirection::*;

        assert!(Capture.accepts(Capture));
        assert!(Duplex.accepts(Capture));
        assert!(Duplex.accepts(Playback));
        assert!(!Playback.accepts(Capture));
        assert!(!Capture.accepts(Playback));
    }

    #[test]
    fn test_profile_parsing() {
        assert_eq!("a2dp".parse::<Profile>().unwrap(), Profile::A2dp);
        assert_eq!("A2DP".parse::<Profile>().unwrap(), Profile::A2dp);
        assert_eq!("Sco".parse::<Profile>().unwrap(), Profile::Sco);
        assert!("hfp".parse::<Profile>().is_err());

        let direction: StreamDirection = serde_yaml::from_str("duplex").unwrap();
        assert_eq!(direction, StreamDirection::Duplex);
    }

    #[test]
    fn test_display() {
        assert_eq!(
            sample().to_string(),
            "00:1A:7D:DA:71:13 a2dp capture SBC 44100Hz 2ch"
        );

        let mut sco = sample();
        sco.profile = Profile::Sco;
        sco.codec = Codec::MSBC;
        assert!(sco.to_string().contains("mSBC"));
    }
}

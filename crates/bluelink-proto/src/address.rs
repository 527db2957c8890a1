//! Bluetooth device addresses

use crate::error::ProtocolError;
use std::fmt;
use std::str::FromStr;

/// A Bluetooth device address (`BD_ADDR`), stored in display order
///
/// `"12:34:56:78:9A:BC"` is held as `[0x12, 0x34, 0x56, 0x78, 0x9A, 0xBC]`.
/// The wire representation is reversed (least significant byte first), the
/// same layout the kernel uses for `bdaddr_t`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BluetoothAddress(pub [u8; 6]);

impl BluetoothAddress {
    /// Wildcard address; a device filter using it matches any device
    pub const ANY: Self = Self([0; 6]);

    /// Create a new Bluetooth address from bytes in display order
    #[must_use]
    pub const fn new(addr: [u8; 6]) -> Self {
        Self(addr)
    }

    /// Get the raw address bytes (display order)
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    /// Whether this is the wildcard address
    #[must_use]
    pub fn is_any(&self) -> bool {
        *self == Self::ANY
    }

    /// Filter semantics: `ANY` matches every address, otherwise exact equality
    #[must_use]
    pub fn matches(&self, other: &BluetoothAddress) -> bool {
        self.is_any() || self == other
    }

    /// Bytes as they travel on the wire (reversed)
    #[must_use]
    pub fn to_wire(&self) -> [u8; 6] {
        let mut wire = self.0;
        wire.reverse();
        wire
    }

    /// Build an address from its wire representation
    #[must_use]
    pub fn from_wire(wire: [u8; 6]) -> Self {
        let mut addr = wire;
        addr.reverse();
        Self(addr)
    }

    /// Parse a Bluetooth address from a colon-separated hex string
    ///
    /// # Errors
    /// Returns an error if the string is not exactly 17 characters long or
    /// contains anything but six colon-separated hex pairs.
    pub fn from_hex(hex: &str) -> Result<Self, ProtocolError> {
        let invalid = || ProtocolError::InvalidAddress(hex.to_string());

        if hex.len() != 17 || !hex.chars().all(|c| c.is_ascii_hexdigit() || c == ':') {
            return Err(invalid());
        }

        let mut bytes = [0u8; 6];
        for (i, byte) in hex.split(':').enumerate() {
            if i >= 6 || byte.len() != 2 {
                return Err(invalid());
            }
            bytes[i] = u8::from_str_radix(byte, 16).map_err(|_| invalid())?;
        }
        Ok(Self(bytes))
    }
}

impl fmt::Display for BluetoothAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

impl FromStr for BluetoothAddress {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s.trim())
    }
}

impl From<[u8; 6]> for BluetoothAddress {
    fn from(addr: [u8; 6]) -> Self {
        Self(addr)
    }
}

impl From<BluetoothAddress> for [u8; 6] {
    fn from(addr: BluetoothAddress) -> Self {
        addr.0
    }
}

impl TryFrom<&[u8]> for BluetoothAddress {
    type Error = ProtocolError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let addr: [u8; 6] = bytes.try_into().map_err(|_| ProtocolError::Truncated {
            expected: 6,
            actual: bytes.len(),
        })?;
        Ok(Self(addr))
    }
}

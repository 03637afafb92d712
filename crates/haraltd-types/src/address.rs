//! Bluetooth device addresses and client identifiers.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::error::ParseError;

/// A 48-bit Bluetooth device address.
///
/// Rendered as six colon-separated upper-case hex octets, most significant
/// first (`AA:BB:CC:DD:EE:FF`). Parsing also accepts `-` separators and the
/// bare 12-digit form.
///
/// # Examples
///
/// ```
/// use haraltd_types::BluetoothAddress;
///
/// let addr: BluetoothAddress = "aa:bb:cc:dd:ee:ff".parse().unwrap();
/// assert_eq!(addr.to_string(), "AA:BB:CC:DD:EE:FF");
/// assert_eq!(addr, "AABBCCDDEEFF".parse().unwrap());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct BluetoothAddress([u8; 6]);

impl BluetoothAddress {
    /// The all-zero address, used for "no particular adapter".
    pub const ANY: BluetoothAddress = BluetoothAddress([0; 6]);

    /// Create an address from its six octets, most significant first.
    #[must_use]
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    /// The address octets, most significant first.
    #[must_use]
    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Returns `true` for [`BluetoothAddress::ANY`].
    #[must_use]
    pub fn is_any(&self) -> bool {
        self.0 == [0; 6]
    }
}

impl fmt::Display for BluetoothAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

impl FromStr for BluetoothAddress {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseError::InvalidAddress(s.to_string());
        let trimmed = s.trim();

        let digits: String = if trimmed.len() == 12 {
            trimmed.to_string()
        } else if trimmed.len() == 17 {
            let sep = trimmed.as_bytes()[2];
            if sep != b':' && sep != b'-' {
                return Err(invalid());
            }
            let mut out = String::with_capacity(12);
            for (i, part) in trimmed.split(sep as char).enumerate() {
                if i >= 6 || part.len() != 2 {
                    return Err(invalid());
                }
                out.push_str(part);
            }
            out
        } else {
            return Err(invalid());
        };

        if !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(invalid());
        }

        let mut octets = [0u8; 6];
        for (i, octet) in octets.iter_mut().enumerate() {
            let pair = digits.get(i * 2..i * 2 + 2).ok_or_else(invalid)?;
            *octet = u8::from_str_radix(pair, 16).map_err(|_| invalid())?;
        }

        Ok(Self(octets))
    }
}

impl Serialize for BluetoothAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for BluetoothAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Identifies one connected socket client.
///
/// Every accepted connection gets a fresh random id; operation tokens carry the
/// id of the connection that owns them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(Uuid);

impl ClientId {
    /// Generate a new random client id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// The underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_colon_separated() {
        let addr: BluetoothAddress = "01:23:45:67:89:AB".parse().unwrap();
        assert_eq!(addr.octets(), [0x01, 0x23, 0x45, 0x67, 0x89, 0xAB]);
    }

    #[test]
    fn test_parse_dash_separated_and_bare() {
        let a: BluetoothAddress = "01-23-45-67-89-ab".parse().unwrap();
        let b: BluetoothAddress = "0123456789ab".parse().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for bad in ["", "01:23:45:67:89", "01:23:45:67:89:GG", "01:23-45:67:89:AB", "nonsense"] {
            assert!(
                matches!(bad.parse::<BluetoothAddress>(), Err(ParseError::InvalidAddress(_))),
                "{bad} should not parse"
            );
        }
    }

    #[test]
    fn test_display_is_uppercase() {
        let addr = BluetoothAddress::new([0xaa, 0xbb, 0xcc, 0x0d, 0x0e, 0x0f]);
        assert_eq!(addr.to_string(), "AA:BB:CC:0D:0E:0F");
    }

    #[test]
    fn test_address_serde_as_string() {
        let addr: BluetoothAddress = "AA:BB:CC:DD:EE:FF".parse().unwrap();
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, "\"AA:BB:CC:DD:EE:FF\"");
        let back: BluetoothAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
    }

    #[test]
    fn test_any_address() {
        assert!(BluetoothAddress::ANY.is_any());
        assert!(!BluetoothAddress::new([0, 0, 0, 0, 0, 1]).is_any());
    }

    #[test]
    fn test_client_ids_are_unique() {
        assert_ne!(ClientId::new(), ClientId::new());
    }
}

//! Bluetooth service UUIDs used by the daemon.
//!
//! Classic Bluetooth services are 16-bit short ids expanded onto the
//! Bluetooth base UUID.

use uuid::{Uuid, uuid};

/// The Bluetooth base UUID, `0000xxxx-0000-1000-8000-00805F9B34FB`.
pub const BLUETOOTH_BASE: Uuid = uuid!("00000000-0000-1000-8000-00805f9b34fb");

// --- OBEX profiles ---

/// Object Push Profile service class.
pub const OBJECT_PUSH: Uuid = uuid!("00001105-0000-1000-8000-00805f9b34fb");

/// RFCOMM channel the Object Push server advertises on.
pub const OBJECT_PUSH_CHANNEL: u8 = 0x0a;

/// Expand a 16-bit short service id onto the Bluetooth base UUID.
#[must_use]
pub const fn from_short(short: u16) -> Uuid {
    let mut bytes = *BLUETOOTH_BASE.as_bytes();
    let [hi, lo] = short.to_be_bytes();
    bytes[2] = hi;
    bytes[3] = lo;
    Uuid::from_bytes(bytes)
}

/// The 16-bit short id of a base-derived UUID, if it is one.
#[must_use]
pub fn to_short(uuid: &Uuid) -> Option<u16> {
    let bytes = uuid.as_bytes();
    let base = BLUETOOTH_BASE.as_bytes();
    if bytes[..2] == base[..2] && bytes[4..] == base[4..] {
        Some(u16::from_be_bytes([bytes[2], bytes[3]]))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_push_uuid() {
        assert_eq!(
            OBJECT_PUSH.to_string().to_uppercase(),
            "00001105-0000-1000-8000-00805F9B34FB"
        );
        assert_eq!(OBJECT_PUSH_CHANNEL, 10);
    }

    #[test]
    fn test_short_uuid_expansion() {
        assert_eq!(from_short(0x1105), OBJECT_PUSH);
        assert_eq!(to_short(&OBJECT_PUSH), Some(0x1105));
    }

    #[test]
    fn test_non_base_uuid_has_no_short_form() {
        let custom = uuid!("f0cd1400-95da-4f4b-9ac8-aa55d312af0c");
        assert_eq!(to_short(&custom), None);
    }
}

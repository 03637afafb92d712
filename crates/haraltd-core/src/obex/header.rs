use std::fmt;

use bytes::{Buf, BufMut, Bytes};

use super::CodecError;
use super::app_param::AppParameters;

/// Length of the id byte plus the 16-bit length field.
const PREFIX_LEN: usize = 3;

/// How a header's payload is framed, from the top two bits of its id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeaderEncoding {
    /// Null-terminated UTF-16BE text, length prefixed.
    Unicode,
    /// Raw bytes, length prefixed.
    ByteSequence,
    /// A single byte.
    OneByte,
    /// A big-endian `u32`.
    FourByte,
}

impl HeaderEncoding {
    fn fixed_len(self) -> Option<usize> {
        match self {
            Self::OneByte => Some(1),
            Self::FourByte => Some(4),
            Self::Unicode | Self::ByteSequence => None,
        }
    }
}

/// An OBEX header identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HeaderId(pub u8);

impl HeaderId {
    pub const COUNT: HeaderId = HeaderId(0xC0);
    pub const NAME: HeaderId = HeaderId(0x01);
    pub const TYPE: HeaderId = HeaderId(0x42);
    pub const LENGTH: HeaderId = HeaderId(0xC3);
    pub const TIME: HeaderId = HeaderId(0x44);
    pub const DESCRIPTION: HeaderId = HeaderId(0x05);
    pub const TARGET: HeaderId = HeaderId(0x46);
    pub const HTTP: HeaderId = HeaderId(0x47);
    pub const BODY: HeaderId = HeaderId(0x48);
    pub const END_OF_BODY: HeaderId = HeaderId(0x49);
    pub const WHO: HeaderId = HeaderId(0x4A);
    pub const CONNECTION_ID: HeaderId = HeaderId(0xCB);
    pub const APPLICATION_PARAMETERS: HeaderId = HeaderId(0x4C);
    pub const AUTH_CHALLENGE: HeaderId = HeaderId(0x4D);
    pub const AUTH_RESPONSE: HeaderId = HeaderId(0x4E);
    pub const CREATOR_ID: HeaderId = HeaderId(0xCF);
    pub const WAN_UUID: HeaderId = HeaderId(0x50);
    pub const OBJECT_CLASS: HeaderId = HeaderId(0x51);
    pub const SESSION_PARAMETERS: HeaderId = HeaderId(0x52);
    pub const SESSION_SEQUENCE_NUMBER: HeaderId = HeaderId(0x93);
    pub const ACTION_ID: HeaderId = HeaderId(0x94);
    pub const DEST_NAME: HeaderId = HeaderId(0x15);
    pub const PERMISSIONS: HeaderId = HeaderId(0xD6);
    pub const SINGLE_RESPONSE_MODE: HeaderId = HeaderId(0x97);
    pub const SRM_PARAMETERS: HeaderId = HeaderId(0x98);

    /// The payload framing implied by the id.
    pub fn encoding(self) -> HeaderEncoding {
        match self.0 >> 6 {
            0 => HeaderEncoding::Unicode,
            1 => HeaderEncoding::ByteSequence,
            2 => HeaderEncoding::OneByte,
            _ => HeaderEncoding::FourByte,
        }
    }
}

impl fmt::Debug for HeaderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HeaderId(0x{:02X})", self.0)
    }
}

/// One OBEX header.
#[derive(Clone, PartialEq, Eq)]
pub struct ObexHeader {
    id: HeaderId,
    payload: Bytes,
}

impl ObexHeader {
    /// Create a header from a raw payload.
    ///
    /// One- and four-byte headers must get exactly 1 and 4 bytes; length
    /// prefixed headers must fit the 16-bit length field.
    pub fn new(id: HeaderId, payload: impl Into<Bytes>) -> Result<Self, CodecError> {
        let payload = payload.into();
        match id.encoding().fixed_len() {
            Some(expected) if payload.len() != expected => {
                return Err(CodecError::InvalidHeaderPayload {
                    id: id.0,
                    expected,
                    actual: payload.len(),
                });
            }
            Some(_) => {}
            None if payload.len() + PREFIX_LEN > usize::from(u16::MAX) => {
                return Err(CodecError::HeaderTooLarge(payload.len()));
            }
            None => {}
        }
        Ok(Self { id, payload })
    }

    /// A one-byte header.
    pub fn from_u8(id: HeaderId, value: u8) -> Result<Self, CodecError> {
        Self::new(id, Bytes::copy_from_slice(&[value]))
    }

    /// A four-byte header, big-endian.
    pub fn from_u32(id: HeaderId, value: u32) -> Result<Self, CodecError> {
        Self::new(id, Bytes::copy_from_slice(&value.to_be_bytes()))
    }

    /// A text header, UTF-16BE with a terminating NUL.
    pub fn from_unicode(id: HeaderId, text: &str) -> Result<Self, CodecError> {
        let mut buf = Vec::with_capacity((text.len() + 1) * 2);
        for unit in text.encode_utf16().chain(std::iter::once(0)) {
            buf.put_u16(unit);
        }
        Self::new(id, buf)
    }

    /// An ASCII header with a terminating NUL, as used for `Type`.
    pub fn from_ascii(id: HeaderId, text: &str) -> Result<Self, CodecError> {
        if !text.is_ascii() {
            return Err(CodecError::InvalidValue(format!(
                "non-ASCII text in header 0x{:02X}",
                id.0
            )));
        }
        let mut buf = Vec::with_capacity(text.len() + 1);
        buf.extend_from_slice(text.as_bytes());
        buf.push(0);
        Self::new(id, buf)
    }

    /// The header id.
    pub fn id(&self) -> HeaderId {
        self.id
    }

    /// The raw payload.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// The value of a one-byte header.
    pub fn as_u8(&self) -> Option<u8> {
        match self.payload.as_ref() {
            [b] => Some(*b),
            _ => None,
        }
    }

    /// The value of a four-byte header.
    pub fn as_u32(&self) -> Option<u32> {
        let bytes: [u8; 4] = self.payload.as_ref().try_into().ok()?;
        Some(u32::from_be_bytes(bytes))
    }

    /// Decode a UTF-16BE payload, dropping a trailing NUL.
    pub fn as_unicode(&self) -> Result<String, CodecError> {
        if self.payload.len() % 2 != 0 {
            return Err(CodecError::InvalidValue(format!(
                "odd-length UTF-16 payload in header 0x{:02X}",
                self.id.0
            )));
        }
        let mut units: Vec<u16> = self
            .payload
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect();
        if units.last() == Some(&0) {
            units.pop();
        }
        String::from_utf16(&units).map_err(|e| CodecError::InvalidValue(e.to_string()))
    }

    /// Decode an ASCII payload, dropping a trailing NUL.
    pub fn as_ascii(&self) -> Result<String, CodecError> {
        let bytes = self.payload.strip_suffix(&[0]).unwrap_or(&self.payload[..]);
        if !bytes.is_ascii() {
            return Err(CodecError::InvalidValue(format!(
                "non-ASCII payload in header 0x{:02X}",
                self.id.0
            )));
        }
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    /// Parse an application-parameters payload.
    pub fn as_app_parameters(&self) -> Result<AppParameters, CodecError> {
        AppParameters::parse(&self.payload)
    }

    /// Bytes this header occupies on the wire.
    pub fn wire_len(&self) -> usize {
        match self.id.encoding() {
            HeaderEncoding::Unicode | HeaderEncoding::ByteSequence => {
                PREFIX_LEN + self.payload.len()
            }
            HeaderEncoding::OneByte | HeaderEncoding::FourByte => 1 + self.payload.len(),
        }
    }

    /// Append the header to `buf`.
    pub fn write(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.id.0);
        if let HeaderEncoding::Unicode | HeaderEncoding::ByteSequence = self.id.encoding() {
            // Fits: checked in `new`.
            buf.put_u16((PREFIX_LEN + self.payload.len()) as u16);
        }
        buf.put_slice(&self.payload);
    }

    /// Read one header from the front of `buf`.
    pub fn read(buf: &mut impl Buf) -> Result<Self, CodecError> {
        if !buf.has_remaining() {
            return Err(CodecError::Truncated {
                id: 0,
                needed: 1,
                available: 0,
            });
        }
        let id = HeaderId(buf.get_u8());
        let len = match id.encoding().fixed_len() {
            Some(len) => len,
            None => {
                if buf.remaining() < 2 {
                    return Err(CodecError::Truncated {
                        id: id.0,
                        needed: 2,
                        available: buf.remaining(),
                    });
                }
                let total = usize::from(buf.get_u16());
                if total < PREFIX_LEN {
                    return Err(CodecError::MalformedHeaderLength);
                }
                total - PREFIX_LEN
            }
        };
        if buf.remaining() < len {
            return Err(CodecError::Truncated {
                id: id.0,
                needed: len,
                available: buf.remaining(),
            });
        }
        Ok(Self {
            id,
            payload: buf.copy_to_bytes(len),
        })
    }
}

impl fmt::Debug for ObexHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObexHeader")
            .field("id", &self.id)
            .field("len", &self.payload.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_encoding_from_top_bits() {
        assert_eq!(HeaderId::NAME.encoding(), HeaderEncoding::Unicode);
        assert_eq!(HeaderId::BODY.encoding(), HeaderEncoding::ByteSequence);
        assert_eq!(HeaderId::SESSION_SEQUENCE_NUMBER.encoding(), HeaderEncoding::OneByte);
        assert_eq!(HeaderId::LENGTH.encoding(), HeaderEncoding::FourByte);
    }

    #[test]
    fn test_unicode_header_wire_format() {
        let header = ObexHeader::from_unicode(HeaderId::NAME, "a.txt").unwrap();
        let mut buf = Vec::new();
        header.write(&mut buf);
        // id, len = 3 + 12, "a.txt\0" as UTF-16BE
        assert_eq!(&buf[..3], &[0x01, 0x00, 0x0F]);
        assert_eq!(&buf[3..5], &[0x00, b'a']);
        assert_eq!(&buf[13..], &[0x00, 0x00]);
        assert_eq!(header.wire_len(), buf.len());
        assert_eq!(header.as_unicode().unwrap(), "a.txt");
    }

    #[test]
    fn test_ascii_header_wire_format() {
        let header = ObexHeader::from_ascii(HeaderId::TYPE, "text/plain").unwrap();
        let mut buf = Vec::new();
        header.write(&mut buf);
        assert_eq!(buf[0], 0x42);
        assert_eq!(u16::from_be_bytes([buf[1], buf[2]]), 3 + 11);
        assert_eq!(&buf[3..], b"text/plain\0");
        assert_eq!(header.as_ascii().unwrap(), "text/plain");

        assert!(ObexHeader::from_ascii(HeaderId::TYPE, "caf\u{e9}").is_err());
    }

    #[test]
    fn test_four_byte_header_has_no_length() {
        let header = ObexHeader::from_u32(HeaderId::LENGTH, 0x0102_0304).unwrap();
        let mut buf = Vec::new();
        header.write(&mut buf);
        assert_eq!(buf, [0xC3, 1, 2, 3, 4]);
        assert_eq!(header.as_u32(), Some(0x0102_0304));
    }

    #[test]
    fn test_fixed_headers_validate_size() {
        assert!(matches!(
            ObexHeader::new(HeaderId::LENGTH, vec![1, 2]),
            Err(CodecError::InvalidHeaderPayload { expected: 4, actual: 2, .. })
        ));
        assert!(ObexHeader::new(HeaderId::SINGLE_RESPONSE_MODE, vec![1]).is_ok());
    }

    #[test]
    fn test_oversized_header_rejected() {
        let payload = vec![0u8; usize::from(u16::MAX)];
        assert!(matches!(
            ObexHeader::new(HeaderId::BODY, payload),
            Err(CodecError::HeaderTooLarge(_))
        ));
    }

    #[test]
    fn test_read_rejects_short_length_prefix() {
        let mut buf = Bytes::from_static(&[0x48, 0x00, 0x02]);
        assert_eq!(
            ObexHeader::read(&mut buf),
            Err(CodecError::MalformedHeaderLength)
        );
    }

    #[test]
    fn test_read_rejects_truncated_payload() {
        let mut buf = Bytes::from_static(&[0x48, 0x00, 0x08, 1, 2]);
        assert!(matches!(
            ObexHeader::read(&mut buf),
            Err(CodecError::Truncated { id: 0x48, needed: 5, available: 2 })
        ));
    }

    #[test]
    fn test_empty_body_header() {
        let mut buf = Bytes::from_static(&[0x49, 0x00, 0x03]);
        let header = ObexHeader::read(&mut buf).unwrap();
        assert_eq!(header.id(), HeaderId::END_OF_BODY);
        assert!(header.payload().is_empty());
    }

    fn arb_header() -> impl Strategy<Value = ObexHeader> {
        (any::<u8>(), proptest::collection::vec(any::<u8>(), 0..64)).prop_map(|(id, data)| {
            let id = HeaderId(id);
            let payload = match id.encoding().fixed_len() {
                Some(n) => data.into_iter().chain(std::iter::repeat(0)).take(n).collect(),
                None => data,
            };
            ObexHeader::new(id, payload).unwrap()
        })
    }

    proptest! {
        #[test]
        fn test_header_read_inverts_write(header in arb_header()) {
            let mut buf = Vec::new();
            header.write(&mut buf);
            prop_assert_eq!(buf.len(), header.wire_len());
            let mut bytes = Bytes::from(buf);
            let back = ObexHeader::read(&mut bytes).unwrap();
            prop_assert_eq!(back, header);
            prop_assert!(!bytes.has_remaining());
        }

        #[test]
        fn test_header_read_never_panics(data in proptest::collection::vec(any::<u8>(), 0..32)) {
            let mut bytes = Bytes::from(data);
            let _ = ObexHeader::read(&mut bytes);
        }
    }
}

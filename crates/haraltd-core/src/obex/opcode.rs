use std::fmt;

use super::CodecError;

const FINAL_BIT: u8 = 0x80;

/// OBEX request and response codes, without the final bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
#[repr(u8)]
pub enum ObexOperation {
    Connect = 0x00,
    Disconnect = 0x01,
    Put = 0x02,
    Get = 0x03,
    SetPath = 0x05,
    Action = 0x06,
    Session = 0x07,
    Abort = 0x7F,

    Continue = 0x10,
    Success = 0x20,
    Created = 0x21,
    Accepted = 0x22,
    NonAuthoritativeInfo = 0x23,
    NoContent = 0x24,
    ResetContent = 0x25,
    PartialContent = 0x26,
    MultipleChoices = 0x30,
    MovedPermanently = 0x31,
    MovedTemporarily = 0x32,
    SeeOther = 0x33,
    NotModified = 0x34,
    UseProxy = 0x35,
    BadRequest = 0x40,
    Unauthorized = 0x41,
    PaymentRequired = 0x42,
    Forbidden = 0x43,
    NotFound = 0x44,
    MethodNotAllowed = 0x45,
    NotAcceptable = 0x46,
    ProxyAuthenticationRequired = 0x47,
    RequestTimeout = 0x48,
    Conflict = 0x49,
    Gone = 0x4A,
    LengthRequired = 0x4B,
    PreconditionFailed = 0x4C,
    RequestedEntityTooLarge = 0x4D,
    RequestUrlTooLarge = 0x4E,
    UnsupportedMediaType = 0x4F,
    InternalServerError = 0x50,
    NotImplemented = 0x51,
    BadGateway = 0x52,
    ServiceUnavailable = 0x53,
    GatewayTimeout = 0x54,
    HttpVersionNotSupported = 0x55,
    DatabaseFull = 0x60,
    DatabaseLocked = 0x61,
}

impl ObexOperation {
    /// Look up a code with the final bit already masked off.
    pub fn from_code(code: u8) -> Option<Self> {
        use ObexOperation::*;
        let op = match code {
            0x00 => Connect,
            0x01 => Disconnect,
            0x02 => Put,
            0x03 => Get,
            0x05 => SetPath,
            0x06 => Action,
            0x07 => Session,
            0x7F => Abort,
            0x10 => Continue,
            0x20 => Success,
            0x21 => Created,
            0x22 => Accepted,
            0x23 => NonAuthoritativeInfo,
            0x24 => NoContent,
            0x25 => ResetContent,
            0x26 => PartialContent,
            0x30 => MultipleChoices,
            0x31 => MovedPermanently,
            0x32 => MovedTemporarily,
            0x33 => SeeOther,
            0x34 => NotModified,
            0x35 => UseProxy,
            0x40 => BadRequest,
            0x41 => Unauthorized,
            0x42 => PaymentRequired,
            0x43 => Forbidden,
            0x44 => NotFound,
            0x45 => MethodNotAllowed,
            0x46 => NotAcceptable,
            0x47 => ProxyAuthenticationRequired,
            0x48 => RequestTimeout,
            0x49 => Conflict,
            0x4A => Gone,
            0x4B => LengthRequired,
            0x4C => PreconditionFailed,
            0x4D => RequestedEntityTooLarge,
            0x4E => RequestUrlTooLarge,
            0x4F => UnsupportedMediaType,
            0x50 => InternalServerError,
            0x51 => NotImplemented,
            0x52 => BadGateway,
            0x53 => ServiceUnavailable,
            0x54 => GatewayTimeout,
            0x55 => HttpVersionNotSupported,
            0x60 => DatabaseFull,
            0x61 => DatabaseLocked,
            _ => return None,
        };
        Some(op)
    }

    /// Operations that are only valid with the final bit set.
    pub fn requires_final_bit(self) -> bool {
        matches!(
            self,
            Self::Connect | Self::Disconnect | Self::SetPath | Self::Session | Self::Abort
        )
    }
}

/// An opcode byte: an operation plus the final bit.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObexOpcode(u8);

impl ObexOpcode {
    /// Build an opcode. Fails if `op` requires the final bit and `is_final`
    /// is `false`.
    pub fn new(op: ObexOperation, is_final: bool) -> Result<Self, CodecError> {
        if op.requires_final_bit() && !is_final {
            return Err(CodecError::FinalBitRequired(op));
        }
        let value = op as u8;
        Ok(Self(if is_final { value | FINAL_BIT } else { value }))
    }

    /// Build an opcode with the final bit set. Always valid.
    pub fn final_of(op: ObexOperation) -> Self {
        Self(op as u8 | FINAL_BIT)
    }

    /// Validate a raw opcode byte.
    ///
    /// Valid bytes are known operations (with or without the final bit) and
    /// the user-defined range `0x11..=0x1F`.
    pub fn from_byte(value: u8) -> Result<Self, CodecError> {
        let opcode = Self(value);
        if opcode.is_user_defined() || opcode.operation().is_some() {
            Ok(opcode)
        } else {
            Err(CodecError::InvalidOpcode(value))
        }
    }

    /// The raw byte.
    pub fn value(self) -> u8 {
        self.0
    }

    /// The operation, if this is not a user-defined opcode.
    pub fn operation(self) -> Option<ObexOperation> {
        if self.is_user_defined() {
            return None;
        }
        ObexOperation::from_code(self.0 & !FINAL_BIT)
    }

    /// Returns `true` if the opcode is `op`, ignoring the final bit.
    pub fn is(self, op: ObexOperation) -> bool {
        self.operation() == Some(op)
    }

    /// Returns `true` if the final bit is set.
    pub fn is_final(self) -> bool {
        self.0 & FINAL_BIT != 0
    }

    /// Returns `true` for the user-defined range `0x11..=0x1F`.
    pub fn is_user_defined(self) -> bool {
        matches!(self.0 & !FINAL_BIT, 0x11..=0x1F)
    }
}

impl From<ObexOperation> for ObexOpcode {
    fn from(op: ObexOperation) -> Self {
        if op.requires_final_bit() {
            Self::final_of(op)
        } else {
            Self(op as u8)
        }
    }
}

impl fmt::Debug for ObexOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl fmt::Display for ObexOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.operation() {
            Some(op) => write!(f, "{op:?} (0x{:02X})", self.0),
            None => write!(f, "User (0x{:02X})", self.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_final_bit_required() {
        for op in [
            ObexOperation::Connect,
            ObexOperation::Disconnect,
            ObexOperation::SetPath,
            ObexOperation::Session,
            ObexOperation::Abort,
        ] {
            assert_eq!(
                ObexOpcode::new(op, false),
                Err(CodecError::FinalBitRequired(op))
            );
            assert!(ObexOpcode::new(op, true).unwrap().is_final());
        }
        assert_eq!(ObexOpcode::new(ObexOperation::Put, false).unwrap().value(), 0x02);
        assert_eq!(ObexOpcode::new(ObexOperation::Put, true).unwrap().value(), 0x82);
    }

    #[test]
    fn test_wire_values() {
        assert_eq!(ObexOpcode::from(ObexOperation::Connect).value(), 0x80);
        assert_eq!(ObexOpcode::from(ObexOperation::Abort).value(), 0xFF);
        assert_eq!(ObexOpcode::final_of(ObexOperation::Success).value(), 0xA0);
        assert_eq!(ObexOpcode::from(ObexOperation::Continue).value(), 0x10);
    }

    #[test]
    fn test_from_byte_masks_final_bit() {
        let op = ObexOpcode::from_byte(0xA0).unwrap();
        assert!(op.is(ObexOperation::Success));
        assert!(op.is_final());

        let op = ObexOpcode::from_byte(0x02).unwrap();
        assert!(op.is(ObexOperation::Put));
        assert!(!op.is_final());
    }

    #[test]
    fn test_user_defined_range() {
        for b in 0x11..=0x1F {
            let op = ObexOpcode::from_byte(b).unwrap();
            assert!(op.is_user_defined());
            assert_eq!(op.operation(), None);
        }
        assert!(!ObexOpcode::from_byte(0x10).unwrap().is_user_defined());
    }

    #[test]
    fn test_unknown_bytes_rejected() {
        for b in [0x04, 0x08, 0x0F, 0x27, 0x56, 0x62, 0x7E] {
            assert_eq!(ObexOpcode::from_byte(b), Err(CodecError::InvalidOpcode(b)));
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(
            ObexOpcode::final_of(ObexOperation::Forbidden).to_string(),
            "Forbidden (0xC3)"
        );
    }
}

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::CodecError;
use super::header::{HeaderId, ObexHeader};
use super::opcode::{ObexOpcode, ObexOperation};

/// Opcode byte plus the length field.
const FIXED_LEN: usize = 3;
/// Version, flags and maximum packet length of a Connect packet.
const CONNECT_FIELDS_LEN: usize = 4;

/// The extra fields carried by Connect requests and their responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectFields {
    /// OBEX version, `0x10` for 1.0.
    pub version: u8,
    pub flags: u8,
    /// Largest packet the sender can receive.
    pub max_packet_len: u16,
}

impl Default for ConnectFields {
    fn default() -> Self {
        Self {
            version: 0x10,
            flags: 0,
            max_packet_len: u16::MAX,
        }
    }
}

/// An OBEX request or response.
///
/// Headers keep insertion order; setting a header whose id is already
/// present replaces it in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObexPacket {
    pub opcode: ObexOpcode,
    headers: Vec<ObexHeader>,
    /// Present on Connect requests and their responses.
    pub connect: Option<ConnectFields>,
}

impl ObexPacket {
    /// A packet with no headers.
    pub fn new(opcode: impl Into<ObexOpcode>) -> Self {
        Self {
            opcode: opcode.into(),
            headers: Vec::new(),
            connect: None,
        }
    }

    /// A Connect request with default fields and an optional `Target`.
    pub fn connect(target: Option<&[u8]>) -> Result<Self, CodecError> {
        let mut packet = Self::new(ObexOperation::Connect);
        packet.connect = Some(ConnectFields::default());
        if let Some(target) = target {
            packet.set_header(ObexHeader::new(
                HeaderId::TARGET,
                Bytes::copy_from_slice(target),
            )?);
        }
        Ok(packet)
    }

    /// Add `header`, chaining.
    #[must_use]
    pub fn with_header(mut self, header: ObexHeader) -> Self {
        self.set_header(header);
        self
    }

    /// Add or replace a header.
    pub fn set_header(&mut self, header: ObexHeader) {
        match self.headers.iter_mut().find(|h| h.id() == header.id()) {
            Some(slot) => *slot = header,
            None => self.headers.push(header),
        }
    }

    /// Look up a header.
    pub fn header(&self, id: HeaderId) -> Option<&ObexHeader> {
        self.headers.iter().find(|h| h.id() == id)
    }

    /// Look up a header that must be present.
    pub fn require_header(&self, id: HeaderId) -> Result<&ObexHeader, CodecError> {
        self.header(id).ok_or(CodecError::HeaderNotFound(id.0))
    }

    /// Remove and return a header.
    pub fn remove_header(&mut self, id: HeaderId) -> Option<ObexHeader> {
        let idx = self.headers.iter().position(|h| h.id() == id)?;
        Some(self.headers.remove(idx))
    }

    /// Swap the header `old` for `new`.
    pub fn replace_header(&mut self, old: HeaderId, new: ObexHeader) {
        self.remove_header(old);
        self.set_header(new);
    }

    /// All headers in wire order.
    pub fn headers(&self) -> &[ObexHeader] {
        &self.headers
    }

    /// The payload of the `Body` or `EndOfBody` header.
    pub fn body(&self) -> Option<&Bytes> {
        self.header(HeaderId::BODY)
            .or_else(|| self.header(HeaderId::END_OF_BODY))
            .map(ObexHeader::payload)
    }

    /// Total encoded size.
    pub fn packet_len(&self) -> usize {
        FIXED_LEN
            + self.connect.map_or(0, |_| CONNECT_FIELDS_LEN)
            + self.headers.iter().map(ObexHeader::wire_len).sum::<usize>()
    }

    /// Encode into a fresh buffer.
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        let len = self.packet_len();
        let wire_len = u16::try_from(len).map_err(|_| CodecError::PacketTooLarge(len))?;

        let mut buf = BytesMut::with_capacity(len);
        buf.put_u8(self.opcode.value());
        buf.put_u16(wire_len);
        if let Some(fields) = self.connect {
            buf.put_u8(fields.version);
            buf.put_u8(fields.flags);
            buf.put_u16(fields.max_packet_len);
        }
        for header in &self.headers {
            header.write(&mut buf);
        }
        Ok(buf.freeze())
    }

    /// Decode one complete frame.
    ///
    /// Pass `connect = true` when the frame is a Connect request or the
    /// response to one; those carry four extra bytes before the headers.
    pub fn decode(mut frame: Bytes, connect: bool) -> Result<Self, CodecError> {
        let fixed = FIXED_LEN + if connect { CONNECT_FIELDS_LEN } else { 0 };
        if frame.len() < FIXED_LEN {
            return Err(CodecError::Truncated {
                id: 0,
                needed: FIXED_LEN,
                available: frame.len(),
            });
        }

        let opcode = ObexOpcode::from_byte(frame.get_u8())?;
        let declared = frame.get_u16();
        if usize::from(declared) < fixed {
            return Err(CodecError::MalformedPacketLength(declared));
        }
        let rest = usize::from(declared) - FIXED_LEN;
        if frame.len() < rest {
            return Err(CodecError::Truncated {
                id: 0,
                needed: rest,
                available: frame.len(),
            });
        }
        let mut frame = frame.split_to(rest);

        let connect = connect.then(|| ConnectFields {
            version: frame.get_u8(),
            flags: frame.get_u8(),
            max_packet_len: frame.get_u16(),
        });

        let mut packet = Self {
            opcode,
            headers: Vec::new(),
            connect,
        };
        while frame.has_remaining() {
            packet.set_header(ObexHeader::read(&mut frame)?);
        }
        Ok(packet)
    }

    /// Read one response from a byte stream.
    ///
    /// Pass `connect = true` when reading the reply to a Connect request.
    pub async fn read_from<R>(reader: &mut R, connect: bool) -> crate::Result<Self>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let frame = Self::read_frame(reader).await?;
        Ok(Self::decode(frame, connect)?)
    }

    /// Read one request from a byte stream. Connect requests are detected
    /// from the opcode.
    pub async fn read_request<R>(reader: &mut R) -> crate::Result<Self>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let frame = Self::read_frame(reader).await?;
        let connect = frame[0] & 0x7F == ObexOperation::Connect as u8;
        Ok(Self::decode(frame, connect)?)
    }

    async fn read_frame<R>(reader: &mut R) -> crate::Result<Bytes>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut prefix = [0u8; FIXED_LEN];
        reader.read_exact(&mut prefix).await?;
        let declared = u16::from_be_bytes([prefix[1], prefix[2]]);
        if usize::from(declared) < FIXED_LEN {
            return Err(CodecError::MalformedPacketLength(declared).into());
        }

        let mut frame = BytesMut::zeroed(usize::from(declared));
        frame[..FIXED_LEN].copy_from_slice(&prefix);
        reader.read_exact(&mut frame[FIXED_LEN..]).await?;
        Ok(frame.freeze())
    }

    /// Encode and write the packet, then flush.
    pub async fn write_to<W>(&self, writer: &mut W) -> crate::Result<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let frame = self.encode()?;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }
}

//! Incremental decoder for the inbound JSON request stream.

use bytes::{Buf, BytesMut};
use serde_json::{Deserializer, Value};
use thiserror::Error;

use haraltd_types::Request;

/// Largest amount of undecoded input kept per connection.
pub const DEFAULT_MAX_BUFFER: usize = 1024 * 1024;

/// Why a value on the stream did not yield a request.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DecodeError {
    /// The bytes are not JSON. The buffer was discarded.
    #[error("Invalid JSON: {0}")]
    Syntax(#[source] serde_json::Error),

    /// A complete JSON value that is not a request.
    #[error("Invalid request: {0}")]
    Shape(#[source] serde_json::Error),

    /// `request_id` was zero or negative.
    #[error("Invalid request id {0}: must be positive")]
    RequestId(i64),

    /// An incomplete value grew past the buffer limit. The buffer was
    /// discarded.
    #[error("Request exceeds {0} bytes")]
    TooLarge(usize),
}

/// Splits an unframed byte stream into [`Request`]s.
///
/// Bytes are appended with [`buffer_mut`](Self::buffer_mut) or
/// [`extend`](Self::extend); [`decode`](Self::decode) then yields one value
/// at a time. Values need no separator. Partial values stay buffered until
/// the rest arrives.
#[derive(Debug)]
pub struct RequestDecoder {
    buf: BytesMut,
    max_len: usize,
}

impl Default for RequestDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BUFFER)
    }
}

impl RequestDecoder {
    pub fn new(max_len: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
            max_len,
        }
    }

    /// The receive buffer, for `read_buf`.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes waiting to be decoded.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Decode the next value. `None` means more input is needed.
    pub fn decode(&mut self) -> Option<Result<Request, DecodeError>> {
        let mut stream = Deserializer::from_slice(&self.buf).into_iter::<Value>();
        match stream.next() {
            Some(Ok(value)) => {
                let consumed = stream.byte_offset();
                self.buf.advance(consumed);
                Some(into_request(value))
            }
            Some(Err(e)) if e.is_eof() => {
                if self.buf.len() > self.max_len {
                    self.buf.clear();
                    return Some(Err(DecodeError::TooLarge(self.max_len)));
                }
                None
            }
            Some(Err(e)) => {
                self.buf.clear();
                Some(Err(DecodeError::Syntax(e)))
            }
            None => {
                // Only whitespace left.
                self.buf.clear();
                None
            }
        }
    }
}

fn into_request(value: Value) -> Result<Request, DecodeError> {
    let request: Request = serde_json::from_value(value).map_err(DecodeError::Shape)?;
    if request.request_id < 1 {
        return Err(DecodeError::RequestId(request.request_id));
    }
    Ok(request)
}

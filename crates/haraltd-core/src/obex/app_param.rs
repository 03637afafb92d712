use std::collections::BTreeMap;

use bytes::{BufMut, Bytes};

use super::CodecError;
use super::header::{HeaderId, ObexHeader};

/// Largest content an application parameter may carry.
pub const MAX_APP_PARAMETER_LEN: usize = 126;

/// One tag-length-value entry of an `ApplicationParameters` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppParameter {
    tag: u8,
    content: Bytes,
}

impl AppParameter {
    /// Create an entry. Fails if `content` is over
    /// [`MAX_APP_PARAMETER_LEN`].
    pub fn new(tag: u8, content: impl Into<Bytes>) -> Result<Self, CodecError> {
        let content = content.into();
        if content.len() > MAX_APP_PARAMETER_LEN {
            return Err(CodecError::AppParameterTooLarge(content.len()));
        }
        Ok(Self { tag, content })
    }

    /// A big-endian `u16` entry.
    pub fn from_u16(tag: u8, value: u16) -> Self {
        Self {
            tag,
            content: Bytes::copy_from_slice(&value.to_be_bytes()),
        }
    }

    /// A big-endian `u32` entry.
    pub fn from_u32(tag: u8, value: u32) -> Self {
        Self {
            tag,
            content: Bytes::copy_from_slice(&value.to_be_bytes()),
        }
    }

    pub fn tag(&self) -> u8 {
        self.tag
    }

    pub fn content(&self) -> &Bytes {
        &self.content
    }

    /// The content as a big-endian `u16`.
    pub fn as_u16(&self) -> Option<u16> {
        let bytes: [u8; 2] = self.content.as_ref().try_into().ok()?;
        Some(u16::from_be_bytes(bytes))
    }
}

/// Application parameters keyed by tag; a later entry with the same tag
/// replaces an earlier one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppParameters(BTreeMap<u8, AppParameter>);

impl AppParameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an entry.
    pub fn insert(&mut self, param: AppParameter) {
        self.0.insert(param.tag, param);
    }

    /// Look up an entry.
    pub fn get(&self, tag: u8) -> Option<&AppParameter> {
        self.0.get(&tag)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Pack the entries into one `ApplicationParameters` header.
    pub fn to_header(&self) -> Result<ObexHeader, CodecError> {
        let mut buf = Vec::new();
        for param in self.0.values() {
            buf.put_u8(param.tag);
            // At most MAX_APP_PARAMETER_LEN.
            buf.put_u8(param.content.len() as u8);
            buf.put_slice(&param.content);
        }
        ObexHeader::new(HeaderId::APPLICATION_PARAMETERS, buf)
    }

    /// Parse a packed TLV payload.
    pub fn parse(payload: &Bytes) -> Result<Self, CodecError> {
        let mut params = Self::new();
        let mut i = 0;
        while i < payload.len() {
            let tag = payload[i];
            let len = usize::from(*payload.get(i + 1).ok_or(CodecError::Truncated {
                id: HeaderId::APPLICATION_PARAMETERS.0,
                needed: 2,
                available: payload.len() - i,
            })?);
            let start = i + 2;
            let end = start + len;
            if end > payload.len() {
                return Err(CodecError::Truncated {
                    id: HeaderId::APPLICATION_PARAMETERS.0,
                    needed: len,
                    available: payload.len() - start,
                });
            }
            params.insert(AppParameter::new(tag, payload.slice(start..end))?);
            i = end;
        }
        Ok(params)
    }
}

impl FromIterator<AppParameter> for AppParameters {
    fn from_iter<I: IntoIterator<Item = AppParameter>>(iter: I) -> Self {
        let mut params = Self::new();
        for p in iter {
            params.insert(p);
        }
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_limit() {
        assert!(AppParameter::new(1, vec![0u8; 126]).is_ok());
        assert_eq!(
            AppParameter::new(1, vec![0u8; 127]),
            Err(CodecError::AppParameterTooLarge(127))
        );
    }

    #[test]
    fn test_pack_into_single_header() {
        let params: AppParameters = [AppParameter::from_u16(0x04, 0x0100), AppParameter::from_u32(0x10, 7)]
            .into_iter()
            .collect();
        let header = params.to_header().unwrap();
        assert_eq!(header.id(), HeaderId::APPLICATION_PARAMETERS);
        assert_eq!(
            header.payload().as_ref(),
            &[0x04, 2, 0x01, 0x00, 0x10, 4, 0, 0, 0, 7]
        );

        let back = header.as_app_parameters().unwrap();
        assert_eq!(back, params);
        assert_eq!(back.get(0x04).and_then(AppParameter::as_u16), Some(0x0100));
    }

    #[test]
    fn test_parse_truncated_entry() {
        let payload = Bytes::from_static(&[0x04, 5, 1, 2]);
        assert!(matches!(
            AppParameters::parse(&payload),
            Err(CodecError::Truncated { .. })
        ));
        let payload = Bytes::from_static(&[0x04]);
        assert!(AppParameters::parse(&payload).is_err());
    }

    #[test]
    fn test_duplicate_tags_last_wins() {
        let payload = Bytes::from_static(&[0x01, 1, 0xAA, 0x01, 1, 0xBB]);
        let params = AppParameters::parse(&payload).unwrap();
        assert_eq!(params.len(), 1);
        assert_eq!(params.get(1).unwrap().content().as_ref(), &[0xBB]);
    }
}

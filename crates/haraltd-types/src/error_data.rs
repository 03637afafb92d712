//! Structured errors as they appear on the wire.
//!
//! Every failure that reaches a client is an [`ErrorData`]: a stable numeric
//! code, a human readable description and optional metadata such as the
//! offending address or the message of the underlying failure.
//!
//! ```
//! use haraltd_types::{ErrorCode, ErrorData};
//!
//! let err = ErrorData::from(ErrorCode::DeviceFileTransferSession)
//!     .with_metadata("exception", "A session already exists with this address");
//! let json = serde_json::to_value(&err).unwrap();
//! assert_eq!(json["code"], -1013);
//! assert_eq!(json["metadata"]["exception"], "A session already exists with this address");
//! ```

use std::collections::BTreeMap;

use core::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stable error codes understood by clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
#[repr(i32)]
pub enum ErrorCode {
    None = 0,
    Unexpected = -1,
    OperationCancelled = -2,
    OperationInProgress = -3,
    Unsupported = -100,
    AdapterNotFound = -1000,
    DeviceNotFound = -1009,
    DeviceFileTransferSession = -1013,
    DeviceFileTransferServer = -1014,
    JsonRequestParse = -2500,
    JsonResponseMarshal = -2511,
    ParsingCommand = -10000,
}

impl ErrorCode {
    /// The numeric value sent on the wire.
    #[must_use]
    pub const fn value(self) -> i32 {
        self as i32
    }

    /// The symbolic name, e.g. `ERROR_OPERATION_CANCELLED`.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::None => "ERROR_NONE",
            Self::Unexpected => "ERROR_UNEXPECTED",
            Self::OperationCancelled => "ERROR_OPERATION_CANCELLED",
            Self::OperationInProgress => "ERROR_OPERATION_IN_PROGRESS",
            Self::Unsupported => "ERROR_UNSUPPORTED",
            Self::AdapterNotFound => "ERROR_ADAPTER_NOT_FOUND",
            Self::DeviceNotFound => "ERROR_DEVICE_NOT_FOUND",
            Self::DeviceFileTransferSession => "ERROR_DEVICE_FILE_TRANSFER_SESSION",
            Self::DeviceFileTransferServer => "ERROR_DEVICE_FILE_TRANSFER_SERVER",
            Self::JsonRequestParse => "ERROR_JSON_REQUEST_PARSE",
            Self::JsonResponseMarshal => "ERROR_JSON_RESPONSE_MARSHAL",
            Self::ParsingCommand => "ERROR_PARSING_COMMAND",
        }
    }

    /// The default description sent along with the code.
    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::None => "",
            Self::Unexpected => "An unexpected error occurred",
            Self::OperationCancelled => "An operation was cancelled",
            Self::OperationInProgress => "An operation is in progress",
            Self::Unsupported => "This operation is unsupported",
            Self::AdapterNotFound => "An adapter was not found",
            Self::DeviceNotFound => "Cannot find device with the specified address",
            Self::DeviceFileTransferSession => {
                "An error occurred during a file transfer client session"
            }
            Self::DeviceFileTransferServer => {
                "An error occurred during a file transfer server session"
            }
            Self::JsonRequestParse => "An error occurred while parsing the JSON request",
            Self::JsonResponseMarshal => "An error occurred while marshalling the JSON response",
            Self::ParsingCommand => "An error occurred while parsing the command-line arguments",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.value())
    }
}

/// An error as delivered to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorData {
    /// Numeric code, see [`ErrorCode`].
    pub code: i32,
    /// Human readable description.
    pub description: String,
    /// Extra context, omitted from the JSON when empty.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl ErrorData {
    /// Create an error with an explicit description.
    pub fn new(code: ErrorCode, description: impl Into<String>) -> Self {
        Self {
            code: code.value(),
            description: description.into(),
            metadata: BTreeMap::new(),
        }
    }

    /// The "no error" value.
    #[must_use]
    pub fn none() -> Self {
        ErrorCode::None.into()
    }

    /// Returns `true` if this is the "no error" value.
    #[must_use]
    pub fn is_none(&self) -> bool {
        self.code == ErrorCode::None.value()
    }

    /// Attach a metadata entry, replacing any previous value for `key`.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Look up a metadata entry as a string.
    #[must_use]
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }
}

impl From<ErrorCode> for ErrorData {
    fn from(code: ErrorCode) -> Self {
        Self::new(code, code.description())
    }
}

impl fmt::Display for ErrorData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.description, self.code)?;
        for (key, value) in &self.metadata {
            match value {
                Value::String(s) => write!(f, ", {key}: {s}")?,
                other => write!(f, ", {key}: {other}")?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(ErrorCode::None.value(), 0);
        assert_eq!(ErrorCode::Unexpected.value(), -1);
        assert_eq!(ErrorCode::OperationCancelled.value(), -2);
        assert_eq!(ErrorCode::OperationInProgress.value(), -3);
        assert_eq!(ErrorCode::Unsupported.value(), -100);
        assert_eq!(ErrorCode::JsonRequestParse.value(), -2500);
        assert_eq!(ErrorCode::JsonResponseMarshal.value(), -2511);
        assert_eq!(ErrorCode::ParsingCommand.value(), -10000);
    }

    #[test]
    fn test_none_has_no_metadata_in_json() {
        let json = serde_json::to_string(&ErrorData::none()).unwrap();
        assert_eq!(json, r#"{"code":0,"description":""}"#);
        assert!(ErrorData::none().is_none());
    }

    #[test]
    fn test_metadata_roundtrip() {
        let err = ErrorData::from(ErrorCode::Unexpected).with_metadata("exception", "boom");
        let json = serde_json::to_string(&err).unwrap();
        let back: ErrorData = serde_json::from_str(&json).unwrap();
        assert_eq!(back, err);
        assert_eq!(back.metadata_str("exception"), Some("boom"));
    }

    #[test]
    fn test_error_display() {
        let err = ErrorData::from(ErrorCode::OperationCancelled).with_metadata("address", "AA");
        assert_eq!(err.to_string(), "An operation was cancelled (-2), address: AA");
        assert_eq!(
            ErrorCode::OperationCancelled.to_string(),
            "ERROR_OPERATION_CANCELLED (-2)"
        );
    }
}

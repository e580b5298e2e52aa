//! Command request and response envelopes.
//!
//! Every daemon command is addressed by a string name and acknowledged
//! with a [`CommandResult`] envelope. The daemon's framing is loose:
//! depending on the code path it replies with either the bare envelope
//! object or a single-element array wrapping it, so [`CommandResult::decode`]
//! accepts both shapes and normalizes them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ProtoError;

/// Handshake command; the response message carries the daemon version.
pub const CMD_VERSION: &str = "version";

/// Begin streaming `snappy-data` push events.
pub const CMD_START: &str = "start-snappy";

/// Stop streaming `snappy-data` push events.
pub const CMD_STOP: &str = "stop-snappy";

/// Diagnostic query for the currently attached device.
pub const CMD_DEVICE_INFO: &str = "device-info";

/// Outgoing request frame.
///
/// Serializes to a JSON object carrying the `command` field plus any
/// payload fields flattened alongside it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest {
    pub command: String,

    #[serde(flatten)]
    pub payload: Option<Value>,
}

impl CommandRequest {
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            payload: None,
        }
    }

    #[must_use]
    pub fn with_payload(command: impl Into<String>, payload: Value) -> Self {
        Self {
            command: command.into(),
            payload: Some(payload),
        }
    }

    /// Serialize this request to its wire text.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Acknowledgment envelope returned for every command.
///
/// Also the uniform result type of every client operation: expected
/// failures (daemon absent, not connected, timeout) come back as a
/// `CommandResult` with `success == false` and a machine-readable
/// [`error`](crate::error_code) code, never as an `Err`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub success: bool,
    pub message: String,
    pub command: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandResult {
    #[must_use]
    pub fn ok(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            command: command.into(),
            error: None,
        }
    }

    #[must_use]
    pub fn failure(
        command: impl Into<String>,
        code: &str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            success: false,
            message: message.into(),
            command: command.into(),
            error: Some(code.to_string()),
        }
    }

    /// Decode a response envelope from an already-parsed JSON value.
    ///
    /// Accepts the bare envelope object or a single-element array
    /// wrapping it.
    ///
    /// # Errors
    ///
    /// Returns [`ProtoError::EmptyEnvelope`] for an empty array and
    /// [`ProtoError::Json`] if the fields do not match the envelope.
    pub fn decode(value: &Value) -> Result<Self, ProtoError> {
        let inner = match value {
            Value::Array(items) => items.first().ok_or(ProtoError::EmptyEnvelope)?,
            other => other,
        };

        if !inner.is_object() {
            return Err(ProtoError::NotAnEnvelope);
        }

        Ok(serde_json::from_value(inner.clone())?)
    }

    /// Decode a response envelope from wire text.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not JSON or does not contain an
    /// envelope in either accepted shape.
    pub fn decode_str(text: &str) -> Result<Self, ProtoError> {
        let value: Value = serde_json::from_str(text)?;
        Self::decode(&value)
    }

    #[must_use]
    pub fn error_code(&self) -> Option<&str> {
        self.error.as_deref()
    }
}

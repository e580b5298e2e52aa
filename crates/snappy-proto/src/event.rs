//! Unsolicited push events from the daemon.
//!
//! The daemon emits two kinds of push frames, distinguished by their
//! `event` field: `device-connected` (physical attach/detach) and
//! `snappy-data` (live measurements). Neither is solicited by a command
//! and neither is acknowledged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ProtoError;

/// Wire name of the device attach/detach event.
pub const EVENT_DEVICE_CONNECTED: &str = "device-connected";

/// Wire name of the live measurement event.
pub const EVENT_SNAPPY_DATA: &str = "snappy-data";

/// Physical device attach/detach as observed by the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DevicePresenceEvent {
    pub connected: bool,
}

/// One live measurement pushed by the daemon.
///
/// Purely transient; the client never persists samples.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSample {
    /// MAC-like identifier of the originating device.
    #[serde(rename = "mac")]
    pub device_id: String,

    /// Integer measurement value.
    pub value: i64,

    /// UTC timestamp assigned by the daemon.
    pub timestamp: DateTime<Utc>,

    /// Optional product identifier.
    #[serde(rename = "pid", skip_serializing_if = "Option::is_none")]
    pub product_id: Option<i64>,

    /// Optional remote identifier.
    #[serde(rename = "remoteId", skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<i64>,
}

impl DeviceSample {
    /// Encode this sample back into its wire event shape.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_wire(&self) -> Result<Value, serde_json::Error> {
        let mut value = serde_json::to_value(self)?;
        if let Some(obj) = value.as_object_mut() {
            obj.insert(
                "event".to_string(),
                Value::String(EVENT_SNAPPY_DATA.to_string()),
            );
        }
        Ok(value)
    }
}

/// A parsed push frame.
#[derive(Debug, Clone, PartialEq)]
pub enum DaemonEvent {
    Presence(DevicePresenceEvent),
    Data(DeviceSample),
}

impl DaemonEvent {
    /// Try to parse a push event from an already-parsed frame.
    ///
    /// Returns `Ok(None)` if the frame carries no `event` field (it is
    /// a command response, not a push).
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown event name or a recognized event
    /// with a malformed body.
    pub fn parse(value: &Value) -> Result<Option<Self>, ProtoError> {
        let Some(name) = value.get("event").and_then(Value::as_str) else {
            return Ok(None);
        };

        match name {
            EVENT_DEVICE_CONNECTED => {
                // Status arrives as the string "true"/"false", not a bool.
                let status = value.get("status").and_then(Value::as_str).ok_or_else(|| {
                    ProtoError::MalformedEvent {
                        event: name.to_string(),
                        reason: "missing status".to_string(),
                    }
                })?;
                let connected = match status {
                    "true" => true,
                    "false" => false,
                    other => {
                        return Err(ProtoError::MalformedEvent {
                            event: name.to_string(),
                            reason: format!("unrecognized status {other:?}"),
                        });
                    }
                };
                Ok(Some(DaemonEvent::Presence(DevicePresenceEvent {
                    connected,
                })))
            }
            EVENT_SNAPPY_DATA => {
                let sample: DeviceSample =
                    serde_json::from_value(value.clone()).map_err(|e| {
                        ProtoError::MalformedEvent {
                            event: name.to_string(),
                            reason: e.to_string(),
                        }
                    })?;
                Ok(Some(DaemonEvent::Data(sample)))
            }
            other => Err(ProtoError::UnknownEvent(other.to_string())),
        }
    }

    /// Parse a push event from wire text.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not JSON or the event is
    /// unknown/malformed.
    pub fn parse_str(text: &str) -> Result<Option<Self>, ProtoError> {
        let value: Value = serde_json::from_str(text)?;
        Self::parse(&value)
    }
}

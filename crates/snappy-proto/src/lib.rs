//! Wire protocol definitions for the `snappy_web_agent` daemon.
//!
//! The daemon speaks a small JSON protocol over a persistent WebSocket:
//! acknowledgment-style command responses plus two kinds of unsolicited
//! push events. This crate provides the message types, the tolerant
//! envelope decoding the daemon's framing requires, and the error-code
//! vocabulary shared by every client operation.
//!
//! # Modules
//!
//! - [`command`]: command names, request envelope, and [`CommandResult`]
//! - [`event`]: push events ([`DeviceSample`], [`DevicePresenceEvent`])
//! - [`error_code`]: machine-readable failure codes

pub mod command;
pub mod error_code;
pub mod event;

pub use command::{
    CMD_DEVICE_INFO, CMD_START, CMD_STOP, CMD_VERSION, CommandRequest, CommandResult,
};
pub use event::{DaemonEvent, DevicePresenceEvent, DeviceSample};

/// Errors raised while decoding daemon frames.
#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("empty response envelope")]
    EmptyEnvelope,

    #[error("not a response envelope")]
    NotAnEnvelope,

    #[error("unknown event: {0}")]
    UnknownEvent(String),

    #[error("malformed {event} event: {reason}")]
    MalformedEvent { event: String, reason: String },
}

//! Machine-readable error codes carried in [`CommandResult::error`].
//!
//! Every expected failure mode of a client operation maps to exactly one
//! of these codes. Callers branch on the code and display the
//! accompanying message; none of these conditions is surfaced as a
//! panic or an `Err`.
//!
//! [`CommandResult::error`]: crate::CommandResult

/// Full port range exhausted without a validated handshake.
pub const DAEMON_NOT_FOUND: &str = "DAEMON_NOT_FOUND";

/// A daemon port was found but the transport-level connect failed or
/// timed out.
pub const CONNECTION_FAILED: &str = "CONNECTION_FAILED";

/// Call attempted while the channel is not connected.
pub const CONNECTION_ERROR: &str = "CONNECTION_ERROR";

/// Service-level operation attempted while the service is not connected.
pub const NOT_CONNECTED: &str = "NOT_CONNECTED";

/// No response arrived within the call deadline.
pub const TIMEOUT: &str = "TIMEOUT";

/// A reply could not be decoded into the expected envelope shape.
pub const PARSE_ERROR: &str = "PARSE_ERROR";

/// Transmission of a request failed at the transport layer.
pub const SEND_ERROR: &str = "SEND_ERROR";

/// A previously-good daemon is no longer reachable and automatic
/// reconnection failed.
pub const DAEMON_LOST: &str = "DAEMON_LOST";

/// Operation invoked after the service was torn down.
pub const SERVICE_DISPOSED: &str = "SERVICE_DISPOSED";

/// Current platform has no client implementation.
pub const UNSUPPORTED_PLATFORM: &str = "UNSUPPORTED_PLATFORM";

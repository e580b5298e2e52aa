//! Client configuration.
//!
//! The daemon contract fixes the interesting values (loopback host, port
//! range 8436-8535); the timeouts have recommended defaults but are kept
//! overridable so tests and embedders can tighten them.

use std::ops::RangeInclusive;
use std::time::Duration;

/// First TCP port the daemon may listen on.
pub const DAEMON_PORT_FIRST: u16 = 8436;

/// Last TCP port the daemon may listen on (inclusive).
pub const DAEMON_PORT_LAST: u16 = 8535;

/// The daemon only ever binds loopback.
pub const DAEMON_HOST: &str = "127.0.0.1";

/// Tunables for discovery, connection, and health monitoring.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Host the daemon listens on.
    pub host: String,

    /// Candidate ports, scanned in ascending order.
    pub port_range: RangeInclusive<u16>,

    /// Bound on a single port probe (transport connect + handshake).
    pub probe_timeout: Duration,

    /// Bound on establishing the persistent channel.
    pub connect_timeout: Duration,

    /// Bound on a single command call awaiting its acknowledgment.
    pub call_timeout: Duration,

    /// Period of the supervisor's daemon health check.
    pub health_interval: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            host: DAEMON_HOST.to_string(),
            port_range: DAEMON_PORT_FIRST..=DAEMON_PORT_LAST,
            probe_timeout: Duration::from_secs(3),
            connect_timeout: Duration::from_secs(10),
            call_timeout: Duration::from_secs(10),
            health_interval: Duration::from_secs(20),
        }
    }
}

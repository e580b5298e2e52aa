//! Public entry point.
//!
//! [`SnappyLink`] is an explicit context object: applications construct
//! one at startup, hold it for the lifetime of their daemon session, and
//! dispose it on shutdown. There is no global instance; two links are
//! two independent services.

use std::time::Instant;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use snappy_proto::{CMD_VERSION, CommandResult, DeviceSample};

use crate::channel::DaemonChannel;
use crate::config::LinkConfig;
use crate::locator;
use crate::supervisor::{LinkSupervisor, ServiceStatus};

/// Outcome of one diagnostic phase.
#[derive(Debug, Clone, Serialize)]
pub struct PhaseReport {
    pub success: bool,
    pub elapsed_ms: u64,
}

impl PhaseReport {
    fn measure(success: bool, started: Instant) -> Self {
        Self {
            success,
            elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        }
    }

    fn skipped() -> Self {
        Self {
            success: false,
            elapsed_ms: 0,
        }
    }
}

/// Full connectivity diagnostic: which phase failed and how long each
/// one took. Produced by [`SnappyLink::test_connection`].
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionReport {
    pub daemon_found: bool,
    pub port: Option<u16>,
    pub version_string: Option<String>,
    pub locate: PhaseReport,
    pub connect: PhaseReport,
    pub version: PhaseReport,
}

impl ConnectionReport {
    #[must_use]
    pub fn healthy(&self) -> bool {
        self.locate.success && self.connect.success && self.version.success
    }
}

/// Handle to one monitored daemon connection.
///
/// Thin shell over the supervisor: every operation delegates, and the
/// streams are the supervisor's streams. Cloning shares the service.
#[derive(Clone)]
pub struct SnappyLink {
    supervisor: LinkSupervisor,
}

impl SnappyLink {
    #[must_use]
    pub fn new(config: LinkConfig) -> Self {
        Self {
            supervisor: LinkSupervisor::new(config),
        }
    }

    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(LinkConfig::default())
    }

    #[must_use]
    pub fn config(&self) -> &LinkConfig {
        self.supervisor.config()
    }

    /// Service-level connectivity stream.
    #[must_use]
    pub fn status(&self) -> broadcast::Receiver<ServiceStatus> {
        self.supervisor.status()
    }

    /// Device attach/detach stream.
    #[must_use]
    pub fn presence(&self) -> broadcast::Receiver<bool> {
        self.supervisor.presence()
    }

    /// Live measurement stream.
    #[must_use]
    pub fn data(&self) -> broadcast::Receiver<DeviceSample> {
        self.supervisor.data()
    }

    /// Whether the monitored connection is currently up.
    pub async fn is_service_available(&self) -> bool {
        self.supervisor.is_connected().await
    }

    /// Discover the daemon and bring up the monitored connection.
    ///
    /// A concurrent `disconnect`/`dispose` cancels the discovery scan
    /// and this call resolves as a failure instead of waiting it out.
    pub async fn connect(&self) -> CommandResult {
        self.supervisor.connect().await
    }

    /// Tear the connection down without invalidating the link.
    pub async fn disconnect(&self) {
        self.supervisor.disconnect().await;
    }

    /// Tear down and invalidate. Idempotent; every later operation
    /// returns `SERVICE_DISPOSED`.
    pub async fn dispose(&self) {
        self.supervisor.dispose().await;
    }

    pub async fn start_collection(&self) -> CommandResult {
        self.supervisor.start_collection().await
    }

    pub async fn stop_collection(&self) -> CommandResult {
        self.supervisor.stop_collection().await
    }

    pub async fn daemon_version(&self) -> CommandResult {
        self.supervisor.version().await
    }

    pub async fn device_info(&self) -> CommandResult {
        self.supervisor.device_info().await
    }

    /// One-shot connectivity diagnostic, independent of the monitored
    /// connection. Runs locate, a throwaway handshake, and a `version`
    /// exchange, timing each phase. Never touches the supervisor's
    /// state.
    pub async fn test_connection(&self) -> ConnectionReport {
        let config = self.supervisor.config();

        let started = Instant::now();
        let located = locator::locate(config).await;
        let locate = PhaseReport::measure(located.is_some(), started);

        let Some(address) = located else {
            debug!("diagnostic: no daemon located");
            return ConnectionReport {
                daemon_found: false,
                port: None,
                version_string: None,
                locate,
                connect: PhaseReport::skipped(),
                version: PhaseReport::skipped(),
            };
        };

        // A throwaway channel, so the diagnostic cannot disturb any
        // live monitored connection.
        let channel = DaemonChannel::new(address.clone(), config);

        let started = Instant::now();
        let connected = channel.connect(config.connect_timeout).await;
        let connect = PhaseReport::measure(connected.is_ok(), started);

        if let Err(e) = connected {
            debug!("diagnostic: connect to port {} failed: {e}", address.port);
            return ConnectionReport {
                daemon_found: true,
                port: Some(address.port),
                version_string: Some(address.protocol_version),
                locate,
                connect,
                version: PhaseReport::skipped(),
            };
        }

        let started = Instant::now();
        let result = channel.call(CMD_VERSION, None).await;
        let version = PhaseReport::measure(result.success, started);
        channel.disconnect().await;

        ConnectionReport {
            daemon_found: true,
            port: Some(address.port),
            version_string: if result.success {
                Some(result.message)
            } else {
                Some(address.protocol_version)
            },
            locate,
            connect,
            version,
        }
    }
}

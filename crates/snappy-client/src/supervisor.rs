//! Recovery and health monitoring above the transport channel.
//!
//! Turns a one-shot locator + channel into a durable service: the
//! supervisor discovers the daemon, keeps one channel alive, probes the
//! daemon on a timer, and drives full re-discovery when it disappears
//! (the daemon may restart on a different port). Its status stream is
//! the stable service-level connectivity signal; it does not flap on
//! every transport hiccup, and a loss that recovery cannot repair is
//! reported as the distinguishable [`ServiceStatus::DaemonLost`].

use std::sync::Arc;

use tokio::sync::{Mutex, broadcast};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use snappy_proto::{
    CMD_DEVICE_INFO, CMD_START, CMD_STOP, CMD_VERSION, CommandResult, DeviceSample, error_code,
};

use crate::channel::{ChannelError, DaemonChannel};
use crate::config::LinkConfig;
use crate::locator::{self, DaemonAddress};

/// Capacity of the outward-facing broadcast streams.
const EVENT_BUFFER: usize = 256;

/// Logical command name used for supervisor-level results.
const OP_CONNECT: &str = "connect";

/// Service-level connectivity.
///
/// `DaemonLost` is terminal for one recovery attempt, not for the
/// service: the health timer keeps trying on subsequent ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    Connected,
    Disconnected,
    DaemonLost,
}

impl ServiceStatus {
    #[must_use]
    pub fn is_connected(self) -> bool {
        self == ServiceStatus::Connected
    }
}

struct Inner {
    channel: Option<Arc<DaemonChannel>>,
    address: Option<DaemonAddress>,
    /// In-flight discovery scan; aborted by teardown so a disconnect
    /// issued mid-scan does not wait out the whole port range.
    scan: Option<AbortHandle>,
    health: Option<JoinHandle<()>>,
    forwarders: Vec<JoinHandle<()>>,
    /// Bumped on every teardown; a connect attempt that resumes after
    /// its scan re-checks this and stands down if it was superseded.
    epoch: u64,
    last_status: ServiceStatus,
    disposed: bool,
}

struct Shared {
    inner: Mutex<Inner>,
    status_tx: broadcast::Sender<ServiceStatus>,
    presence_tx: broadcast::Sender<bool>,
    data_tx: broadcast::Sender<DeviceSample>,
}

/// Orchestrates the locator and channel into a monitored connection.
///
/// Cheap to clone; clones share the same underlying service state.
#[derive(Clone)]
pub struct LinkSupervisor {
    config: LinkConfig,
    shared: Arc<Shared>,
}

impl LinkSupervisor {
    #[must_use]
    pub fn new(config: LinkConfig) -> Self {
        let (status_tx, _) = broadcast::channel(EVENT_BUFFER);
        let (presence_tx, _) = broadcast::channel(EVENT_BUFFER);
        let (data_tx, _) = broadcast::channel(EVENT_BUFFER);

        Self {
            config,
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    channel: None,
                    address: None,
                    scan: None,
                    health: None,
                    forwarders: Vec::new(),
                    epoch: 0,
                    last_status: ServiceStatus::Disconnected,
                    disposed: false,
                }),
                status_tx,
                presence_tx,
                data_tx,
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Service-level connectivity events.
    #[must_use]
    pub fn status(&self) -> broadcast::Receiver<ServiceStatus> {
        self.shared.status_tx.subscribe()
    }

    /// Device attach/detach events, forwarded from the live channel.
    #[must_use]
    pub fn presence(&self) -> broadcast::Receiver<bool> {
        self.shared.presence_tx.subscribe()
    }

    /// Live measurements, forwarded from the live channel.
    #[must_use]
    pub fn data(&self) -> broadcast::Receiver<DeviceSample> {
        self.shared.data_tx.subscribe()
    }

    pub async fn is_connected(&self) -> bool {
        self.shared.inner.lock().await.last_status.is_connected()
    }

    /// Discover the daemon and establish the monitored connection.
    ///
    /// Tears down any previous state first, so calling it again is
    /// always safe. The discovery scan runs without holding the
    /// supervisor's state lock; a concurrent `disconnect`/`dispose`
    /// cancels it and this call resolves as a failure instead of
    /// waiting out the port range. On success the result message
    /// carries the daemon's version string and the health timer is
    /// running.
    pub async fn connect(&self) -> CommandResult {
        // The daemon only ships for desktop operating systems.
        if !cfg!(any(target_os = "linux", target_os = "macos", target_os = "windows")) {
            return CommandResult::failure(
                OP_CONNECT,
                error_code::UNSUPPORTED_PLATFORM,
                "the daemon is not available on this platform",
            );
        }

        let (scan, epoch) = {
            let mut inner = self.shared.inner.lock().await;
            if inner.disposed {
                return disposed_result(OP_CONNECT);
            }

            self.teardown(&mut inner, true).await;

            // The "searching" state; subscribers always see it before a
            // verdict, even if the last known state was also disconnected.
            inner.last_status = ServiceStatus::Disconnected;
            let _ = self.shared.status_tx.send(ServiceStatus::Disconnected);

            (self.spawn_scan(&mut inner), inner.epoch)
        };

        let Ok(located) = scan.await else {
            return self.cancelled_result().await;
        };

        let mut inner = self.shared.inner.lock().await;
        inner.scan = None;
        if inner.disposed {
            return disposed_result(OP_CONNECT);
        }
        if inner.epoch != epoch {
            return cancelled_failure();
        }

        let Some(address) = located else {
            return CommandResult::failure(
                OP_CONNECT,
                error_code::DAEMON_NOT_FOUND,
                format!(
                    "no daemon found on ports {}-{}",
                    self.config.port_range.start(),
                    self.config.port_range.end()
                ),
            );
        };

        match self.establish(&mut inner, &address).await {
            Ok(()) => {
                self.emit(&mut inner, ServiceStatus::Connected);
                inner.health = Some(self.spawn_health_loop());
                info!(
                    "connected to daemon v{} on port {}",
                    address.protocol_version, address.port
                );
                CommandResult::ok(OP_CONNECT, address.protocol_version)
            }
            Err(e) => CommandResult::failure(
                OP_CONNECT,
                error_code::CONNECTION_FAILED,
                format!(
                    "daemon on port {} did not accept the connection: {e}",
                    address.port
                ),
            ),
        }
    }

    /// Tear the service down. Always succeeds; teardown errors are
    /// swallowed. Cancels any discovery scan still in flight.
    pub async fn disconnect(&self) {
        let mut inner = self.shared.inner.lock().await;
        self.teardown(&mut inner, true).await;
        self.emit(&mut inner, ServiceStatus::Disconnected);
    }

    /// Tear down and invalidate the supervisor. Subsequent operations
    /// return `SERVICE_DISPOSED`.
    pub async fn dispose(&self) {
        let mut inner = self.shared.inner.lock().await;
        self.teardown(&mut inner, true).await;
        self.emit(&mut inner, ServiceStatus::Disconnected);
        inner.disposed = true;
    }

    pub async fn start_collection(&self) -> CommandResult {
        self.passthrough(CMD_START).await
    }

    pub async fn stop_collection(&self) -> CommandResult {
        self.passthrough(CMD_STOP).await
    }

    pub async fn version(&self) -> CommandResult {
        self.passthrough(CMD_VERSION).await
    }

    pub async fn device_info(&self) -> CommandResult {
        self.passthrough(CMD_DEVICE_INFO).await
    }

    async fn passthrough(&self, command: &str) -> CommandResult {
        let channel = {
            let inner = self.shared.inner.lock().await;
            if inner.disposed {
                return disposed_result(command);
            }
            if !inner.last_status.is_connected() {
                return CommandResult::failure(
                    command,
                    error_code::NOT_CONNECTED,
                    "service is not connected",
                );
            }
            inner.channel.clone()
        };

        match channel {
            Some(channel) => channel.call(command, None).await,
            None => CommandResult::failure(
                command,
                error_code::NOT_CONNECTED,
                "service is not connected",
            ),
        }
    }

    /// Spawn the discovery scan as its own task and register its abort
    /// handle, so teardown can cancel it while the caller awaits the
    /// result without holding the lock.
    fn spawn_scan(&self, inner: &mut Inner) -> JoinHandle<Option<DaemonAddress>> {
        let config = self.config.clone();
        let handle = tokio::spawn(async move { locator::locate(&config).await });
        inner.scan = Some(handle.abort_handle());
        handle
    }

    /// Failure reported when a scan was aborted underneath a connect
    /// attempt; reports disposal if that is what ended it.
    async fn cancelled_result(&self) -> CommandResult {
        if self.shared.inner.lock().await.disposed {
            disposed_result(OP_CONNECT)
        } else {
            cancelled_failure()
        }
    }

    /// Bring up a channel to a located address and wire its streams
    /// outward. Caller holds the inner lock.
    async fn establish(&self, inner: &mut Inner, address: &DaemonAddress) -> Result<(), ChannelError> {
        let channel = Arc::new(DaemonChannel::new(address.clone(), &self.config));

        // Subscribe before connecting so no push event is lost in the
        // race between connect and subscribe.
        inner
            .forwarders
            .push(forward(channel.presence(), self.shared.presence_tx.clone()));
        inner
            .forwarders
            .push(forward(channel.data(), self.shared.data_tx.clone()));
        inner
            .forwarders
            .push(self.watch_channel_status(channel.status()));

        if let Err(e) = channel.connect(self.config.connect_timeout).await {
            for task in inner.forwarders.drain(..) {
                task.abort();
            }
            return Err(e);
        }

        inner.channel = Some(channel);
        inner.address = Some(address.clone());
        Ok(())
    }

    /// Flip the service status to `Disconnected` when the channel's
    /// transport drops underneath us. Recovery itself waits for the
    /// health timer.
    fn watch_channel_status(&self, mut rx: broadcast::Receiver<bool>) -> JoinHandle<()> {
        let supervisor = self.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!("channel transport dropped");
                        let mut inner = supervisor.shared.inner.lock().await;
                        supervisor.emit(&mut inner, ServiceStatus::Disconnected);
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn spawn_health_loop(&self) -> JoinHandle<()> {
        let supervisor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(supervisor.config.health_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // interval() fires immediately; the daemon was just
            // validated, so skip the zeroth tick.
            ticker.tick().await;

            loop {
                ticker.tick().await;

                let (address, channel) = {
                    let inner = supervisor.shared.inner.lock().await;
                    (inner.address.clone(), inner.channel.clone())
                };
                let Some(address) = address else { break };

                // A daemon restart can leave the probe healthy while the
                // persistent transport is dead, so both are checked.
                let transport_up = match &channel {
                    Some(channel) => channel.is_connected().await,
                    None => false,
                };
                if transport_up && locator::probe_health(&supervisor.config, &address).await {
                    trace!("health check passed for port {}", address.port);
                    continue;
                }

                warn!(
                    "daemon on port {} stopped responding; attempting recovery",
                    address.port
                );
                supervisor.recover().await;
            }
        })
    }

    /// One full recovery cycle: teardown, re-discovery, reconnect.
    /// Exactly one attempt per health tick; a failed attempt reports
    /// `DaemonLost` and leaves the next try to the next tick. Like
    /// `connect`, the rescan runs outside the lock so disposal is not
    /// blocked behind it.
    async fn recover(&self) {
        let (scan, epoch) = {
            let mut inner = self.shared.inner.lock().await;
            if inner.disposed {
                return;
            }
            self.emit(&mut inner, ServiceStatus::Disconnected);
            self.teardown(&mut inner, false).await;
            (self.spawn_scan(&mut inner), inner.epoch)
        };

        let Ok(located) = scan.await else {
            return;
        };

        let mut inner = self.shared.inner.lock().await;
        inner.scan = None;
        if inner.disposed || inner.epoch != epoch {
            return;
        }

        match located {
            Some(address) => match self.establish(&mut inner, &address).await {
                Ok(()) => {
                    info!(
                        "recovered daemon v{} on port {}",
                        address.protocol_version, address.port
                    );
                    self.emit(&mut inner, ServiceStatus::Connected);
                }
                Err(e) => {
                    warn!("recovery reconnect failed: {e}; daemon lost until next health tick");
                    self.emit(&mut inner, ServiceStatus::DaemonLost);
                }
            },
            None => {
                warn!("recovery found no daemon; lost until next health tick");
                self.emit(&mut inner, ServiceStatus::DaemonLost);
            }
        }
    }

    /// Drop scan, channel, forwarders, and (unless called from the
    /// health task itself) the health timer.
    async fn teardown(&self, inner: &mut Inner, stop_health: bool) {
        inner.epoch = inner.epoch.wrapping_add(1);

        if let Some(scan) = inner.scan.take() {
            scan.abort();
        }

        if stop_health
            && let Some(health) = inner.health.take()
        {
            health.abort();
        }

        // Forwarders first, so a deliberate channel close is not
        // reported as a transport drop.
        for task in inner.forwarders.drain(..) {
            task.abort();
        }

        if let Some(channel) = inner.channel.take() {
            channel.disconnect().await;
        }
        inner.address = None;
    }

    /// Emit a status transition, suppressing consecutive duplicates so
    /// subscribers never see true-to-true across a detected loss.
    fn emit(&self, inner: &mut Inner, status: ServiceStatus) {
        if inner.last_status == status {
            return;
        }
        inner.last_status = status;
        let _ = self.shared.status_tx.send(status);
    }
}

/// Pipe one broadcast stream into another, isolating slow subscribers.
fn forward<T: Clone + Send + 'static>(
    mut rx: broadcast::Receiver<T>,
    tx: broadcast::Sender<T>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(item) => {
                    let _ = tx.send(item);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("event forwarder lagged; {skipped} events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn cancelled_failure() -> CommandResult {
    CommandResult::failure(
        OP_CONNECT,
        error_code::CONNECTION_FAILED,
        "connection attempt cancelled by disconnect",
    )
}

fn disposed_result(command: &str) -> CommandResult {
    CommandResult::failure(
        command,
        error_code::SERVICE_DISPOSED,
        "service has been disposed",
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_config() -> LinkConfig {
        // A port that is almost certainly closed: bind-then-drop.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        LinkConfig {
            port_range: port..=port,
            probe_timeout: Duration::from_millis(200),
            connect_timeout: Duration::from_millis(200),
            call_timeout: Duration::from_millis(200),
            health_interval: Duration::from_millis(100),
            ..LinkConfig::default()
        }
    }

    #[test]
    fn test_service_status_is_connected() {
        assert!(ServiceStatus::Connected.is_connected());
        assert!(!ServiceStatus::Disconnected.is_connected());
        assert!(!ServiceStatus::DaemonLost.is_connected());
    }

    #[tokio::test]
    async fn test_connect_without_daemon_reports_not_found() {
        let supervisor = LinkSupervisor::new(test_config());
        let mut status = supervisor.status();

        let result = supervisor.connect().await;
        assert!(!result.success);
        assert_eq!(result.error_code(), Some(error_code::DAEMON_NOT_FOUND));
        assert!(result.message.contains("no daemon found"));

        // Exactly the "searching" event, no spurious Connected.
        assert_eq!(status.recv().await.unwrap(), ServiceStatus::Disconnected);
        assert!(status.try_recv().is_err());
        assert!(!supervisor.is_connected().await);
    }

    #[tokio::test]
    async fn test_passthrough_while_disconnected() {
        let supervisor = LinkSupervisor::new(test_config());

        for (result, command) in [
            (supervisor.start_collection().await, CMD_START),
            (supervisor.stop_collection().await, CMD_STOP),
            (supervisor.version().await, CMD_VERSION),
            (supervisor.device_info().await, CMD_DEVICE_INFO),
        ] {
            assert!(!result.success);
            assert_eq!(result.error_code(), Some(error_code::NOT_CONNECTED));
            assert_eq!(result.command, command);
        }
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let supervisor = LinkSupervisor::new(test_config());
        supervisor.disconnect().await;
        supervisor.disconnect().await;
        assert!(!supervisor.is_connected().await);
    }

    #[tokio::test]
    async fn test_operations_after_dispose() {
        let supervisor = LinkSupervisor::new(test_config());
        supervisor.dispose().await;

        let result = supervisor.connect().await;
        assert_eq!(result.error_code(), Some(error_code::SERVICE_DISPOSED));

        let result = supervisor.start_collection().await;
        assert_eq!(result.error_code(), Some(error_code::SERVICE_DISPOSED));
    }

    #[tokio::test]
    async fn test_status_dedupes_consecutive_duplicates() {
        let supervisor = LinkSupervisor::new(test_config());
        let mut status = supervisor.status();

        supervisor.disconnect().await;
        supervisor.disconnect().await;

        // last_status started Disconnected, so no event at all.
        assert!(status.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnect_cancels_in_flight_scan() {
        // A listener that accepts but never speaks WebSocket, so every
        // probe against it runs into its full timeout.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let guard = tokio::spawn(async move {
            let mut held = Vec::new();
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                held.push(stream);
            }
        });

        let supervisor = LinkSupervisor::new(LinkConfig {
            port_range: port..=port,
            probe_timeout: Duration::from_secs(5),
            ..LinkConfig::default()
        });

        let connecting = tokio::spawn({
            let supervisor = supervisor.clone();
            async move { supervisor.connect().await }
        });
        // Let the scan reach the hanging probe.
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Disconnect must not wait out the probe timeout.
        let started = std::time::Instant::now();
        supervisor.disconnect().await;
        assert!(started.elapsed() < Duration::from_millis(500));

        // And the cancelled connect resolves promptly as a failure.
        let result = tokio::time::timeout(Duration::from_millis(500), connecting)
            .await
            .expect("connect resolves after cancellation")
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.error_code(), Some(error_code::CONNECTION_FAILED));

        guard.abort();
    }

    #[tokio::test]
    async fn test_dispose_cancels_in_flight_scan() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let guard = tokio::spawn(async move {
            let mut held = Vec::new();
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                held.push(stream);
            }
        });

        let supervisor = LinkSupervisor::new(LinkConfig {
            port_range: port..=port,
            probe_timeout: Duration::from_secs(5),
            ..LinkConfig::default()
        });

        let connecting = tokio::spawn({
            let supervisor = supervisor.clone();
            async move { supervisor.connect().await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        supervisor.dispose().await;

        let result = tokio::time::timeout(Duration::from_millis(500), connecting)
            .await
            .expect("connect resolves after disposal")
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.error_code(), Some(error_code::SERVICE_DISPOSED));

        guard.abort();
    }
}

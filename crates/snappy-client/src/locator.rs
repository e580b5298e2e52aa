//! Daemon discovery over the fixed loopback port range.
//!
//! The daemon binds whichever port in 8436-8535 is free at startup, so
//! the client has no prior knowledge of the port in use. [`locate`]
//! scans the range in ascending order, validating each candidate with a
//! `version` handshake before accepting it. [`probe_health`] re-runs the
//! same handshake against a known address without rescanning.

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace};

use snappy_proto::{CMD_VERSION, CommandRequest, CommandResult};

use crate::config::LinkConfig;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A validated daemon endpoint.
///
/// Immutable once constructed; the supervisor holds one for the
/// lifetime of a connection attempt and discards it on disconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonAddress {
    pub host: String,
    pub port: u16,
    /// Version string the daemon reported during the handshake.
    pub protocol_version: String,
    pub discovered_at: DateTime<Utc>,
}

impl DaemonAddress {
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16, protocol_version: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            protocol_version: protocol_version.into(),
            discovered_at: Utc::now(),
        }
    }

    /// WebSocket URL for this endpoint.
    #[must_use]
    pub fn ws_url(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }
}

/// Reasons a single port probe fails. Never fatal for the scan; the
/// locator just moves on to the next candidate.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("WebSocket error: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed handshake response")]
    Malformed,

    #[error("listener is not a snappy daemon")]
    Rejected,

    #[error("connection closed before handshake completed")]
    ClosedEarly,

    #[error("probe timed out")]
    Timeout,
}

/// Scan the configured port range for a daemon, ascending.
///
/// Short-circuits on the first port that passes the handshake; ports
/// after it are never probed. Exhausting the range is a legitimate
/// negative result, not an error.
pub async fn locate(config: &LinkConfig) -> Option<DaemonAddress> {
    for port in config.port_range.clone() {
        match probe(config, port).await {
            Ok(version) => {
                info!("daemon v{version} found on port {port}");
                return Some(DaemonAddress::new(config.host.clone(), port, version));
            }
            Err(e) => trace!("port {port}: {e}"),
        }
    }

    debug!(
        "no daemon found on ports {}-{}",
        config.port_range.start(),
        config.port_range.end()
    );
    None
}

/// Re-validate a previously discovered address with the same handshake.
///
/// Used by the supervisor's periodic health check; a fresh short-lived
/// socket is opened for each probe so a half-open persistent connection
/// cannot mask a dead daemon.
pub async fn probe_health(config: &LinkConfig, address: &DaemonAddress) -> bool {
    match probe(config, address.port).await {
        Ok(version) => {
            trace!("daemon on port {} healthy (v{version})", address.port);
            true
        }
        Err(e) => {
            debug!("daemon on port {} failed health probe: {e}", address.port);
            false
        }
    }
}

/// One timeout-bounded probe: transport connect plus `version` handshake.
async fn probe(config: &LinkConfig, port: u16) -> Result<String, HandshakeError> {
    tokio::time::timeout(config.probe_timeout, handshake(&config.host, port))
        .await
        .map_err(|_| HandshakeError::Timeout)?
}

async fn handshake(host: &str, port: u16) -> Result<String, HandshakeError> {
    let url = format!("ws://{host}:{port}");
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await?;

    let outcome = exchange_version(&mut ws).await;

    // Probe sockets are torn down whether or not they validated, so
    // repeated scans cannot leak descriptors.
    let _ = ws.close(None).await;

    outcome
}

/// Send `version` and wait for its acknowledgment on an open socket.
async fn exchange_version(ws: &mut WsStream) -> Result<String, HandshakeError> {
    let request = CommandRequest::new(CMD_VERSION).to_json()?;
    ws.send(WsMessage::Text(request)).await?;

    while let Some(frame) = ws.next().await {
        let text = match frame? {
            WsMessage::Text(text) => text,
            WsMessage::Close(_) => return Err(HandshakeError::ClosedEarly),
            _ => continue,
        };

        let value: Value =
            serde_json::from_str(&text).map_err(|_| HandshakeError::Malformed)?;

        // A chatty daemon may push events before acknowledging.
        if value.get("event").is_some() {
            continue;
        }

        let result = CommandResult::decode(&value).map_err(|_| HandshakeError::Malformed)?;
        if result.command == CMD_VERSION && result.success && !result.message.is_empty() {
            return Ok(result.message);
        }
        return Err(HandshakeError::Rejected);
    }

    Err(HandshakeError::ClosedEarly)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_address_ws_url() {
        let address = DaemonAddress::new("127.0.0.1", 8440, "2.1.0");
        assert_eq!(address.ws_url(), "ws://127.0.0.1:8440");
    }

    #[test]
    fn test_address_carries_version_and_timestamp() {
        let before = Utc::now();
        let address = DaemonAddress::new("127.0.0.1", 8436, "1.0.0");
        assert_eq!(address.protocol_version, "1.0.0");
        assert!(address.discovered_at >= before);
        assert!(address.discovered_at <= Utc::now());
    }

    #[test]
    fn test_handshake_error_display() {
        assert_eq!(HandshakeError::Timeout.to_string(), "probe timed out");
        assert_eq!(
            HandshakeError::Rejected.to_string(),
            "listener is not a snappy daemon"
        );
        assert!(
            HandshakeError::ClosedEarly
                .to_string()
                .contains("before handshake")
        );
    }

    #[tokio::test]
    async fn test_locate_empty_range_of_closed_ports() {
        // Bind-then-drop to find ports that are almost certainly closed.
        let closed = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let config = LinkConfig {
            port_range: closed..=closed,
            probe_timeout: Duration::from_millis(200),
            ..LinkConfig::default()
        };

        assert!(locate(&config).await.is_none());
    }

    #[tokio::test]
    async fn test_locate_rejects_non_daemon_listener() {
        // A raw TCP listener that never completes the WebSocket upgrade.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let guard = tokio::spawn(async move {
            // Accept and hold connections open without speaking WebSocket.
            let mut held = Vec::new();
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                held.push(stream);
            }
        });

        let config = LinkConfig {
            port_range: port..=port,
            probe_timeout: Duration::from_millis(200),
            ..LinkConfig::default()
        };

        assert!(locate(&config).await.is_none());
        guard.abort();
    }
}

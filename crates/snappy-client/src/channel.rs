//! Persistent bidirectional channel to one validated daemon address.
//!
//! Owns exactly one WebSocket at a time and layers two things on top of
//! it: acknowledgment correlation for command calls, and fan-out of the
//! daemon's unsolicited push events to broadcast subscribers.
//!
//! The wire protocol carries no correlation id; responses echo only the
//! command name. Correlation therefore keys the pending-call table by
//! command name and enforces at most one outstanding call per command
//! with a per-command async lock, so a reply can never be attributed to
//! the wrong caller.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace, warn};

use snappy_proto::{CommandRequest, CommandResult, DaemonEvent, DeviceSample, error_code};

use crate::config::LinkConfig;
use crate::locator::DaemonAddress;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, WsMessage>;
type WsSource = SplitStream<WsStream>;

/// Capacity of each broadcast stream. Lagging subscribers lose events
/// rather than blocking delivery to others.
const EVENT_BUFFER: usize = 256;

/// A settled or in-flight acknowledgment for one command.
type PendingReply = oneshot::Sender<Result<CommandResult, ChannelError>>;

/// Transport lifecycle. Transitions are strictly sequential; only one
/// connection attempt may be in flight per channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Errors internal to the channel. Expected failures never escape
/// [`DaemonChannel::call`]; they are mapped to `CommandResult` codes at
/// that boundary.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("WebSocket error: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("connect timed out")]
    ConnectTimeout,

    #[error("channel is {0:?}; connect requires Disconnected")]
    NotDisconnected(ChannelState),

    #[error("connection closed")]
    Closed,

    #[error("undecodable reply: {0}")]
    Parse(#[from] snappy_proto::ProtoError),
}

/// One persistent connection to one [`DaemonAddress`].
pub struct DaemonChannel {
    address: DaemonAddress,
    call_timeout: Duration,
    state: Arc<Mutex<ChannelState>>,
    sink: Arc<Mutex<Option<WsSink>>>,
    pending: Arc<Mutex<HashMap<String, PendingReply>>>,
    call_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    status_tx: broadcast::Sender<bool>,
    presence_tx: broadcast::Sender<bool>,
    data_tx: broadcast::Sender<DeviceSample>,
}

impl DaemonChannel {
    #[must_use]
    pub fn new(address: DaemonAddress, config: &LinkConfig) -> Self {
        let (status_tx, _) = broadcast::channel(EVENT_BUFFER);
        let (presence_tx, _) = broadcast::channel(EVENT_BUFFER);
        let (data_tx, _) = broadcast::channel(EVENT_BUFFER);

        Self {
            address,
            call_timeout: config.call_timeout,
            state: Arc::new(Mutex::new(ChannelState::Disconnected)),
            sink: Arc::new(Mutex::new(None)),
            pending: Arc::new(Mutex::new(HashMap::new())),
            call_locks: Mutex::new(HashMap::new()),
            reader: Mutex::new(None),
            status_tx,
            presence_tx,
            data_tx,
        }
    }

    #[must_use]
    pub fn address(&self) -> &DaemonAddress {
        &self.address
    }

    pub async fn state(&self) -> ChannelState {
        *self.state.lock().await
    }

    pub async fn is_connected(&self) -> bool {
        self.state().await == ChannelState::Connected
    }

    /// Transport-level connectivity events for this channel only.
    #[must_use]
    pub fn status(&self) -> broadcast::Receiver<bool> {
        self.status_tx.subscribe()
    }

    /// Device attach/detach push events.
    #[must_use]
    pub fn presence(&self) -> broadcast::Receiver<bool> {
        self.presence_tx.subscribe()
    }

    /// Live measurement push events.
    #[must_use]
    pub fn data(&self) -> broadcast::Receiver<DeviceSample> {
        self.data_tx.subscribe()
    }

    /// Open the transport and wait for the upgrade to complete.
    ///
    /// Resolves only once the WebSocket upgrade succeeds (the transport
    /// acknowledgment) or `timeout` elapses. A failed attempt returns
    /// the channel to `Disconnected` with its previous transport fully
    /// disposed, so a retry starts clean.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::NotDisconnected`] if a connection is
    /// already live or in flight, [`ChannelError::ConnectTimeout`] on
    /// expiry, or the underlying transport error.
    pub async fn connect(&self, timeout: Duration) -> Result<(), ChannelError> {
        {
            let mut state = self.state.lock().await;
            if *state != ChannelState::Disconnected {
                return Err(ChannelError::NotDisconnected(*state));
            }
            *state = ChannelState::Connecting;
        }

        // Dispose whatever a previous failed attempt may have left.
        self.dispose_transport().await;

        let url = self.address.ws_url();
        let attempt = tokio::time::timeout(timeout, tokio_tungstenite::connect_async(&url)).await;

        let ws = match attempt {
            Ok(Ok((ws, _response))) => ws,
            Ok(Err(e)) => {
                debug!("connect to {url} failed: {e}");
                self.mark_disconnected().await;
                return Err(e.into());
            }
            Err(_) => {
                debug!("connect to {url} timed out");
                self.mark_disconnected().await;
                return Err(ChannelError::ConnectTimeout);
            }
        };

        let (sink, source) = ws.split();
        *self.sink.lock().await = Some(sink);

        let handle = tokio::spawn(read_loop(
            source,
            Arc::clone(&self.pending),
            Arc::clone(&self.state),
            self.status_tx.clone(),
            self.presence_tx.clone(),
            self.data_tx.clone(),
        ));
        *self.reader.lock().await = Some(handle);

        *self.state.lock().await = ChannelState::Connected;
        let _ = self.status_tx.send(true);
        trace!("channel to {url} connected");
        Ok(())
    }

    /// Send one command and await its acknowledgment.
    ///
    /// Always produces a `CommandResult`; expected failures come back
    /// as result codes, and every pending completion settles exactly
    /// once.
    pub async fn call(&self, command: &str, payload: Option<Value>) -> CommandResult {
        if !self.is_connected().await {
            return CommandResult::failure(
                command,
                error_code::CONNECTION_ERROR,
                "channel is not connected",
            );
        }

        // Serialize calls that share a command name; see module docs.
        let lock = self.command_lock(command).await;
        let _guard = lock.lock().await;

        let request = CommandRequest {
            command: command.to_string(),
            payload,
        };
        let text = match request.to_json() {
            Ok(text) => text,
            Err(e) => {
                return CommandResult::failure(
                    command,
                    error_code::SEND_ERROR,
                    format!("failed to encode request: {e}"),
                );
            }
        };

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(command.to_string(), tx);

        let sent = {
            let mut sink = self.sink.lock().await;
            match sink.as_mut() {
                Some(sink) => sink.send(WsMessage::Text(text)).await,
                None => Err(tokio_tungstenite::tungstenite::Error::ConnectionClosed),
            }
        };
        if let Err(e) = sent {
            self.pending.lock().await.remove(command);
            return CommandResult::failure(
                command,
                error_code::SEND_ERROR,
                format!("send failed: {e}"),
            );
        }

        match tokio::time::timeout(self.call_timeout, rx).await {
            Ok(Ok(Ok(result))) => result,
            Ok(Ok(Err(ChannelError::Parse(e)))) => CommandResult::failure(
                command,
                error_code::PARSE_ERROR,
                format!("undecodable reply: {e}"),
            ),
            Ok(Ok(Err(_)) | Err(_)) => CommandResult::failure(
                command,
                error_code::CONNECTION_ERROR,
                "connection closed while awaiting reply",
            ),
            Err(_) => {
                self.pending.lock().await.remove(command);
                CommandResult::failure(
                    command,
                    error_code::TIMEOUT,
                    format!("no reply within {:?}", self.call_timeout),
                )
            }
        }
    }

    /// Close the transport and settle everything outstanding.
    ///
    /// Best-effort and idempotent; transport errors during teardown are
    /// swallowed.
    pub async fn disconnect(&self) {
        {
            let mut state = self.state.lock().await;
            if *state == ChannelState::Disconnected {
                return;
            }
            *state = ChannelState::Disconnecting;
        }

        self.dispose_transport().await;
        self.fail_pending().await;
        self.mark_disconnected().await;
    }

    async fn command_lock(&self, command: &str) -> Arc<Mutex<()>> {
        let mut locks = self.call_locks.lock().await;
        Arc::clone(
            locks
                .entry(command.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Drop the sink and abort the reader, regardless of prior state.
    async fn dispose_transport(&self) {
        if let Some(mut sink) = self.sink.lock().await.take() {
            let _ = sink.close().await;
        }
        if let Some(reader) = self.reader.lock().await.take() {
            reader.abort();
        }
    }

    async fn fail_pending(&self) {
        let mut pending = self.pending.lock().await;
        for (command, tx) in pending.drain() {
            trace!("settling pending {command} call on disconnect");
            let _ = tx.send(Err(ChannelError::Closed));
        }
    }

    async fn mark_disconnected(&self) {
        *self.state.lock().await = ChannelState::Disconnected;
        let _ = self.status_tx.send(false);
    }
}

/// Pump incoming frames until the transport drops, then settle all
/// pending calls and flip connectivity.
async fn read_loop(
    mut source: WsSource,
    pending: Arc<Mutex<HashMap<String, PendingReply>>>,
    state: Arc<Mutex<ChannelState>>,
    status_tx: broadcast::Sender<bool>,
    presence_tx: broadcast::Sender<bool>,
    data_tx: broadcast::Sender<DeviceSample>,
) {
    while let Some(frame) = source.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => {
                route_frame(&text, &pending, &presence_tx, &data_tx).await;
            }
            Ok(WsMessage::Close(_)) => {
                debug!("daemon closed the connection");
                break;
            }
            Ok(_) => {} // ping/pong/binary are transport noise
            Err(e) => {
                debug!("transport error: {e}");
                break;
            }
        }
    }

    {
        let mut pending = pending.lock().await;
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(ChannelError::Closed));
        }
    }
    *state.lock().await = ChannelState::Disconnected;
    let _ = status_tx.send(false);
}

/// Dispatch one incoming text frame: push event, command reply, or junk.
///
/// Malformed frames are dropped with a log line; one corrupt packet must
/// not terminate event delivery for well-formed packets behind it.
async fn route_frame(
    text: &str,
    pending: &Mutex<HashMap<String, PendingReply>>,
    presence_tx: &broadcast::Sender<bool>,
    data_tx: &broadcast::Sender<DeviceSample>,
) {
    let Ok(value) = serde_json::from_str::<Value>(text) else {
        debug!("dropping non-JSON frame");
        return;
    };

    match DaemonEvent::parse(&value) {
        Ok(Some(DaemonEvent::Presence(event))) => {
            trace!("device presence: {}", event.connected);
            let _ = presence_tx.send(event.connected);
        }
        Ok(Some(DaemonEvent::Data(sample))) => {
            let _ = data_tx.send(sample);
        }
        Ok(None) => settle_reply(&value, pending).await,
        Err(e) => {
            debug!("dropping malformed push event: {e}");
        }
    }
}

/// Attribute a reply frame to its waiting call by echoed command name.
async fn settle_reply(value: &Value, pending: &Mutex<HashMap<String, PendingReply>>) {
    // The daemon may wrap the envelope in a single-element list.
    let envelope = match value {
        Value::Array(items) => items.first().unwrap_or(value),
        other => other,
    };
    let Some(command) = envelope.get("command").and_then(Value::as_str) else {
        debug!("dropping reply frame without a command field");
        return;
    };

    let Some(tx) = pending.lock().await.remove(command) else {
        debug!("unmatched reply for {command}");
        return;
    };

    let outcome = CommandResult::decode(value).map_err(ChannelError::Parse);
    if let Err(ref e) = outcome {
        warn!("reply for {command} failed to decode: {e}");
    }
    let _ = tx.send(outcome);
}

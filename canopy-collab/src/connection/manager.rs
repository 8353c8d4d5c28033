//! WebSocket connection manager for a single channel.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, reconnect with backoff)
//! - Outbound buffering while disconnected, flushed FIFO on open
//! - Kind-routed inbound dispatch to subscribed handlers
//! - Heartbeat pings while connected
//!
//! Errors never cross the API: configuration and transport failures are
//! recorded as [`ConnectionState`] plus [`ConnectionManager::last_error`].

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{FutureExt, SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

use super::buffer::OutboundBuffer;
use super::handlers::{HandlerRegistry, Subscription};
use super::state::{CloseOutcome, ConnectionState, ReconnectPolicy, StateMachine};
use crate::protocol::{ChannelMessage, MessageKind, ProtocolError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Endpoint, `ws://` or `wss://`
    pub url: String,
    /// Channel to subscribe to
    pub channel: String,
    /// Auth token passed alongside the endpoint
    pub token: Option<String>,
    /// Sender id stamped on outbound messages
    pub sender: Option<String>,
    /// Reconnect behaviour after unexpected closes
    pub reconnect: ReconnectPolicy,
    /// Frames kept while disconnected before new sends are dropped
    pub max_buffered: usize,
    /// WebSocket ping interval while connected (None = no heartbeat)
    pub heartbeat_interval: Option<Duration>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9090".to_string(),
            channel: "default".to_string(),
            token: None,
            sender: None,
            reconnect: ReconnectPolicy::default(),
            max_buffered: 1024,
            heartbeat_interval: Some(Duration::from_secs(30)),
        }
    }
}

impl ConnectionConfig {
    pub fn new(url: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            channel: channel.into(),
            ..Self::default()
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Validate the endpoint and build the request URL.
    ///
    /// Channel and token are appended as `channel` / `token` query pairs.
    pub fn endpoint(&self) -> Result<Url, ConnectionError> {
        let raw = self.url.trim();
        if raw.is_empty() {
            return Err(ConnectionError::MissingEndpoint);
        }
        if self.channel.trim().is_empty() {
            return Err(ConnectionError::MissingChannel);
        }

        let mut url = Url::parse(raw).map_err(|e| ConnectionError::InvalidEndpoint(e.to_string()))?;
        match url.scheme() {
            "ws" | "wss" => {}
            other => return Err(ConnectionError::InvalidScheme(other.to_string())),
        }
        if url.host_str().map_or(true, str::is_empty) {
            return Err(ConnectionError::MissingEndpoint);
        }

        {
            let mut query = url.query_pairs_mut();
            query.append_pair("channel", &self.channel);
            if let Some(token) = &self.token {
                query.append_pair("token", token);
            }
        }
        Ok(url)
    }
}

/// Connection errors, recorded as state rather than returned.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionError {
    /// No endpoint configured
    MissingEndpoint,
    /// No channel configured
    MissingChannel,
    /// Endpoint is not a parseable URL
    InvalidEndpoint(String),
    /// Endpoint scheme is not ws/wss
    InvalidScheme(String),
    /// Handshake or socket failure
    Transport(String),
    /// Peer closed the connection
    Closed { code: u16, reason: String },
}

impl ConnectionError {
    /// Configuration errors are never retried automatically.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::MissingEndpoint
                | Self::MissingChannel
                | Self::InvalidEndpoint(_)
                | Self::InvalidScheme(_)
        )
    }
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingEndpoint => write!(f, "Missing endpoint"),
            Self::MissingChannel => write!(f, "Missing channel"),
            Self::InvalidEndpoint(e) => write!(f, "Invalid endpoint: {e}"),
            Self::InvalidScheme(s) => write!(f, "Invalid scheme '{s}': expected ws or wss"),
            Self::Transport(e) => write!(f, "Transport error: {e}"),
            Self::Closed { code, reason } if reason.is_empty() => {
                write!(f, "Connection closed ({code})")
            }
            Self::Closed { code, reason } => write!(f, "Connection closed ({code}): {reason}"),
        }
    }
}

impl std::error::Error for ConnectionError {}

/// Result of a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to the open transport
    Sent,
    /// Queued for replay on the next open
    Buffered,
    /// Buffer full; message discarded
    Dropped,
}

/// Connection statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionStats {
    pub connections: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub messages_buffered: u64,
    pub messages_dropped: u64,
    /// Inbound frames that failed to decode
    pub malformed_dropped: u64,
    /// Inbound frames addressed to another channel
    pub foreign_discarded: u64,
    pub errors: u64,
    pub reconnects: u64,
}

#[derive(Debug, Clone, Copy)]
enum Trigger {
    Manual,
    Backoff(u64),
}

struct Core {
    machine: StateMachine,
    buffer: OutboundBuffer,
    /// Writer task input; present only while connected
    outgoing: Option<mpsc::UnboundedSender<Message>>,
    reconnect_timer: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
    /// Bumped on every attempt and teardown; stale callbacks compare against it
    epoch: u64,
    last_error: Option<ConnectionError>,
    stats: ConnectionStats,
}

struct Inner {
    config: ConnectionConfig,
    core: Mutex<Core>,
    handlers: Arc<HandlerRegistry>,
    state_tx: watch::Sender<ConnectionState>,
}

impl Inner {
    fn core(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, core: &Core) {
        self.state_tx.send_if_modified(|current| {
            let next = core.machine.state();
            let changed = *current != next;
            *current = next;
            changed
        });
    }

    fn attempt(self: &Arc<Self>, trigger: Trigger) -> BoxFuture<'static, ()> {
        let this = Arc::clone(self);
        async move {
            let Some((epoch, url)) = this.prepare_attempt(trigger) else {
                return;
            };

            log::info!("Connecting to {} (channel {})", this.config.url, this.config.channel);
            match tokio_tungstenite::connect_async(url.as_str()).await {
                Ok((stream, _response)) => this.established(epoch, stream),
                Err(e) => this.handle_close(epoch, Some(ConnectionError::Transport(e.to_string()))),
            }
        }
        .boxed()
    }

    fn prepare_attempt(&self, trigger: Trigger) -> Option<(u64, Url)> {
        let mut core = self.core();
        let started = match trigger {
            Trigger::Manual => {
                let started = core.machine.begin_attempt();
                if started {
                    if let Some(timer) = core.reconnect_timer.take() {
                        timer.abort();
                    }
                }
                started
            }
            Trigger::Backoff(epoch) => {
                if core.epoch != epoch {
                    return None;
                }
                core.reconnect_timer = None;
                core.machine.timer_fired()
            }
        };
        if !started {
            return None;
        }
        self.publish(&core);

        core.epoch += 1;
        let epoch = core.epoch;
        let result = match self.config.endpoint() {
            Ok(url) => Some((epoch, url)),
            Err(err) => {
                log::error!("Invalid connection configuration: {err}");
                core.machine.configuration_failed();
                core.stats.errors += 1;
                core.last_error = Some(err);
                None
            }
        };
        self.publish(&core);
        result
    }

    fn established(self: &Arc<Self>, epoch: u64, stream: WsStream) {
        let mut core = self.core();
        if core.epoch != epoch || core.machine.state() != ConnectionState::Connecting {
            log::debug!("Discarding superseded connection (epoch {epoch})");
            return;
        }

        let (sink, source) = stream.split();
        let (tx, rx) = mpsc::unbounded_channel();
        core.writer = Some(tokio::spawn(write_loop(sink, rx, self.config.heartbeat_interval)));
        core.reader = Some(tokio::spawn(Arc::clone(self).read_loop(source, epoch)));

        core.machine.opened();
        core.stats.connections += 1;
        log::info!("Connected to channel {}", self.config.channel);

        // Replay buffered frames before any new send can interleave.
        let mut pending = core.buffer.drain().into_iter();
        let replay = pending.len();
        while let Some((kind, text)) = pending.next() {
            if tx.send(Message::text(text.clone())).is_err() {
                let mut rest = vec![(kind, text)];
                rest.extend(pending);
                core.buffer.requeue_front(rest);
                break;
            }
            core.stats.messages_sent += 1;
        }
        if replay > 0 {
            log::info!("Replayed {replay} buffered messages");
        }

        core.outgoing = Some(tx);
        self.publish(&core);
    }

    async fn read_loop(self: Arc<Self>, mut source: SplitStream<WsStream>, epoch: u64) {
        let mut reason = None;
        while let Some(frame) = source.next().await {
            match frame {
                Ok(Message::Text(text)) => self.dispatch(text.as_str()),
                Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                    Ok(text) => self.dispatch(text),
                    Err(_) => self.note_malformed("binary frame is not UTF-8"),
                },
                Ok(Message::Close(frame)) => {
                    reason = Some(match frame {
                        Some(frame) => ConnectionError::Closed {
                            code: u16::from(frame.code),
                            reason: frame.reason.as_str().to_string(),
                        },
                        None => ConnectionError::Closed {
                            code: 1005,
                            reason: String::new(),
                        },
                    });
                    break;
                }
                Ok(_) => {} // ping/pong handled by tungstenite
                Err(e) => {
                    reason = Some(ConnectionError::Transport(e.to_string()));
                    break;
                }
            }
        }

        let reason = reason.unwrap_or(ConnectionError::Closed {
            code: 1006,
            reason: "stream ended".to_string(),
        });
        self.handle_close(epoch, Some(reason));
    }

    fn dispatch(&self, text: &str) {
        let message = match ChannelMessage::decode_for(text, &self.config.channel) {
            Ok(message) => message,
            Err(ProtocolError::ChannelMismatch { got, .. }) => {
                log::trace!("Discarding message for channel {got}");
                self.core().stats.foreign_discarded += 1;
                return;
            }
            Err(e) => {
                self.note_malformed(&e.to_string());
                return;
            }
        };

        self.core().stats.messages_received += 1;
        let invoked = self.handlers.dispatch(&message);
        log::trace!("Dispatched {} message to {invoked} handler(s)", message.kind);
    }

    fn note_malformed(&self, detail: &str) {
        log::debug!("Dropping malformed inbound frame: {detail}");
        self.core().stats.malformed_dropped += 1;
    }

    fn handle_close(self: &Arc<Self>, epoch: u64, reason: Option<ConnectionError>) {
        let mut core = self.core();
        if core.epoch != epoch {
            return; // superseded by disconnect/reconnect
        }

        core.outgoing = None;
        core.reader = None;
        core.writer = None;

        if let Some(err) = reason {
            log::warn!("Connection to channel {} lost: {err}", self.config.channel);
            if matches!(err, ConnectionError::Transport(_)) {
                core.stats.errors += 1;
            }
            core.last_error = Some(err);
        }

        match core.machine.connection_lost() {
            CloseOutcome::Retry { delay, attempt } => {
                log::info!(
                    "Reconnecting in {}ms (attempt {attempt}/{})",
                    delay.as_millis(),
                    self.config.reconnect.max_attempts
                );
                core.stats.reconnects += 1;
                let this = Arc::clone(self);
                core.reconnect_timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    this.attempt(Trigger::Backoff(epoch)).await;
                }));
            }
            CloseOutcome::GiveUp => {
                log::warn!(
                    "Not reconnecting to channel {} ({} attempts used)",
                    self.config.channel,
                    core.machine.attempts()
                );
            }
        }
        self.publish(&core);
    }

    fn send<T: Serialize + ?Sized>(
        &self,
        kind: MessageKind,
        payload: &T,
    ) -> Result<Delivery, ProtocolError> {
        let text = ChannelMessage::new(kind, self.config.channel.as_str(), payload)
            .with_sender(self.config.sender.clone())
            .encode()?;

        let mut core = self.core();
        if core.machine.state() == ConnectionState::Connected {
            let handed_off = core
                .outgoing
                .as_ref()
                .is_some_and(|tx| tx.send(Message::text(text.clone())).is_ok());
            if handed_off {
                core.stats.messages_sent += 1;
                log::trace!("Sent {kind} message");
                return Ok(Delivery::Sent);
            }
        }

        if core.buffer.enqueue(kind, text) {
            core.stats.messages_buffered += 1;
            Ok(Delivery::Buffered)
        } else {
            log::warn!(
                "Outbound buffer full ({} frames), dropping {kind} message",
                core.buffer.capacity()
            );
            core.stats.messages_dropped += 1;
            Ok(Delivery::Dropped)
        }
    }

    /// Cancel the reconnect timer, then release the transport.
    fn teardown(&self, core: &mut Core) {
        if let Some(timer) = core.reconnect_timer.take() {
            timer.abort();
        }
        core.epoch += 1;
        if let Some(reader) = core.reader.take() {
            reader.abort();
        }
        if let Some(tx) = core.outgoing.take() {
            // Writer forwards the close frame, then exits once the channel drops.
            let _ = tx.send(Message::Close(None));
        }
        core.writer = None;
    }

    fn shutdown(&self) {
        let mut core = self.core();
        self.teardown(&mut core);
        if core.machine.disconnected() {
            log::info!("Disconnected from channel {}", self.config.channel);
        }
        self.publish(&core);
    }
}

async fn write_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
    heartbeat: Option<Duration>,
) {
    let mut ticker = heartbeat.map(|period| {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval
    });

    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(msg) => {
                    let closing = matches!(msg, Message::Close(_));
                    if sink.send(msg).await.is_err() || closing {
                        break;
                    }
                }
                None => break,
            },

            _ = async {
                match ticker.as_mut() {
                    Some(interval) => {
                        interval.tick().await;
                    }
                    None => std::future::pending::<()>().await,
                }
            } => {
                log::trace!("Heartbeat ping");
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }
    let _ = sink.close().await;
}

/// Manages one channel subscription over a WebSocket.
///
/// Dropping the manager cancels any pending reconnect and closes the
/// transport.
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Create a manager. Nothing connects until [`connect`](Self::connect).
    pub fn new(config: ConnectionConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let core = Core {
            machine: StateMachine::new(config.reconnect.clone()),
            buffer: OutboundBuffer::new(config.max_buffered),
            outgoing: None,
            reconnect_timer: None,
            reader: None,
            writer: None,
            epoch: 0,
            last_error: None,
            stats: ConnectionStats::default(),
        };
        Self {
            inner: Arc::new(Inner {
                config,
                core: Mutex::new(core),
                handlers: Arc::new(HandlerRegistry::new()),
                state_tx,
            }),
        }
    }

    /// Open the connection. No-op while connecting or connected.
    ///
    /// Resolves once this attempt either opened, failed validation
    /// (state `Error`), or failed and was handed to the backoff timer.
    pub async fn connect(&self) {
        self.inner.attempt(Trigger::Manual).await;
    }

    /// Intentional close. Pending reconnects are cancelled.
    pub fn disconnect(&self) {
        self.inner.shutdown();
    }

    /// Drop any pending backoff and transport, reset attempts, connect now.
    ///
    /// State watchers see `Connecting` next, never an intermediate
    /// `Disconnected`.
    pub async fn reconnect(&self) {
        {
            let mut core = self.inner.core();
            self.inner.teardown(&mut core);
            core.machine.reset_attempts();
            if core.machine.state().is_active() {
                core.machine.disconnected();
            }
        }
        self.inner.attempt(Trigger::Manual).await;
    }

    /// Send now if connected, otherwise buffer for the next open.
    pub fn send<T: Serialize + ?Sized>(
        &self,
        kind: MessageKind,
        payload: &T,
    ) -> Result<Delivery, ProtocolError> {
        self.inner.send(kind, payload)
    }

    /// Register a handler for one message kind.
    pub fn subscribe<F>(&self, kind: MessageKind, handler: F) -> Subscription
    where
        F: Fn(&ChannelMessage) + Send + Sync + 'static,
    {
        self.inner.handlers.register(kind, Box::new(handler))
    }

    /// Register a handler that receives decoded payloads.
    ///
    /// Messages whose `data` does not decode as `T` are dropped.
    pub fn subscribe_data<T, F>(&self, kind: MessageKind, handler: F) -> Subscription
    where
        T: DeserializeOwned + 'static,
        F: Fn(ChannelMessage<T>) + Send + Sync + 'static,
    {
        self.subscribe(kind, move |msg: &ChannelMessage| match msg.clone().into_typed::<T>() {
            Ok(typed) => handler(typed),
            Err(e) => log::debug!("Dropping {} message with unexpected payload: {e}", msg.kind),
        })
    }

    /// Send-only handle that does not keep the manager alive.
    pub fn outbox(&self) -> Outbox {
        Outbox {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.core().machine.state()
    }

    /// Receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Most recent configuration or transport error.
    pub fn last_error(&self) -> Option<ConnectionError> {
        self.inner.core().last_error.clone()
    }

    /// Retries scheduled since the last successful open.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.core().machine.attempts()
    }

    /// Whether a backoff timer is armed.
    pub fn has_pending_reconnect(&self) -> bool {
        self.inner.core().reconnect_timer.is_some()
    }

    pub fn buffered_len(&self) -> usize {
        self.inner.core().buffer.len()
    }

    pub fn stats(&self) -> ConnectionStats {
        self.inner.core().stats.clone()
    }

    pub fn handler_count(&self, kind: MessageKind) -> usize {
        self.inner.handlers.handler_count(kind)
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    pub fn channel(&self) -> &str {
        &self.inner.config.channel
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

/// Cloneable send path into a [`ConnectionManager`].
#[derive(Clone)]
pub struct Outbox {
    inner: Weak<Inner>,
}

impl Outbox {
    /// Same semantics as [`ConnectionManager::send`]; `Dropped` once the
    /// manager is gone.
    pub fn send<T: Serialize + ?Sized>(
        &self,
        kind: MessageKind,
        payload: &T,
    ) -> Result<Delivery, ProtocolError> {
        match self.inner.upgrade() {
            Some(inner) => inner.send(kind, payload),
            None => Ok(Delivery::Dropped),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.strong_count() == 0
    }
}

impl std::fmt::Debug for Outbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outbox").field("closed", &self.is_closed()).finish()
    }
}

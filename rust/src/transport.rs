//! Beacon transport over plain WebSocket or MQTT-over-WebSocket.
//!
//! `BeaconTransport::open` spawns one driver task and returns at once. The
//! outcome arrives through [`TransportCallbacks`]:
//!
//! ```text
//! connecting --handshake ok--> open --remote close / error--> closed
//!     |                          \--disconnect()-----------> closed
//!     |--failure--> connect error --> closed
//!     \--disconnect()-----------------> closed
//! ```
//!
//! `on_close` fires exactly once per transport, after `on_open` or
//! `on_connect_error` when either fired. `publish` is fire-and-forget and
//! only goes out while the transport is open.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::mqtt::{self, MqttError, Packet, PacketReader};
use crate::target::TargetInfo;

/// Topic prefix used when a target does not name a channel.
pub const DEFAULT_CHANNEL_PREFIX: &str = "waldiez://player";
/// MQTT keep-alive announced in CONNECT; a PINGREQ goes out at this period.
pub const MQTT_KEEP_ALIVE_SECS: u16 = 30;
/// WebSocket subprotocol requested for MQTT targets.
pub const MQTT_SUBPROTOCOL: &str = "mqtt";
/// Close code sent on `disconnect()`.
pub const NORMAL_CLOSURE: u16 = 1000;
/// How long a closing transport waits for the peer's close reply.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Errors raised inside the transport.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Connect failed: {0}")]
    Connect(String),
    #[error("Socket error: {0}")]
    Io(String),
    #[error(transparent)]
    Mqtt(#[from] MqttError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Observable transport state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

/// Lifecycle notifications, in the channel form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Open,
    ConnectError(String),
    Close {
        intentional: bool,
        code: Option<u16>,
        reason: Option<String>,
    },
}

/// Receiver of lifecycle notifications.
///
/// Called from the driver task. Calling `disconnect()` or `publish()` on the
/// transport from inside a callback is allowed.
pub trait TransportCallbacks: Send + 'static {
    fn on_open(&mut self);
    fn on_connect_error(&mut self, message: &str);
    fn on_close(&mut self, intentional: bool, code: Option<u16>, reason: Option<&str>);
}

impl TransportCallbacks for mpsc::UnboundedSender<TransportEvent> {
    fn on_open(&mut self) {
        let _ = self.send(TransportEvent::Open);
    }

    fn on_connect_error(&mut self, message: &str) {
        let _ = self.send(TransportEvent::ConnectError(message.to_string()));
    }

    fn on_close(&mut self, intentional: bool, code: Option<u16>, reason: Option<&str>) {
        let _ = self.send(TransportEvent::Close {
            intentional,
            code,
            reason: reason.map(str::to_string),
        });
    }
}

/// Closure form of [`TransportCallbacks`].
pub struct FnCallbacks<O, E, C> {
    pub on_open: O,
    pub on_connect_error: E,
    pub on_close: C,
}

impl<O, E, C> TransportCallbacks for FnCallbacks<O, E, C>
where
    O: FnMut() + Send + 'static,
    E: FnMut(&str) + Send + 'static,
    C: FnMut(bool, Option<u16>, Option<&str>) + Send + 'static,
{
    fn on_open(&mut self) {
        (self.on_open)();
    }

    fn on_connect_error(&mut self, message: &str) {
        (self.on_connect_error)(message);
    }

    fn on_close(&mut self, intentional: bool, code: Option<u16>, reason: Option<&str>) {
        (self.on_close)(intentional, code, reason);
    }
}

/// One WebSocket message, independent of the socket library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Close {
        code: Option<u16>,
        reason: Option<String>,
    },
}

/// An established WebSocket.
#[async_trait]
pub trait WsLink: Send {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError>;

    /// Next data or close frame; `None` once the socket is gone.
    async fn recv(&mut self) -> Option<Result<Frame, TransportError>>;
}

/// Opens WebSockets.
#[async_trait]
pub trait WsConnector: Send + Sync + 'static {
    async fn connect(
        &self,
        url: &str,
        subprotocol: Option<&'static str>,
    ) -> Result<Box<dyn WsLink>, TransportError>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// `tokio-tungstenite` connector.
#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteConnector;

struct TungsteniteLink {
    stream: WsStream,
}

#[async_trait]
impl WsConnector for TungsteniteConnector {
    async fn connect(
        &self,
        url: &str,
        subprotocol: Option<&'static str>,
    ) -> Result<Box<dyn WsLink>, TransportError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        if let Some(protocol) = subprotocol {
            request
                .headers_mut()
                .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(protocol));
        }
        let (stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        Ok(Box::new(TungsteniteLink { stream }))
    }
}

#[async_trait]
impl WsLink for TungsteniteLink {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        let message = match frame {
            Frame::Text(text) => Message::text(text),
            Frame::Binary(bytes) => Message::binary(bytes),
            Frame::Close { code, reason } => Message::Close(code.map(|code| CloseFrame {
                code: CloseCode::from(code),
                reason: reason.unwrap_or_default().into(),
            })),
        };
        self.stream
            .send(message)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<Frame, TransportError>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(TransportError::Io(e.to_string()))),
            };
            let frame = match message {
                Message::Text(text) => Frame::Text(text.as_str().to_string()),
                Message::Binary(bytes) => Frame::Binary(bytes.to_vec()),
                Message::Close(close) => Frame::Close {
                    code: close.as_ref().map(|c| u16::from(c.code)),
                    reason: close
                        .map(|c| c.reason.as_str().to_string())
                        .filter(|r| !r.is_empty()),
                },
                // Ping/Pong are answered by tungstenite.
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            };
            return Some(Ok(frame));
        }
    }
}

fn channel_prefix(channel: Option<&str>) -> &str {
    match channel.map(|c| c.trim().trim_end_matches('/')) {
        Some(prefix) if !prefix.is_empty() => prefix,
        _ => DEFAULT_CHANNEL_PREFIX,
    }
}

/// MQTT publish topic for a session: `<prefix>/<session_id>`.
pub fn topic_for(channel: Option<&str>, session_id: &str) -> String {
    format!("{}/{}", channel_prefix(channel), session_id)
}

/// Subscription covering every session under a prefix.
pub fn wildcard_topic(channel: Option<&str>) -> String {
    format!("{}/+", channel_prefix(channel))
}

enum Wire {
    Plain,
    Mqtt { topic: String, client_id: String },
}

impl Wire {
    fn subprotocol(&self) -> Option<&'static str> {
        match self {
            Self::Plain => None,
            Self::Mqtt { .. } => Some(MQTT_SUBPROTOCOL),
        }
    }

    fn is_mqtt(&self) -> bool {
        matches!(self, Self::Mqtt { .. })
    }

    fn encode(&self, text: String) -> Result<Frame, TransportError> {
        match self {
            Self::Plain => Ok(Frame::Text(text)),
            Self::Mqtt { topic, .. } => Ok(Frame::Binary(mqtt::publish(topic, text.as_bytes())?)),
        }
    }
}

enum Command {
    Publish(String),
    Disconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Connecting,
    Open,
    Failed,
    Closed,
}

/// Enforces callback ordering for one transport.
struct Lifecycle {
    callbacks: Box<dyn TransportCallbacks>,
    state: watch::Sender<ConnectionState>,
    phase: Phase,
    label: String,
}

impl Lifecycle {
    fn open(&mut self) {
        if self.phase != Phase::Connecting {
            return;
        }
        self.phase = Phase::Open;
        self.state.send_replace(ConnectionState::Open);
        info!(target_id = %self.label, "beacon transport open");
        self.callbacks.on_open();
    }

    fn connect_error(&mut self, message: &str) {
        if self.phase != Phase::Connecting {
            return;
        }
        self.phase = Phase::Failed;
        warn!(target_id = %self.label, "beacon connect failed: {message}");
        self.callbacks.on_connect_error(message);
    }

    fn close(&mut self, intentional: bool, code: Option<u16>, reason: Option<&str>) {
        if self.phase == Phase::Closed {
            return;
        }
        let was_open = self.phase == Phase::Open;
        self.phase = Phase::Closed;
        self.state.send_replace(ConnectionState::Closed);
        if intentional || !was_open {
            debug!(target_id = %self.label, intentional, ?code, ?reason, "beacon transport closed");
        } else {
            warn!(target_id = %self.label, ?code, ?reason, "beacon transport dropped");
        }
        self.callbacks.on_close(intentional, code, reason);
    }
}

/// Handle to one beacon connection. Clones share the connection.
#[derive(Clone)]
pub struct BeaconTransport {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    topic: Option<String>,
}

impl BeaconTransport {
    /// Start connecting to `target` with the tokio-tungstenite connector.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn open<C: TransportCallbacks>(target: &TargetInfo, session_id: &str, callbacks: C) -> Self {
        Self::open_with(Arc::new(TungsteniteConnector), target, session_id, callbacks)
    }

    /// Start connecting through a caller-supplied connector.
    pub fn open_with<C: TransportCallbacks>(
        connector: Arc<dyn WsConnector>,
        target: &TargetInfo,
        session_id: &str,
        callbacks: C,
    ) -> Self {
        let wire = if target.is_mqtt() {
            Wire::Mqtt {
                topic: topic_for(target.channel.as_deref(), session_id),
                client_id: mqtt::client_id_for(session_id),
            }
        } else {
            Wire::Plain
        };
        let topic = match &wire {
            Wire::Mqtt { topic, .. } => Some(topic.clone()),
            Wire::Plain => None,
        };

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnectionState::Connecting);
        let lifecycle = Lifecycle {
            callbacks: Box::new(callbacks),
            state: state_tx,
            phase: Phase::Connecting,
            label: target.id.clone(),
        };

        debug!(target_id = %target.id, url = %target.url, protocol = %target.protocol, "beacon transport connecting");
        tokio::spawn(drive(
            connector,
            target.url.clone(),
            wire,
            command_rx,
            lifecycle,
        ));

        Self {
            commands,
            state,
            topic,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// State change notifications.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// MQTT publish topic; `None` for plain WebSocket targets.
    pub fn topic(&self) -> Option<&str> {
        self.topic.as_deref()
    }

    /// Serialize and send `payload`.
    ///
    /// Returns `Ok(false)` when the transport is not open and the payload was
    /// dropped. Nothing is queued or retried.
    pub fn publish<T: Serialize + ?Sized>(&self, payload: &T) -> Result<bool, TransportError> {
        if !self.is_open() {
            debug!("beacon not open, dropping payload");
            return Ok(false);
        }
        let text = serde_json::to_string(payload)?;
        Ok(self.commands.send(Command::Publish(text)).is_ok())
    }

    /// Close the connection. Idempotent.
    pub fn disconnect(&self) {
        let _ = self.commands.send(Command::Disconnect);
    }
}

enum Step {
    Incoming(Option<Result<Frame, TransportError>>),
    Command(Option<Command>),
    Ping,
}

async fn mqtt_handshake(
    link: &mut dyn WsLink,
    client_id: &str,
) -> Result<PacketReader, TransportError> {
    link.send(Frame::Binary(mqtt::connect(client_id, MQTT_KEEP_ALIVE_SECS)?))
        .await?;
    let mut reader = PacketReader::new();
    loop {
        match link.recv().await {
            Some(Ok(Frame::Binary(bytes))) => {
                reader.push(&bytes);
                while let Some(packet) = reader.next_packet()? {
                    if let Packet::ConnAck { code, .. } = packet {
                        if code != 0 {
                            return Err(MqttError::refused(code).into());
                        }
                        return Ok(reader);
                    }
                }
            }
            Some(Ok(Frame::Text(_))) => {}
            Some(Ok(Frame::Close { code, reason })) => {
                return Err(TransportError::Connect(format!(
                    "closed before CONNACK (code {}, reason {})",
                    code.map_or_else(|| "none".to_string(), |c| c.to_string()),
                    reason.as_deref().unwrap_or("none")
                )));
            }
            Some(Err(e)) => return Err(e),
            None => {
                return Err(TransportError::Connect(
                    "connection lost before CONNACK".to_string(),
                ));
            }
        }
    }
}

async fn close_gracefully(link: &mut dyn WsLink, wire: &Wire) {
    if wire.is_mqtt() {
        let _ = link.send(Frame::Binary(mqtt::disconnect())).await;
    }
    let close = Frame::Close {
        code: Some(NORMAL_CLOSURE),
        reason: None,
    };
    if let Err(e) = link.send(close).await {
        debug!("close frame not sent: {e}");
        return;
    }
    let drain = async {
        while let Some(Ok(frame)) = link.recv().await {
            if matches!(frame, Frame::Close { .. }) {
                break;
            }
        }
    };
    let _ = tokio::time::timeout(CLOSE_GRACE, drain).await;
}

async fn drive(
    connector: Arc<dyn WsConnector>,
    url: String,
    wire: Wire,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut life: Lifecycle,
) {
    let connecting = async {
        let mut link = connector.connect(&url, wire.subprotocol()).await?;
        let reader = match &wire {
            Wire::Mqtt { client_id, .. } => Some(mqtt_handshake(link.as_mut(), client_id).await?),
            Wire::Plain => None,
        };
        Ok::<_, TransportError>((link, reader))
    };
    tokio::pin!(connecting);

    let (mut link, mut reader) = loop {
        tokio::select! {
            result = &mut connecting => match result {
                Ok(connected) => break connected,
                Err(e) => {
                    let message = e.to_string();
                    life.connect_error(&message);
                    life.close(false, None, Some(&message));
                    return;
                }
            },
            command = commands.recv() => match command {
                Some(Command::Publish(_)) => debug!("beacon still connecting, dropping payload"),
                Some(Command::Disconnect) | None => {
                    life.close(true, None, None);
                    return;
                }
            },
        }
    };

    life.open();

    let mut ping = tokio::time::interval(Duration::from_secs(u64::from(MQTT_KEEP_ALIVE_SECS)));
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ping.tick().await;

    loop {
        let step = tokio::select! {
            incoming = link.recv() => Step::Incoming(incoming),
            command = commands.recv() => Step::Command(command),
            _ = ping.tick(), if wire.is_mqtt() => Step::Ping,
        };

        match step {
            Step::Incoming(None) => {
                life.close(false, None, Some("connection lost"));
                return;
            }
            Step::Incoming(Some(Err(e))) => {
                life.close(false, None, Some(&e.to_string()));
                return;
            }
            Step::Incoming(Some(Ok(Frame::Close { code, reason }))) => {
                life.close(false, code, reason.as_deref());
                return;
            }
            Step::Incoming(Some(Ok(Frame::Binary(bytes)))) => {
                let Some(reader) = reader.as_mut() else {
                    debug!(len = bytes.len(), "ignoring inbound binary frame");
                    continue;
                };
                reader.push(&bytes);
                loop {
                    match reader.next_packet() {
                        Ok(Some(Packet::PingResp)) => debug!("mqtt pingresp"),
                        Ok(Some(packet)) => debug!(?packet, "ignoring inbound mqtt packet"),
                        Ok(None) => break,
                        Err(e) => {
                            life.close(false, None, Some(&e.to_string()));
                            return;
                        }
                    }
                }
            }
            Step::Incoming(Some(Ok(Frame::Text(_)))) => debug!("ignoring inbound text frame"),
            Step::Command(Some(Command::Publish(text))) => {
                let frame = match wire.encode(text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("beacon payload not sent: {e}");
                        continue;
                    }
                };
                if let Err(e) = link.send(frame).await {
                    life.close(false, None, Some(&e.to_string()));
                    return;
                }
            }
            Step::Command(Some(Command::Disconnect) | None) => {
                life.close(true, Some(NORMAL_CLOSURE), None);
                close_gracefully(link.as_mut(), &wire).await;
                return;
            }
            Step::Ping => {
                if let Err(e) = link.send(Frame::Binary(mqtt::pingreq())).await {
                    life.close(false, None, Some(&e.to_string()));
                    return;
                }
            }
        }
    }
}

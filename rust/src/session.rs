//! Beacon session: one WID-identified broadcast of player state.

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::payload::{BeaconMessage, MessageKind, PlayerSnapshot};
use crate::target::TargetInfo;
use crate::transport::{
    BeaconTransport, TransportError, TransportEvent, TungsteniteConnector, WsConnector,
};
use crate::wid::WidGen;

/// Where a session stands, from the caller's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Live,
}

pub struct BeaconSession {
    id: String,
    source: String,
    target: TargetInfo,
    state: SessionState,
    last_error: Option<String>,
    transport: BeaconTransport,
    events: mpsc::UnboundedReceiver<TransportEvent>,
}

impl BeaconSession {
    /// Mint a session id and start connecting to `target`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(ids: &mut WidGen, target: TargetInfo, source: &str) -> Self {
        Self::start_with(Arc::new(TungsteniteConnector), ids, target, source)
    }

    pub fn start_with(
        connector: Arc<dyn WsConnector>,
        ids: &mut WidGen,
        target: TargetInfo,
        source: &str,
    ) -> Self {
        let id = ids.next_wid();
        let (tx, events) = mpsc::unbounded_channel();
        let transport = BeaconTransport::open_with(connector, &target, &id, tx);
        info!(session_id = %id, target_id = %target.id, "beacon session starting");
        Self {
            id,
            source: source.to_string(),
            target,
            state: SessionState::Connecting,
            last_error: None,
            transport,
            events,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn target(&self) -> &TargetInfo {
        &self.target
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_live(&self) -> bool {
        self.state == SessionState::Live
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// MQTT topic the session publishes to, if any.
    pub fn topic(&self) -> Option<&str> {
        self.transport.topic()
    }

    /// Wait for the next transport event and apply it.
    ///
    /// Returns `None` once the transport has finished and every event has
    /// been consumed.
    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        let event = self.events.recv().await?;
        self.apply(&event);
        Some(event)
    }

    /// Apply a transport event to the session state.
    pub fn apply(&mut self, event: &TransportEvent) {
        match event {
            TransportEvent::Open => {
                if self.state == SessionState::Connecting {
                    self.state = SessionState::Live;
                    self.last_error = None;
                }
            }
            TransportEvent::ConnectError(message) => {
                self.state = SessionState::Idle;
                self.last_error = Some(message.clone());
            }
            TransportEvent::Close {
                intentional,
                code,
                reason,
            } => {
                if !intentional && self.last_error.is_none() {
                    self.last_error = Some(match (code, reason) {
                        (_, Some(reason)) => reason.clone(),
                        (Some(code), None) => format!("closed with code {code}"),
                        (None, None) => "connection closed".to_string(),
                    });
                }
                self.state = SessionState::Idle;
                debug!(session_id = %self.id, intentional, "beacon session idle");
            }
        }
    }

    /// Build and publish a beacon message. Returns whether it was sent.
    pub fn send(&self, kind: MessageKind, snapshot: &PlayerSnapshot) -> Result<bool, TransportError> {
        if !self.is_live() {
            return Ok(false);
        }
        let message = BeaconMessage::new(kind, &self.id, &self.source, snapshot, Utc::now());
        self.transport.publish(&message)
    }

    /// Stop broadcasting. Idempotent.
    pub fn stop(&mut self) {
        if self.state != SessionState::Idle {
            info!(session_id = %self.id, "beacon session stopping");
        }
        self.transport.disconnect();
        self.state = SessionState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::Protocol;
    use crate::transport::{Frame, WsLink};
    use crate::wid::{WidGenOptions, is_wid};
    use async_trait::async_trait;

    struct Refusing;

    #[async_trait]
    impl WsConnector for Refusing {
        async fn connect(
            &self,
            _url: &str,
            _subprotocol: Option<&'static str>,
        ) -> Result<Box<dyn WsLink>, TransportError> {
            Err(TransportError::Connect("no route to host".to_string()))
        }
    }

    /// Accepts and records what the client sends; never replies.
    struct Sink {
        sent: mpsc::UnboundedSender<Frame>,
    }

    struct SinkLink {
        sent: mpsc::UnboundedSender<Frame>,
        closed: bool,
    }

    #[async_trait]
    impl WsConnector for Sink {
        async fn connect(
            &self,
            _url: &str,
            _subprotocol: Option<&'static str>,
        ) -> Result<Box<dyn WsLink>, TransportError> {
            Ok(Box::new(SinkLink {
                sent: self.sent.clone(),
                closed: false,
            }))
        }
    }

    #[async_trait]
    impl WsLink for SinkLink {
        async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
            self.closed |= matches!(frame, Frame::Close { .. });
            let _ = self.sent.send(frame);
            Ok(())
        }

        async fn recv(&mut self) -> Option<Result<Frame, TransportError>> {
            if self.closed {
                return None;
            }
            std::future::pending().await
        }
    }

    fn target() -> TargetInfo {
        TargetInfo {
            id: "relay".to_string(),
            name: "Relay".to_string(),
            protocol: Protocol::Ws,
            url: "ws://relay.test/beacon".to_string(),
            channel: None,
        }
    }

    #[tokio::test]
    async fn live_session_sends_tagged_messages() {
        let (sent, mut frames) = mpsc::unbounded_channel();
        let mut ids = WidGen::new(WidGenOptions::default()).unwrap();
        let mut session =
            BeaconSession::start_with(Arc::new(Sink { sent }), &mut ids, target(), "player");

        assert!(is_wid(session.id()));
        assert_eq!(session.state(), SessionState::Connecting);
        assert!(!session.send(MessageKind::Start, &PlayerSnapshot::default()).unwrap());

        assert_eq!(session.next_event().await, Some(TransportEvent::Open));
        assert!(session.is_live());

        let snap = PlayerSnapshot {
            name: "Song".to_string(),
            playing: true,
            position: 3.21,
            volume: 0.5,
            rate: 1.0,
            ..PlayerSnapshot::default()
        };
        assert!(session.send(MessageKind::State, &snap).unwrap());
        let Some(Frame::Text(text)) = frames.recv().await else {
            panic!("expected a text frame");
        };
        let msg = BeaconMessage::from_json(&text).unwrap();
        assert_eq!(msg.kind, MessageKind::State);
        assert_eq!(msg.session_id, session.id());
        assert_eq!(msg.source, "player");
        assert_eq!(msg.t, 3.2);

        session.stop();
        session.stop();
        assert_eq!(session.state(), SessionState::Idle);
        assert!(matches!(
            session.next_event().await,
            Some(TransportEvent::Close {
                intentional: true,
                ..
            })
        ));
        assert_eq!(session.next_event().await, None);
        assert_eq!(session.last_error(), None);
    }

    #[tokio::test]
    async fn connect_error_returns_session_to_idle() {
        let mut ids = WidGen::default_params();
        let mut session = BeaconSession::start_with(Arc::new(Refusing), &mut ids, target(), "player");

        assert!(matches!(
            session.next_event().await,
            Some(TransportEvent::ConnectError(_))
        ));
        assert_eq!(session.state(), SessionState::Idle);
        assert!(session.last_error().unwrap().contains("no route to host"));

        assert!(matches!(
            session.next_event().await,
            Some(TransportEvent::Close {
                intentional: false,
                ..
            })
        ));
        assert!(session.last_error().unwrap().contains("no route to host"));
        assert_eq!(session.next_event().await, None);
    }

    #[tokio::test]
    async fn unexpected_close_records_reason() {
        let (sent, _frames) = mpsc::unbounded_channel();
        let mut ids = WidGen::default_params();
        let mut session =
            BeaconSession::start_with(Arc::new(Sink { sent }), &mut ids, target(), "player");
        session.apply(&TransportEvent::Open);
        assert!(session.is_live());
        session.apply(&TransportEvent::Close {
            intentional: false,
            code: Some(1006),
            reason: None,
        });
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.last_error(), Some("closed with code 1006"));
    }

    #[tokio::test]
    async fn sessions_get_distinct_increasing_ids() {
        let (sent, _frames) = mpsc::unbounded_channel();
        let connector: Arc<dyn WsConnector> = Arc::new(Sink { sent });
        let mut ids = WidGen::default_params();
        let a = BeaconSession::start_with(connector.clone(), &mut ids, target(), "player");
        let b = BeaconSession::start_with(connector, &mut ids, target(), "player");
        assert!(a.id() < b.id());
    }
}

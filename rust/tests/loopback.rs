//! End-to-end sessions against in-process WebSocket servers.

use beacon::{
    BeaconMessage, BeaconSession, BeaconSettings, MessageKind, PlayerSnapshot, Protocol,
    SessionState, TargetInfo, TargetProfile, TransportEvent, WidGen, all_targets, client_id_for,
    resolve_active,
};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::{accept_async, accept_hdr_async};

fn snapshot(position: f64, playing: bool) -> PlayerSnapshot {
    PlayerSnapshot {
        name: "Loopback".to_string(),
        youtube_id: Some("dQw4w9WgXcQ".to_string()),
        playing,
        position,
        duration: 60.0,
        volume: 0.5,
        rate: 1.0,
        ..PlayerSnapshot::default()
    }
}

/// Accepts one client and collects its text frames until it goes away.
async fn relay() -> (String, JoinHandle<Vec<String>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/beacon", listener.local_addr().unwrap());
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        let mut texts = Vec::new();
        while let Some(Ok(message)) = ws.next().await {
            if let Message::Text(text) = message {
                texts.push(text.as_str().to_string());
            }
        }
        texts
    });
    (url, server)
}

#[derive(Debug, Default)]
struct BrokerLog {
    client_id: Option<String>,
    publishes: Vec<(String, Vec<u8>)>,
    disconnected: bool,
}

fn read_remaining_length(bytes: &[u8]) -> (usize, usize) {
    let mut len = 0usize;
    let mut multiplier = 1usize;
    let mut idx = 1;
    loop {
        let byte = bytes[idx];
        len += (byte & 0x7F) as usize * multiplier;
        idx += 1;
        if byte & 0x80 == 0 {
            return (len, idx);
        }
        multiplier *= 128;
    }
}

fn read_str(body: &[u8]) -> (String, &[u8]) {
    let len = u16::from_be_bytes([body[0], body[1]]) as usize;
    let s = String::from_utf8(body[2..2 + len].to_vec()).unwrap();
    (s, &body[2 + len..])
}

/// Fake MQTT-over-WebSocket broker: one packet per frame, CONNACK with
/// `return_code` to CONNECT, PUBLISH and DISCONNECT recorded.
async fn broker(return_code: u8) -> (String, JoinHandle<BrokerLog>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/mqtt", listener.local_addr().unwrap());
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let agree_mqtt = |_req: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
            response
                .headers_mut()
                .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("mqtt"));
            Ok(response)
        };
        let mut ws = accept_hdr_async(stream, agree_mqtt).await.unwrap();
        let mut log = BrokerLog::default();
        while let Some(Ok(message)) = ws.next().await {
            let Message::Binary(bytes) = message else {
                continue;
            };
            let (len, start) = read_remaining_length(&bytes);
            let body = &bytes[start..start + len];
            match bytes[0] & 0xF0 {
                0x10 => {
                    // Variable header is 10 bytes for protocol level 4.
                    let (client_id, _) = read_str(&body[10..]);
                    log.client_id = Some(client_id);
                    ws.send(Message::binary(vec![0x20, 0x02, 0x00, return_code]))
                        .await
                        .unwrap();
                }
                0x30 => {
                    let (topic, payload) = read_str(body);
                    log.publishes.push((topic, payload.to_vec()));
                }
                0xE0 => log.disconnected = true,
                _ => {}
            }
        }
        log
    });
    (url, server)
}

#[tokio::test]
async fn ws_relay_receives_start_state_stop() {
    let (url, server) = relay().await;
    let settings = BeaconSettings {
        active_target: Some("loopback".to_string()),
        custom_targets: vec![TargetProfile::custom("loopback", Protocol::Ws, Some(url.as_str()))],
    };
    let target = resolve_active(&all_targets(&settings), &settings).unwrap();
    assert_eq!(target.id, "loopback");

    let mut ids = WidGen::default_params();
    let mut session = BeaconSession::start(&mut ids, target, "player");
    assert_eq!(session.next_event().await, Some(TransportEvent::Open));
    assert_eq!(session.state(), SessionState::Live);

    assert!(session.send(MessageKind::Start, &snapshot(0.0, true)).unwrap());
    assert!(session.send(MessageKind::State, &snapshot(1.04, true)).unwrap());
    assert!(session.send(MessageKind::Stop, &snapshot(2.0, false)).unwrap());
    session.stop();

    assert!(matches!(
        session.next_event().await,
        Some(TransportEvent::Close {
            intentional: true,
            ..
        })
    ));
    assert_eq!(session.next_event().await, None);

    let texts = server.await.unwrap();
    let messages: Vec<BeaconMessage> = texts
        .iter()
        .map(|t| BeaconMessage::from_json(t).unwrap())
        .collect();
    let kinds: Vec<MessageKind> = messages.iter().map(|m| m.kind).collect();
    assert_eq!(
        kinds,
        vec![MessageKind::Start, MessageKind::State, MessageKind::Stop]
    );
    assert!(messages.iter().all(|m| m.session_id == session.id()));
    assert_eq!(messages[1].t, 1.0);
    assert!(!messages[2].playing);
}

#[tokio::test]
async fn mqtt_broker_receives_publishes_on_session_topic() {
    let (url, server) = broker(0).await;
    let target = TargetInfo {
        id: "loopback-mqtt".to_string(),
        name: "Loopback broker".to_string(),
        protocol: Protocol::Mqtt,
        url,
        channel: Some("studio/player/".to_string()),
    };

    let mut ids = WidGen::default_params();
    let mut session = BeaconSession::start(&mut ids, target, "player");
    let topic = format!("studio/player/{}", session.id());
    assert_eq!(session.topic(), Some(topic.as_str()));
    assert_eq!(session.next_event().await, Some(TransportEvent::Open));

    assert!(session.send(MessageKind::Start, &snapshot(0.0, true)).unwrap());
    assert!(session.send(MessageKind::State, &snapshot(5.0, true)).unwrap());
    session.stop();
    while session.next_event().await.is_some() {}

    let log = server.await.unwrap();
    assert_eq!(log.client_id.as_deref(), Some(client_id_for(session.id()).as_str()));
    assert_eq!(log.publishes.len(), 2);
    for (published_topic, _) in &log.publishes {
        assert_eq!(published_topic, &topic);
    }
    let state: BeaconMessage =
        serde_json::from_slice(&log.publishes[1].1).unwrap();
    assert_eq!(state.kind, MessageKind::State);
    assert_eq!(state.t, 5.0);
    assert!(log.disconnected);
}

#[tokio::test]
async fn mqtt_refusal_reports_connect_error() {
    let (url, server) = broker(5).await;
    let target = TargetInfo {
        id: "loopback-mqtt".to_string(),
        name: "Loopback broker".to_string(),
        protocol: Protocol::Mqtt,
        url,
        channel: None,
    };

    let mut ids = WidGen::default_params();
    let mut session = BeaconSession::start(&mut ids, target, "player");
    assert!(matches!(
        session.next_event().await,
        Some(TransportEvent::ConnectError(_))
    ));
    assert_eq!(session.state(), SessionState::Idle);
    assert!(session.last_error().unwrap().contains("not authorized"));
    assert!(!session.send(MessageKind::Start, &snapshot(0.0, true)).unwrap());

    drop(session);
    let log = server.await.unwrap();
    assert!(log.publishes.is_empty());
}

#[tokio::test]
async fn nothing_listening_is_a_connect_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/beacon", listener.local_addr().unwrap());
    drop(listener);

    let target = TargetInfo {
        id: "gone".to_string(),
        name: "Gone".to_string(),
        protocol: Protocol::Ws,
        url,
        channel: None,
    };
    let mut ids = WidGen::default_params();
    let mut session = BeaconSession::start(&mut ids, target, "player");

    let mut events = Vec::new();
    while let Some(event) = session.next_event().await {
        events.push(event);
    }
    assert_eq!(events.len(), 2);
    assert!(matches!(events[0], TransportEvent::ConnectError(_)));
    assert!(matches!(
        events[1],
        TransportEvent::Close {
            intentional: false,
            ..
        }
    ));
    assert_eq!(session.state(), SessionState::Idle);
}

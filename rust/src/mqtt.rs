//! Minimal MQTT 3.1.1 packets for a QoS-0 publisher.
//!
//! Packets travel in WebSocket binary frames. A frame may hold several
//! packets, or part of one, so incoming bytes go through [`PacketReader`].

use sha2::{Digest, Sha256};
use thiserror::Error;

const PROTOCOL_NAME: &str = "MQTT";
const PROTOCOL_LEVEL: u8 = 4;
const FLAG_CLEAN_SESSION: u8 = 0x02;
/// Largest value the remaining-length varint can carry.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

const CONNECT: u8 = 0x10;
const CONNACK: u8 = 0x20;
const PUBLISH: u8 = 0x30;
const PINGREQ: u8 = 0xC0;
const PINGRESP: u8 = 0xD0;
const DISCONNECT: u8 = 0xE0;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum MqttError {
    #[error("Malformed remaining length")]
    MalformedLength,
    #[error("Packet too large: {0} bytes")]
    TooLarge(usize),
    #[error("String field too long: {0} bytes")]
    StringTooLong(usize),
    #[error("Malformed {0} packet")]
    Malformed(&'static str),
    #[error("Connection refused by broker: {reason} (code {code})")]
    Refused { code: u8, reason: &'static str },
}

impl MqttError {
    pub fn refused(code: u8) -> Self {
        Self::Refused {
            code,
            reason: refusal_reason(code),
        }
    }
}

/// Human-readable CONNACK return code.
pub fn refusal_reason(code: u8) -> &'static str {
    match code {
        1 => "unacceptable protocol version",
        2 => "identifier rejected",
        3 => "server unavailable",
        4 => "bad user name or password",
        5 => "not authorized",
        _ => "unknown return code",
    }
}

/// Incoming packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    ConnAck { session_present: bool, code: u8 },
    PingResp,
    /// Any other packet type, identified by its high nibble.
    Other(u8),
}

fn encode_remaining_length(mut len: usize, out: &mut Vec<u8>) -> Result<(), MqttError> {
    if len > MAX_REMAINING_LENGTH {
        return Err(MqttError::TooLarge(len));
    }
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if len == 0 {
            return Ok(());
        }
    }
}

fn push_str(s: &str, out: &mut Vec<u8>) -> Result<(), MqttError> {
    let len = u16::try_from(s.len()).map_err(|_| MqttError::StringTooLong(s.len()))?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

fn frame(first: u8, body: &[u8]) -> Result<Vec<u8>, MqttError> {
    let mut out = Vec::with_capacity(body.len() + 5);
    out.push(first);
    encode_remaining_length(body.len(), &mut out)?;
    out.extend_from_slice(body);
    Ok(out)
}

/// CONNECT with a clean session and no credentials.
pub fn connect(client_id: &str, keep_alive_secs: u16) -> Result<Vec<u8>, MqttError> {
    let mut body = Vec::with_capacity(12 + client_id.len());
    push_str(PROTOCOL_NAME, &mut body)?;
    body.push(PROTOCOL_LEVEL);
    body.push(FLAG_CLEAN_SESSION);
    body.extend_from_slice(&keep_alive_secs.to_be_bytes());
    push_str(client_id, &mut body)?;
    frame(CONNECT, &body)
}

/// QoS-0 PUBLISH without the retain flag.
pub fn publish(topic: &str, payload: &[u8]) -> Result<Vec<u8>, MqttError> {
    let mut body = Vec::with_capacity(2 + topic.len() + payload.len());
    push_str(topic, &mut body)?;
    body.extend_from_slice(payload);
    frame(PUBLISH, &body)
}

pub fn pingreq() -> Vec<u8> {
    vec![PINGREQ, 0]
}

pub fn disconnect() -> Vec<u8> {
    vec![DISCONNECT, 0]
}

/// Client identifier for a session: short enough for any 3.1.1 broker.
pub fn client_id_for(session_id: &str) -> String {
    let digest = hex::encode(Sha256::digest(session_id.as_bytes()));
    format!("wzp-{}", &digest[..16])
}

/// Reassembles packets from a byte stream.
#[derive(Debug, Default)]
pub struct PacketReader {
    buf: Vec<u8>,
}

impl PacketReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Next complete packet, or `None` until more bytes arrive.
    pub fn next_packet(&mut self) -> Result<Option<Packet>, MqttError> {
        if self.buf.is_empty() {
            return Ok(None);
        }

        let mut len = 0usize;
        let mut multiplier = 1usize;
        let mut idx = 1;
        loop {
            let Some(&byte) = self.buf.get(idx) else {
                return Ok(None);
            };
            len += (byte & 0x7F) as usize * multiplier;
            idx += 1;
            if byte & 0x80 == 0 {
                break;
            }
            if idx > 4 {
                return Err(MqttError::MalformedLength);
            }
            multiplier *= 128;
        }

        let end = idx + len;
        if self.buf.len() < end {
            return Ok(None);
        }

        let first = self.buf[0];
        let body: Vec<u8> = self.buf[idx..end].to_vec();
        self.buf.drain(..end);

        let packet = match first & 0xF0 {
            CONNACK => {
                if body.len() != 2 {
                    return Err(MqttError::Malformed("CONNACK"));
                }
                Packet::ConnAck {
                    session_present: body[0] & 0x01 == 0x01,
                    code: body[1],
                }
            }
            PINGRESP => Packet::PingResp,
            other => Packet::Other(other >> 4),
        };
        Ok(Some(packet))
    }
}

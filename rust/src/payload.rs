//! Beacon wire payload.
//!
//! One JSON object per message. Listeners must tolerate unknown and missing
//! optional fields, so deserialization here does the same.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Message type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Start,
    State,
    Stop,
}

/// Player state supplied by the host application.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PlayerSnapshot {
    pub name: String,
    pub youtube_id: Option<String>,
    pub playlist_id: Option<String>,
    pub playing: bool,
    /// Position in seconds.
    pub position: f64,
    /// Duration in seconds.
    pub duration: f64,
    /// 0.0 to 1.0.
    pub volume: f64,
    pub muted: bool,
    pub rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeaconMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub session_id: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub youtube_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub playlist_id: Option<String>,
    #[serde(default)]
    pub playing: bool,
    #[serde(default)]
    pub t: f64,
    #[serde(default)]
    pub duration: f64,
    #[serde(default)]
    pub volume: f64,
    #[serde(default)]
    pub muted: bool,
    #[serde(default = "default_rate")]
    pub rate: f64,
    pub ts: String,
}

fn default_rate() -> f64 {
    1.0
}

fn round_to(value: f64, decimals: i32) -> f64 {
    if !value.is_finite() {
        return 0.0;
    }
    let factor = 10_f64.powi(decimals);
    (value * factor).round() / factor
}

impl BeaconMessage {
    pub fn new(
        kind: MessageKind,
        session_id: &str,
        source: &str,
        snapshot: &PlayerSnapshot,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            kind,
            session_id: session_id.to_string(),
            source: source.to_string(),
            name: snapshot.name.clone(),
            youtube_id: snapshot.youtube_id.clone(),
            playlist_id: snapshot.playlist_id.clone(),
            playing: snapshot.playing,
            t: round_to(snapshot.position.max(0.0), 1),
            duration: round_to(snapshot.duration.max(0.0), 1),
            volume: round_to(snapshot.volume.clamp(0.0, 1.0), 2),
            muted: snapshot.muted,
            rate: if snapshot.rate.is_finite() && snapshot.rate > 0.0 {
                snapshot.rate
            } else {
                default_rate()
            },
            ts: now.to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(data: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(data)
    }
}

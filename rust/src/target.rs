//! Beacon target profiles and active-target resolution.
//!
//! A target is beacon-capable when it speaks plain WebSocket, or MQTT carried
//! over a `ws://`/`wss://` URL. Everything else (WebRTC signaling, RTSP,
//! HTTP) can be configured for other player features but never carries the
//! state beacon.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use url::Url;

/// Wire protocol of a target profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Ws,
    Wss,
    Mqtt,
    Mqtts,
    Webrtc,
    Rtsp,
    Http,
    Https,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ws => "ws",
            Self::Wss => "wss",
            Self::Mqtt => "mqtt",
            Self::Mqtts => "mqtts",
            Self::Webrtc => "webrtc",
            Self::Rtsp => "rtsp",
            Self::Http => "http",
            Self::Https => "https",
        }
    }

    /// MQTT family, regardless of the carrying URL.
    pub fn is_mqtt(self) -> bool {
        matches!(self, Self::Mqtt | Self::Mqtts)
    }

    pub fn is_websocket(self) -> bool {
        matches!(self, Self::Ws | Self::Wss)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ws" => Ok(Self::Ws),
            "wss" => Ok(Self::Wss),
            "mqtt" => Ok(Self::Mqtt),
            "mqtts" => Ok(Self::Mqtts),
            "webrtc" => Ok(Self::Webrtc),
            "rtsp" => Ok(Self::Rtsp),
            "http" => Ok(Self::Http),
            "https" => Ok(Self::Https),
            other => Err(format!("unknown protocol: {other}")),
        }
    }
}

/// What a profile is meant for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TargetRole {
    #[default]
    Primary,
    Fallback,
    LowLatency,
    Bridge,
}

/// A configured endpoint the beacon may connect to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetProfile {
    pub id: String,
    pub name: String,
    pub protocol: Protocol,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signaling_url: Option<String>,
    #[serde(default)]
    pub role: TargetRole,
    #[serde(default)]
    pub builtin: bool,
}

impl TargetProfile {
    /// User-defined profile.
    pub fn custom(id: impl Into<String>, protocol: Protocol, url: Option<&str>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            protocol,
            url: url.map(str::to_string),
            channel: None,
            signaling_url: None,
            role: TargetRole::Primary,
            builtin: false,
        }
    }

    fn builtin(
        id: &str,
        name: &str,
        protocol: Protocol,
        url: Option<&str>,
        channel: Option<&str>,
        role: TargetRole,
    ) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            protocol,
            url: url.map(str::to_string),
            channel: channel.map(str::to_string),
            signaling_url: None,
            role,
            builtin: true,
        }
    }
}

/// A resolved, connectable beacon target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetInfo {
    pub id: String,
    pub name: String,
    pub protocol: Protocol,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
}

impl TargetInfo {
    pub fn is_mqtt(&self) -> bool {
        self.protocol.is_mqtt()
    }
}

/// Persisted beacon preferences.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BeaconSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_target: Option<String>,
    #[serde(default)]
    pub custom_targets: Vec<TargetProfile>,
}

/// Targets shipped with the player.
pub fn builtin_targets() -> Vec<TargetProfile> {
    vec![
        TargetProfile::builtin(
            "local-mqtt",
            "Local MQTT broker (WebSocket)",
            Protocol::Mqtt,
            Some("ws://localhost:9001"),
            Some(crate::transport::DEFAULT_CHANNEL_PREFIX),
            TargetRole::Primary,
        ),
        TargetProfile::builtin(
            "local-ws",
            "Local WebSocket relay",
            Protocol::Ws,
            Some("ws://localhost:8765/beacon"),
            None,
            TargetRole::Fallback,
        ),
        TargetProfile {
            signaling_url: Some("ws://localhost:8765/signal".to_string()),
            ..TargetProfile::builtin(
                "local-webrtc",
                "Local WebRTC peer",
                Protocol::Webrtc,
                None,
                None,
                TargetRole::LowLatency,
            )
        },
        TargetProfile::builtin(
            "local-rtsp",
            "Local RTSP bridge",
            Protocol::Rtsp,
            Some("rtsp://localhost:8554/player"),
            None,
            TargetRole::Bridge,
        ),
    ]
}

/// Built-ins followed by the user's custom targets.
pub fn all_targets(settings: &BeaconSettings) -> Vec<TargetProfile> {
    let mut targets = builtin_targets();
    targets.extend(settings.custom_targets.iter().cloned());
    targets
}

fn parse_url(raw: Option<&str>) -> Option<Url> {
    let raw = raw?.trim();
    if raw.is_empty() {
        return None;
    }
    Url::parse(raw).ok()
}

fn is_ws_scheme(url: &Url) -> bool {
    matches!(url.scheme(), "ws" | "wss")
}

/// Whether the profile can carry the state beacon.
pub fn is_beacon_capable(profile: &TargetProfile) -> bool {
    if profile.protocol.is_websocket() {
        return true;
    }
    if profile.protocol.is_mqtt() {
        return parse_url(profile.url.as_deref()).is_some_and(|u| is_ws_scheme(&u));
    }
    false
}

fn connectable(profile: &TargetProfile) -> Option<TargetInfo> {
    if !is_beacon_capable(profile) {
        return None;
    }
    let raw = profile.url.as_deref()?.trim();
    if !parse_url(Some(raw)).is_some_and(|u| is_ws_scheme(&u)) {
        return None;
    }
    Some(TargetInfo {
        id: profile.id.clone(),
        name: if profile.name.is_empty() {
            profile.id.clone()
        } else {
            profile.name.clone()
        },
        protocol: profile.protocol,
        url: raw.to_string(),
        channel: profile.channel.clone(),
    })
}

/// Pick the target the beacon should connect to.
///
/// The selected target wins when it is capable and has a usable URL;
/// otherwise the first capable built-in in list order; otherwise `None`.
pub fn resolve_active(profiles: &[TargetProfile], settings: &BeaconSettings) -> Option<TargetInfo> {
    if let Some(selected_id) = settings.active_target.as_deref() {
        let selected = profiles
            .iter()
            .chain(settings.custom_targets.iter())
            .find(|p| p.id == selected_id);
        if let Some(info) = selected.and_then(connectable) {
            return Some(info);
        }
    }

    profiles
        .iter()
        .filter(|p| p.builtin)
        .find_map(connectable)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(protocol: &str, url: &str) -> TargetProfile {
        TargetProfile::custom("t", protocol.parse().unwrap(), Some(url))
    }

    #[test]
    fn capability_predicate() {
        assert!(is_beacon_capable(&profile("wss", "wss://x")));
        assert!(is_beacon_capable(&profile("ws", "ws://x")));
        assert!(!is_beacon_capable(&profile("rtsp", "rtsp://x")));
        assert!(is_beacon_capable(&profile("mqtts", "wss://x")));
        assert!(is_beacon_capable(&profile("mqtt", "ws://x:9001")));
        assert!(!is_beacon_capable(&profile("mqtts", "mqtts://x:8883")));
        assert!(!is_beacon_capable(&profile("https", "https://x")));
        assert!(!is_beacon_capable(&profile("webrtc", "wss://x")));
    }

    #[test]
    fn malformed_mqtt_is_not_capable() {
        assert!(!is_beacon_capable(&TargetProfile::custom(
            "m",
            Protocol::Mqtt,
            None
        )));
        assert!(!is_beacon_capable(&profile("mqtt", "   ")));
        assert!(!is_beacon_capable(&profile("mqtt", "not a url")));
    }

    #[test]
    fn protocol_parse_and_display() {
        assert_eq!("MQTTS".parse::<Protocol>().unwrap(), Protocol::Mqtts);
        assert_eq!(Protocol::Webrtc.to_string(), "webrtc");
        assert!("gopher".parse::<Protocol>().is_err());
    }

    #[test]
    fn selected_capable_target_wins() {
        let custom = TargetProfile {
            name: "Studio".to_string(),
            channel: Some("studio".to_string()),
            ..profile("mqtts", "wss://broker.example:8084/mqtt")
        };
        let settings = BeaconSettings {
            active_target: Some("t".to_string()),
            custom_targets: vec![custom],
        };
        let info = resolve_active(&builtin_targets(), &settings).unwrap();
        assert_eq!(info.id, "t");
        assert_eq!(info.name, "Studio");
        assert_eq!(info.url, "wss://broker.example:8084/mqtt");
        assert_eq!(info.channel.as_deref(), Some("studio"));
        assert!(info.is_mqtt());
    }

    #[test]
    fn non_capable_selection_falls_back_to_first_capable_builtin() {
        let rtsp = TargetProfile::builtin(
            "cam",
            "Camera",
            Protocol::Rtsp,
            Some("rtsp://cam"),
            None,
            TargetRole::Bridge,
        );
        let ws = TargetProfile::builtin(
            "relay",
            "Relay",
            Protocol::Wss,
            Some("wss://relay.example/beacon"),
            None,
            TargetRole::Fallback,
        );
        let settings = BeaconSettings {
            active_target: Some("mine".to_string()),
            custom_targets: vec![TargetProfile::custom(
                "mine",
                Protocol::Mqtts,
                Some("mqtts://x:8883"),
            )],
        };
        let info = resolve_active(&[rtsp, ws], &settings).unwrap();
        assert_eq!(info.id, "relay");
        assert_eq!(info.protocol, Protocol::Wss);
    }

    #[test]
    fn ws_profile_without_url_is_skipped() {
        let no_url = TargetProfile::builtin(
            "empty",
            "Empty",
            Protocol::Ws,
            None,
            None,
            TargetRole::Primary,
        );
        let ok = TargetProfile::builtin(
            "ok",
            "Ok",
            Protocol::Ws,
            Some("ws://ok"),
            None,
            TargetRole::Fallback,
        );
        let info = resolve_active(&[no_url, ok], &BeaconSettings::default()).unwrap();
        assert_eq!(info.id, "ok");
    }

    #[test]
    fn nothing_usable_is_none() {
        let rtsp = TargetProfile::builtin(
            "cam",
            "Camera",
            Protocol::Rtsp,
            Some("rtsp://cam"),
            None,
            TargetRole::Bridge,
        );
        assert_eq!(resolve_active(&[rtsp], &BeaconSettings::default()), None);
        assert_eq!(resolve_active(&[], &BeaconSettings::default()), None);
    }

    #[test]
    fn custom_targets_are_not_fallbacks() {
        let settings = BeaconSettings {
            active_target: None,
            custom_targets: vec![profile("ws", "ws://custom")],
        };
        assert_eq!(resolve_active(&settings.custom_targets, &settings), None);
    }

    #[test]
    fn builtins_resolve_to_local_mqtt() {
        let targets = builtin_targets();
        assert!(targets.iter().all(|t| t.builtin));
        let info = resolve_active(&targets, &BeaconSettings::default()).unwrap();
        assert_eq!(info.id, "local-mqtt");
        assert!(info.is_mqtt());
        assert_eq!(info.url, "ws://localhost:9001");
    }

    #[test]
    fn resolved_url_is_kept_as_configured() {
        let settings = BeaconSettings {
            active_target: Some("relay".to_string()),
            custom_targets: vec![TargetProfile::custom(
                "relay",
                Protocol::Ws,
                Some("  ws://relay.test:8080  "),
            )],
        };
        let info = resolve_active(&all_targets(&settings), &settings).unwrap();
        assert_eq!(info.url, "ws://relay.test:8080");
    }

    #[test]
    fn settings_json_shape() {
        let raw = r#"{
            "activeTarget": "studio",
            "customTargets": [
                {"id": "studio", "name": "Studio", "protocol": "mqtts",
                 "url": "wss://broker/mqtt", "channel": "studio/player",
                 "signalingUrl": "wss://sig", "role": "low-latency"}
            ]
        }"#;
        let settings: BeaconSettings = serde_json::from_str(raw).unwrap();
        let t = &settings.custom_targets[0];
        assert_eq!(t.protocol, Protocol::Mqtts);
        assert_eq!(t.role, TargetRole::LowLatency);
        assert_eq!(t.signaling_url.as_deref(), Some("wss://sig"));
        assert!(!t.builtin);

        let info = resolve_active(&all_targets(&settings), &settings).unwrap();
        assert_eq!(info.id, "studio");
    }
}

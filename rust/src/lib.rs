//! waldiez-beacon: WID session identifiers and a player-state beacon.
//!
//! A beacon session is named by a WID, a time-ordered, human-readable
//! identifier whose generator state survives restarts, and broadcasts
//! `start` / `state` / `stop` messages to a WebSocket relay or to an MQTT
//! broker reached over WebSocket.
//!
//! # Format
//!
//! ```text
//! WID ::= YYYYMMDD "T" HHMMSS "." FRACTION "Z" "-" HEX{6,}
//! ```
//!
//! # Example
//!
//! ```
//! use beacon::{WidGen, WidGenOptions, validate_wid};
//!
//! let mut ids = WidGen::new(WidGenOptions::default()).expect("valid default generator params");
//! let wid = ids.next_wid();
//! assert!(validate_wid(&wid)); // e.g. "20260227T143052.1230000Z-a3f91c"
//! ```

mod clock;
mod config;
mod mqtt;
mod payload;
mod session;
mod store;
mod target;
mod transport;
mod wid;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BeaconConfig, CONFIG_ENV, ConfigError, DATA_DIR_ENV, NAMESPACE_ENV};
pub use mqtt::{MqttError, Packet, PacketReader, client_id_for};
pub use payload::{BeaconMessage, MessageKind, PlayerSnapshot};
pub use session::{BeaconSession, SessionState};
pub use store::{FileStore, MemoryStore, StateStore, StoreError, WidState, state_key};
pub use target::{
    BeaconSettings, Protocol, TargetInfo, TargetProfile, TargetRole, all_targets,
    builtin_targets, is_beacon_capable, resolve_active,
};
pub use transport::{
    BeaconTransport, ConnectionState, DEFAULT_CHANNEL_PREFIX, FnCallbacks, Frame,
    MQTT_KEEP_ALIVE_SECS, MQTT_SUBPROTOCOL, NORMAL_CLOSURE, TransportCallbacks, TransportError,
    TransportEvent, TungsteniteConnector, WsConnector, WsLink, topic_for, wildcard_topic,
};
pub use wid::{
    MAX_SEQ_WIDTH, MIN_SUFFIX_LEN, ParsedWid, TimeUnit, WidError, WidGen, WidGenOptions, is_wid,
    parse_wid, parse_wid_with_unit, validate_wid, validate_wid_with_unit,
};

/// MQTT 3.1.1 packet encoders, for tests and tooling that speak to brokers.
pub mod packets {
    pub use crate::mqtt::{connect, disconnect, pingreq, publish, refusal_reason};
}

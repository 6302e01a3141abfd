//! WID (Waldiez session identifier) generation and validation.
//!
//! Format: `YYYYMMDDTHHMMSS.<fraction>Z-<hex>`
//!
//! - `sec`: the fraction is the `W`-digit sequence within the second.
//! - `ms`: the fraction is 3 millisecond digits followed by the `W`-digit
//!   sequence within the millisecond.
//!
//! Every field is fixed width, so string order is generation order. The
//! generator implements `Iterator<Item = String>`; `next_wid()` is the
//! explicit domain API.

use chrono::{DateTime, TimeZone, Timelike, Utc};
use once_cell::sync::Lazy;
use rand::random_range;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::store::{MemoryStore, StateStore, WidState, state_key};

/// Minimum number of random hex characters in a WID.
pub const MIN_SUFFIX_LEN: usize = 6;
/// Largest sequence width that still fits the counter in an `i64`.
pub const MAX_SEQ_WIDTH: usize = 9;

const HEX: &[u8; 16] = b"0123456789abcdef";
/// 9999-12-31T23:59:59Z, the last second with a four-digit year.
const MAX_TICK_SEC: i64 = 253_402_300_799;

/// Errors that can occur during WID operations.
#[derive(Error, Debug)]
pub enum WidError {
    #[error("Invalid W parameter: must be between 1 and 9")]
    InvalidW,
    #[error("Invalid Z parameter: must be >= 6")]
    InvalidZ,
    #[error("Invalid namespace: {0:?}")]
    InvalidNamespace(String),
    #[error("Invalid WID format: {0}")]
    InvalidFormat(String),
    #[error("Invalid timestamp in WID")]
    InvalidTimestamp,
}

/// Tick resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Sec,
    #[default]
    Ms,
}

impl TimeUnit {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sec => "sec",
            Self::Ms => "ms",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sec" => Some(Self::Sec),
            "ms" => Some(Self::Ms),
            _ => None,
        }
    }

    /// Largest tick that still renders as `YYYYMMDDTHHMMSS`.
    pub fn max_tick(self) -> i64 {
        match self {
            Self::Sec => MAX_TICK_SEC,
            Self::Ms => MAX_TICK_SEC * 1000 + 999,
        }
    }

    fn fraction_digits(self, w: usize) -> usize {
        match self {
            Self::Sec => w,
            Self::Ms => 3 + w,
        }
    }
}

/// Parsed WID components.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedWid {
    pub raw: String,
    pub timestamp: DateTime<Utc>,
    pub sequence: u32,
    pub suffix: String,
}

impl ParsedWid {
    /// Get Unix timestamp in seconds.
    pub fn timestamp_sec(&self) -> i64 {
        self.timestamp.timestamp()
    }
}

static WID_SHAPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d{8})T(\d{6})\.(\d+)Z-([0-9a-f]{6,})$").expect("static WID pattern")
});

/// Shape check shared by every `W` and time unit.
pub fn is_wid(s: &str) -> bool {
    WID_SHAPE.is_match(s)
}

fn parse_timestamp(date_str: &str, time_str: &str, millis: u32) -> Option<DateTime<Utc>> {
    let year: i32 = date_str[0..4].parse().ok()?;
    let month: u32 = date_str[4..6].parse().ok()?;
    let day: u32 = date_str[6..8].parse().ok()?;
    let hour: u32 = time_str[0..2].parse().ok()?;
    let minute: u32 = time_str[2..4].parse().ok()?;
    let second: u32 = time_str[4..6].parse().ok()?;
    Utc.with_ymd_and_hms(year, month, day, hour, minute, second)
        .single()?
        .with_nanosecond(millis * 1_000_000)
}

/// Parse a WID string for a given sequence width and time unit.
pub fn parse_wid_with_unit(
    wid: &str,
    w: usize,
    time_unit: TimeUnit,
) -> Result<ParsedWid, WidError> {
    if w == 0 || w > MAX_SEQ_WIDTH {
        return Err(WidError::InvalidW);
    }

    let caps = WID_SHAPE
        .captures(wid)
        .ok_or_else(|| WidError::InvalidFormat(wid.to_string()))?;

    let fraction = &caps[3];
    if fraction.len() != time_unit.fraction_digits(w) {
        return Err(WidError::InvalidFormat(wid.to_string()));
    }

    let (millis_str, seq_str) = match time_unit {
        TimeUnit::Sec => ("0", fraction),
        TimeUnit::Ms => fraction.split_at(3),
    };
    let millis: u32 = millis_str
        .parse()
        .map_err(|_| WidError::InvalidFormat(wid.to_string()))?;
    let sequence: u32 = seq_str
        .parse()
        .map_err(|_| WidError::InvalidFormat(wid.to_string()))?;

    let timestamp =
        parse_timestamp(&caps[1], &caps[2], millis).ok_or(WidError::InvalidTimestamp)?;

    Ok(ParsedWid {
        raw: wid.to_string(),
        timestamp,
        sequence,
        suffix: caps[4].to_string(),
    })
}

/// Parse a WID produced with the default options (W=4, `ms`).
pub fn parse_wid(wid: &str) -> Result<ParsedWid, WidError> {
    parse_wid_with_unit(wid, 4, TimeUnit::Ms)
}

/// Validate a WID string for a given sequence width and time unit.
pub fn validate_wid_with_unit(wid: &str, w: usize, time_unit: TimeUnit) -> bool {
    parse_wid_with_unit(wid, w, time_unit).is_ok()
}

/// Validate a WID produced with the default options.
pub fn validate_wid(wid: &str) -> bool {
    validate_wid_with_unit(wid, 4, TimeUnit::Ms)
}

/// Generator configuration.
#[derive(Debug, Clone)]
pub struct WidGenOptions {
    /// Sequence digits.
    pub w: usize,
    /// Random hex characters.
    pub z: usize,
    pub time_unit: TimeUnit,
    /// Disambiguates generators sharing one store.
    pub namespace: String,
    /// Write state through to the store after every ID.
    pub auto_persist: bool,
}

impl Default for WidGenOptions {
    fn default() -> Self {
        Self {
            w: 4,
            z: MIN_SUFFIX_LEN,
            time_unit: TimeUnit::Ms,
            namespace: "default".to_string(),
            auto_persist: true,
        }
    }
}

impl WidGenOptions {
    pub fn with_namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            ..Self::default()
        }
    }
}

fn is_valid_namespace(ns: &str) -> bool {
    !ns.is_empty() && !ns.chars().any(|c| c == ':' || c.is_whitespace())
}

/// WID generator with a monotonic sequence, random suffix and persisted
/// restart floor.
///
/// Backward clock jumps are clamped: the generator keeps counting inside the
/// last-used tick (borrowing the next tick when the sequence is exhausted)
/// until the clock catches up.
pub struct WidGen {
    w: usize,
    z: usize,
    time_unit: TimeUnit,
    namespace: String,
    key: String,
    auto_persist: bool,
    max_seq: i64,
    state: WidState,
    cached_sec: i64,
    cached_ts: String,
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    persist_failing: bool,
}

impl WidGen {
    /// Generator backed by a fresh in-memory store and the system clock.
    pub fn new(options: WidGenOptions) -> Result<Self, WidError> {
        Self::with_store(options, Arc::new(MemoryStore::new()))
    }

    /// Generator persisting through `store`, using the system clock.
    pub fn with_store(
        options: WidGenOptions,
        store: Arc<dyn StateStore>,
    ) -> Result<Self, WidError> {
        Self::with_parts(options, store, Arc::new(SystemClock))
    }

    /// Generator with every collaborator supplied.
    pub fn with_parts(
        options: WidGenOptions,
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, WidError> {
        if options.w == 0 || options.w > MAX_SEQ_WIDTH {
            return Err(WidError::InvalidW);
        }
        if options.z < MIN_SUFFIX_LEN {
            return Err(WidError::InvalidZ);
        }
        if !is_valid_namespace(&options.namespace) {
            return Err(WidError::InvalidNamespace(options.namespace));
        }

        let max_seq = 10_i64.pow(options.w as u32) - 1;

        let mut generator = Self {
            w: options.w,
            z: options.z,
            time_unit: options.time_unit,
            key: state_key(&options.namespace, options.time_unit),
            namespace: options.namespace,
            auto_persist: options.auto_persist,
            max_seq,
            state: WidState {
                last_tick: 0,
                sequence: 0,
            },
            cached_sec: -1,
            cached_ts: String::new(),
            store,
            clock,
            persist_failing: false,
        };
        generator.load_floor();
        Ok(generator)
    }

    /// Generator with default parameters and an in-memory store.
    pub fn default_params() -> Self {
        Self::new(WidGenOptions::default()).expect("default parameters should always be valid")
    }

    fn load_floor(&mut self) {
        match self.store.load(&self.key) {
            Ok(Some(state)) if self.accepts(&state) => {
                debug!(
                    namespace = %self.namespace,
                    last_tick = state.last_tick,
                    sequence = state.sequence,
                    "restored WID state"
                );
                self.restore_state(state);
            }
            Ok(Some(state)) => {
                warn!(namespace = %self.namespace, ?state, "ignoring invalid persisted WID state");
            }
            Ok(None) => {}
            Err(e) => {
                warn!(namespace = %self.namespace, "could not load WID state, starting in memory: {e}");
            }
        }
    }

    /// Whether `state` can serve as a floor for this generator's unit.
    fn accepts(&self, state: &WidState) -> bool {
        state.is_valid() && state.last_tick <= self.time_unit.max_tick()
    }

    fn ts_for_sec(&mut self, sec: i64) -> &str {
        if sec != self.cached_sec {
            self.cached_sec = sec;
            // Ticks are kept within `max_tick`, so the clamp never bites.
            let dt = DateTime::<Utc>::from_timestamp(sec.clamp(0, MAX_TICK_SEC), 0)
                .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
            self.cached_ts = dt.format("%Y%m%dT%H%M%S").to_string();
        }
        &self.cached_ts
    }

    fn current_tick(&self) -> i64 {
        let now = self.clock.now();
        match self.time_unit {
            TimeUnit::Sec => now.timestamp(),
            TimeUnit::Ms => now.timestamp_millis(),
        }
    }

    fn random_suffix(&self) -> String {
        (0..self.z)
            .map(|_| HEX[random_range(0..HEX.len())] as char)
            .collect()
    }

    /// Generate the next WID (domain API).
    pub fn next_wid(&mut self) -> String {
        let now_tick = self.current_tick();
        let mut tick = now_tick.max(self.state.last_tick);

        let mut seq = if tick == self.state.last_tick {
            self.state.sequence + 1
        } else {
            0
        };

        if seq > self.max_seq {
            match tick.checked_add(1).filter(|t| *t <= self.time_unit.max_tick()) {
                Some(next) => {
                    tick = next;
                    seq = 0;
                }
                None => seq = self.max_seq,
            }
        }

        self.state = WidState {
            last_tick: tick,
            sequence: seq,
        };

        let (sec, fraction) = match self.time_unit {
            TimeUnit::Sec => (tick, format!("{:0width$}", seq, width = self.w)),
            TimeUnit::Ms => (
                tick.div_euclid(1000),
                format!(
                    "{:03}{:0width$}",
                    tick.rem_euclid(1000),
                    seq,
                    width = self.w
                ),
            ),
        };

        let mut wid = String::with_capacity(17 + fraction.len() + 2 + self.z);
        wid.push_str(self.ts_for_sec(sec));
        wid.push('.');
        wid.push_str(&fraction);
        wid.push_str("Z-");
        wid.push_str(&self.random_suffix());

        if self.auto_persist {
            self.persist_best_effort();
        }

        wid
    }

    fn persist_best_effort(&mut self) {
        match self.store.save(&self.key, &self.state) {
            Ok(()) => {
                if self.persist_failing {
                    info!(namespace = %self.namespace, "WID state persistence recovered");
                    self.persist_failing = false;
                }
            }
            Err(e) => {
                if !self.persist_failing {
                    warn!(namespace = %self.namespace, "WID state not persisted, continuing in memory: {e}");
                    self.persist_failing = true;
                }
            }
        }
    }

    /// Write the current state to the store.
    pub fn persist(&self) -> Result<(), crate::store::StoreError> {
        self.store.save(&self.key, &self.state)
    }

    /// Generate n WIDs.
    pub fn next_n(&mut self, n: usize) -> Vec<String> {
        self.take(n).collect()
    }

    /// Raise the state floor. A state older than the current one, or one
    /// outside the tick range of this generator's unit, is ignored.
    pub fn restore_state(&mut self, state: WidState) {
        if !self.accepts(&state) {
            warn!(namespace = %self.namespace, ?state, "ignoring out-of-range WID state");
            return;
        }
        let incoming = (state.last_tick, state.sequence);
        let current = (self.state.last_tick, self.state.sequence);
        if incoming > current {
            self.state = WidState {
                last_tick: state.last_tick,
                sequence: state.sequence.min(self.max_seq),
            };
        }
    }

    /// Get current state.
    pub fn state(&self) -> WidState {
        self.state
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Active time unit.
    pub fn time_unit(&self) -> TimeUnit {
        self.time_unit
    }

    /// Sequence width.
    pub fn w(&self) -> usize {
        self.w
    }
}

impl Iterator for WidGen {
    type Item = String;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        Some(self.next_wid())
    }
}

//! UTC time sources for WID generation.

use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

/// Source of the current UTC instant.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Settable clock with microsecond resolution.
///
/// Clones share the same instant, so a caller can keep one handle and move
/// time under a generator that owns another.
#[derive(Debug, Clone)]
pub struct ManualClock {
    micros: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self {
            micros: Arc::new(AtomicI64::new(at.timestamp_micros())),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        self.micros.store(at.timestamp_micros(), Ordering::SeqCst);
    }

    pub fn advance_ms(&self, ms: i64) {
        self.micros.fetch_add(ms * 1_000, Ordering::SeqCst);
    }

    pub fn rewind_ms(&self, ms: i64) {
        self.micros.fetch_sub(ms * 1_000, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        let micros = self.micros.load(Ordering::SeqCst);
        // Out-of-range instants cannot be constructed through `set`.
        Utc.timestamp_micros(micros)
            .single()
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }
}

//! Wall-clock source for schedules. Zone timers use the tokio monotonic clock
//! instead; only "what day / minute is it" goes through here.

use std::sync::{Mutex, PoisonError};
use time::{OffsetDateTime, PrimitiveDateTime};

pub trait Clock: Send + Sync {
    /// Local civil time.
    fn now(&self) -> PrimitiveDateTime;
}

/// Host clock, local offset when the platform can report it, UTC otherwise.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> PrimitiveDateTime {
        let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
        PrimitiveDateTime::new(now.date(), now.time())
    }
}

/// Settable clock for tests.
pub struct FixedClock(Mutex<PrimitiveDateTime>);

impl FixedClock {
    pub fn new(at: PrimitiveDateTime) -> Self {
        Self(Mutex::new(at))
    }

    pub fn set(&self, at: PrimitiveDateTime) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = at;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> PrimitiveDateTime {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// `HH:MM` as stored in program activation times.
pub fn hh_mm(at: PrimitiveDateTime) -> String {
    format!("{:02}:{:02}", at.hour(), at.minute())
}

/// `YYYY-MM-DD` as stored in `last_run_date`.
pub fn yyyy_mm_dd(at: PrimitiveDateTime) -> String {
    format!("{:04}-{:02}-{:02}", at.year(), at.month() as u8, at.day())
}

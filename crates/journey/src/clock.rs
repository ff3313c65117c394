//! Wall-clock source. Deadlines are stored as absolute times so that a
//! restart or a background/foreground cycle recomputes elapsed time instead
//! of resetting it.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Longest span a campaign may configure: 100 years.
pub const MAX_SPAN_SECS: u64 = 100 * 365 * 86_400;

/// `secs` as a duration, or `None` when chrono cannot represent it.
pub fn span(secs: u64) -> Option<Duration> {
    i64::try_from(secs).ok().and_then(Duration::try_seconds)
}

/// `at + secs`, or `None` on overflow.
pub fn after(at: DateTime<Utc>, secs: u64) -> Option<DateTime<Utc>> {
    span(secs).and_then(|d| at.checked_add_signed(d))
}

/// `at - secs`, or `None` on overflow.
pub fn before(at: DateTime<Utc>, secs: u64) -> Option<DateTime<Utc>> {
    span(secs).and_then(|d| at.checked_sub_signed(d))
}

//! Time sources.
//!
//! Cooldowns and token refill use a monotonic [`Instant`]; quota ledgers roll
//! over on the calendar day.  Both come from a [`Clock`] so tests can drive
//! them without sleeping.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::NaiveDate;

/// Source of monotonic time and the current calendar day.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    fn today(&self) -> NaiveDate;
}

/// Wall clock: `Instant::now()` and the local date.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn today(&self) -> NaiveDate {
        chrono::Local::now().date_naive()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    inner: Mutex<ManualInner>,
}

#[derive(Debug)]
struct ManualInner {
    now: Instant,
    today: NaiveDate,
}

impl ManualClock {
    pub fn new(today: NaiveDate) -> Self {
        Self {
            inner: Mutex::new(ManualInner {
                now: Instant::now(),
                today,
            }),
        }
    }

    /// Move monotonic time forward.
    pub fn advance(&self, by: Duration) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.now += by;
    }

    /// Jump to another calendar day.
    pub fn set_today(&self, today: NaiveDate) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.today = today;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(NaiveDate::from_ymd_opt(2025, 1, 1).unwrap_or_default())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).now
    }

    fn today(&self) -> NaiveDate {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).today
    }
}

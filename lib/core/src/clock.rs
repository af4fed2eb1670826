//! Time sources.
//!
//! The engine never reads the system clock directly; every component takes a
//! [`SharedClock`] so leases, backoff, and wait deadlines can be driven by a
//! [`ManualClock`] in tests.

use chrono::{DateTime, Duration, Utc};
use std::fmt;
use std::sync::{Arc, Mutex};

/// A source of the current time.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Returns the current instant. Successive calls never go backwards.
    fn now(&self) -> DateTime<Utc>;
}

/// Clock handle shared across components.
pub type SharedClock = Arc<dyn Clock>;

/// Adds a std duration to an instant, saturating at the latest representable time.
#[must_use]
pub fn after(at: DateTime<Utc>, by: std::time::Duration) -> DateTime<Utc> {
    Duration::from_std(by)
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Wall-clock time, clamped so it never moves backwards.
#[derive(Debug, Default)]
pub struct SystemClock {
    last: Mutex<Option<DateTime<Utc>>>,
}

impl SystemClock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn shared() -> SharedClock {
        Arc::new(Self::new())
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        let now = Utc::now();
        match self.last.lock() {
            Ok(mut last) => {
                let monotonic = match *last {
                    Some(previous) if previous > now => previous,
                    _ => now,
                };
                *last = Some(monotonic);
                monotonic
            }
            Err(_) => now,
        }
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    #[must_use]
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Moves the clock forward. Negative durations are ignored.
    pub fn advance(&self, by: Duration) {
        if by <= Duration::zero() {
            return;
        }
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }

    /// Sets the clock, refusing to move it backwards.
    pub fn set(&self, to: DateTime<Utc>) {
        if let Ok(mut now) = self.now.lock() {
            if to > *now {
                *now = to;
            }
        }
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.lock().map(|now| *now).unwrap_or_else(|_| Utc::now())
    }
}

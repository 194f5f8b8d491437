//! Wall-clock sources.
//!
//! The scheduler needs zoned local time: scrub windows are expressed in
//! local weekdays and hours. [`SystemClock`] reads the host clock in the
//! system time zone; [`ManualClock`] is set explicitly and is what tests and
//! simulations drive.

use jiff::{SignedDuration, Zoned};
use parking_lot::Mutex;

/// Source of "now" for the scheduler.
pub trait Clock: Send + Sync {
    fn now(&self) -> Zoned;
}

/// Host clock in the system time zone.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Zoned {
        Zoned::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Zoned>,
}

impl ManualClock {
    #[must_use]
    pub fn new(start: Zoned) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, now: Zoned) {
        *self.now.lock() = now;
    }

    /// Move the clock forward. Overflowing the supported range leaves the
    /// clock unchanged.
    pub fn advance(&self, by: SignedDuration) {
        let mut now = self.now.lock();
        if let Ok(next) = now.checked_add(by) {
            *now = next;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Zoned {
        self.now.lock().clone()
    }
}

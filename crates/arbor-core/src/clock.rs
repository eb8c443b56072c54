//! Time sources for store timestamps.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

/// Supplies "now" in microseconds since the Unix epoch.
pub trait Clock: fmt::Debug + Send + Sync {
    fn now_us(&self) -> i64;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_us(&self) -> i64 {
        chrono::Utc::now().timestamp_micros()
    }
}

/// Settable clock for tests and simulations.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_us: AtomicI64,
}

impl ManualClock {
    #[must_use]
    pub const fn new(start_us: i64) -> Self {
        Self {
            now_us: AtomicI64::new(start_us),
        }
    }

    pub fn set(&self, now_us: i64) {
        self.now_us.store(now_us, Ordering::SeqCst);
    }

    /// Move forward by `delta_us`, returning the new time.
    pub fn advance(&self, delta_us: i64) -> i64 {
        self.now_us.fetch_add(delta_us, Ordering::SeqCst) + delta_us
    }
}

impl Clock for ManualClock {
    fn now_us(&self) -> i64 {
        self.now_us.load(Ordering::SeqCst)
    }
}

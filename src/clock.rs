//! Time source
//!
//! Expiry checks read the wall clock through [`TimeService`] so tests can
//! drive time explicitly instead of sleeping.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock source in milliseconds since the unix epoch
pub trait TimeService: Send + Sync {
    fn wall_clock_millis(&self) -> i64;
}

/// The real system clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTimeService;

impl TimeService for SystemTimeService {
    fn wall_clock_millis(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64
    }
}

/// A clock that only moves when told to
#[derive(Debug)]
pub struct ControlledTimeService {
    now: AtomicI64,
}

impl ControlledTimeService {
    pub fn new(start_millis: i64) -> Self {
        Self {
            now: AtomicI64::new(start_millis),
        }
    }

    pub fn advance(&self, millis: i64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }

    pub fn set(&self, millis: i64) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

impl Default for ControlledTimeService {
    fn default() -> Self {
        Self::new(1_000_000)
    }
}

impl TimeService for ControlledTimeService {
    fn wall_clock_millis(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Expiry of `-1` (or any negative value) means "never"
#[inline]
pub fn is_expired(expiry: i64, now: i64) -> bool {
    expiry >= 0 && now >= expiry
}

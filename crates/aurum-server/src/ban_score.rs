//! Decaying misbehavior score.
//!
//! The score is the sum of a persistent part that never decays and a
//! transient part that halves every minute. A burst of misbehavior pushes
//! the combined value over the ban threshold while isolated incidents decay
//! away and let a peer rehabilitate.

use parking_lot::Mutex;
use std::time::Instant;

/// Half-life of the transient score component, in seconds.
const HALF_LIFE_SECS: f64 = 60.0;

/// Thread-safe dual-counter misbehavior score.
#[derive(Debug)]
pub struct DynamicBanScore {
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    persistent: u32,
    transient: f64,
    last_set: Instant,
}

impl DynamicBanScore {
    /// New score with both components at zero.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                persistent: 0,
                transient: 0.0,
                last_set: Instant::now(),
            }),
        }
    }

    /// The combined score at this instant, without mutation.
    pub fn current(&self) -> u32 {
        let inner = self.inner.lock();
        Self::combined(&inner, Instant::now())
    }

    /// Atomically add to both components and return the new combined score.
    ///
    /// The transient component is first decayed to its present value so the
    /// addition applies on top of whatever remains of earlier increments.
    pub fn increase(&self, persistent: u32, transient: u32) -> u32 {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        inner.persistent = inner.persistent.saturating_add(persistent);
        inner.transient = Self::decayed(&inner, now) + f64::from(transient);
        inner.last_set = now;
        Self::combined(&inner, now)
    }

    fn decayed(inner: &Inner, now: Instant) -> f64 {
        if inner.transient == 0.0 {
            return 0.0;
        }
        let elapsed = now.saturating_duration_since(inner.last_set).as_secs_f64();
        inner.transient * 0.5f64.powf(elapsed / HALF_LIFE_SECS)
    }

    fn combined(inner: &Inner, now: Instant) -> u32 {
        inner.persistent.saturating_add(Self::decayed(inner, now) as u32)
    }
}

impl Default for DynamicBanScore {
    fn default() -> Self {
        Self::new()
    }
}

/*!
 * Exponential Backoff
 *
 * Used wherever a CPU busy-waits on another CPU's progress: seqcount readers
 * waiting out an open write section, and cross-call workers waiting for a
 * CPU to drop its priority level.
 *
 * # Phases
 *
 * 1. **Spin phase**: doubling runs of `spin_loop()` hints
 * 2. **Yield phase**: `yield_now()` once the spin budget is used up
 * 3. **Park phase** (optional): `park_timeout()` with a fixed interval
 */

use std::hint;
use std::thread;
use std::time::Duration;

/// Doubling limit for the spin phase (2^6 = 64 hints per step)
const SPIN_LIMIT: u32 = 6;
/// Steps after which the yield phase begins
const YIELD_LIMIT: u32 = 10;

/// Exponential backoff state for one wait
#[derive(Debug)]
pub struct Backoff {
    step: u32,
    park_after: Option<(u32, Duration)>,
}

impl Backoff {
    /// Spin, then yield. Never sleeps.
    #[inline]
    pub const fn new() -> Self {
        Self {
            step: 0,
            park_after: None,
        }
    }

    /// Spin, yield, and once `steps` have elapsed park for `interval`
    /// between checks
    #[inline]
    pub const fn with_park(steps: u32, interval: Duration) -> Self {
        Self {
            step: 0,
            park_after: Some((steps, interval)),
        }
    }

    /// Wait one step
    ///
    /// # Performance
    ///
    /// Hot path for short waits: the first few calls never leave the CPU.
    #[inline]
    pub fn snooze(&mut self) {
        if self.step <= SPIN_LIMIT {
            for _ in 0..(1u32 << self.step) {
                hint::spin_loop();
            }
        } else {
            match self.park_after {
                Some((steps, interval)) if self.step > steps => thread::park_timeout(interval),
                _ => thread::yield_now(),
            }
        }

        if self.step <= YIELD_LIMIT || self.park_after.is_some() {
            self.step = self.step.saturating_add(1);
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

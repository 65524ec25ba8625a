/*!
 * Countdown Latch
 *
 * One-shot barrier: created with a count, each participant calls
 * `count_down()` once, `wait_for()` returns true once the count reaches zero.
 * Used by the cross-call pool to wait for every CPU's acknowledgement.
 */

use parking_lot::{Condvar, Mutex};
use std::time::Duration;

/// Countdown latch built on parking_lot's mutex and condvar
pub struct Countdown {
    remaining: Mutex<usize>,
    condvar: Condvar,
}

impl Countdown {
    /// Create a latch that opens after `count` calls to `count_down()`
    pub fn new(count: usize) -> Self {
        Self {
            remaining: Mutex::new(count),
            condvar: Condvar::new(),
        }
    }

    /// Record one arrival
    ///
    /// # Panics
    ///
    /// Counting down an open latch is a caller bug.
    pub fn count_down(&self) {
        let mut remaining = self.remaining.lock();
        assert!(*remaining > 0, "countdown latch released too many times");
        *remaining -= 1;
        if *remaining == 0 {
            self.condvar.notify_all();
        }
    }

    /// Block until the count reaches zero or `timeout` elapses
    ///
    /// Returns true if the latch opened.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let mut remaining = self.remaining.lock();
        while *remaining > 0 {
            if self.condvar.wait_for(&mut remaining, timeout).timed_out() {
                return *remaining == 0;
            }
        }
        true
    }

    /// Arrivals still outstanding
    pub fn remaining(&self) -> usize {
        *self.remaining.lock()
    }
}

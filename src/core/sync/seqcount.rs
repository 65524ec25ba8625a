/*!
 * Sequence Counter
 *
 * Generation counter for optimistic, retry-based reads of small values that
 * are read often and written rarely.
 *
 * # Protocol
 *
 * **Writer** (externally serialized, one at a time):
 * 1. `write_begin()`: generation becomes odd, then producer barrier
 * 2. Store the protected fields
 * 3. `write_end()`: producer barrier, then generation becomes even again
 *
 * **Reader**:
 * 1. `read_begin()`: wait for an even generation, consumer barrier
 * 2. Load the protected fields
 * 3. `read_retry(snapshot)`: consumer barrier, retry if the generation moved
 *
 * Protected fields must themselves be atomics (relaxed loads and stores are
 * enough); the barriers here supply all of the ordering.
 *
 * # Memory Ordering
 *
 * - Producer barrier = `fence(Release)`, consumer barrier = `fence(Acquire)`
 * - The odd store is followed by the release fence, so a reader whose data
 *   loads observe any new store also observes the odd generation on retry
 * - The even store is preceded by the release fence, so a reader that
 *   observes the even generation observes every protected store
 */

use super::backoff::Backoff;
use std::sync::atomic::{compiler_fence, fence, AtomicU32, Ordering};

/// Poison written by `destroy()` (the all-ones pattern, odd on purpose so
/// that any later write_begin trips its parity assertion)
pub const SEQCOUNT_DESTROYED: u32 = u32::MAX;

/// Generation counter: even = stable, odd = write in progress
#[derive(Debug)]
pub struct SeqCount {
    generation: AtomicU32,
}

#[inline(always)]
const fn writing(generation: u32) -> bool {
    generation & 1 != 0
}

impl SeqCount {
    /// Create a counter at generation 0
    #[inline]
    pub const fn new() -> Self {
        Self {
            generation: AtomicU32::new(0),
        }
    }

    /// Reset to generation 0
    ///
    /// Only valid before the counter is shared.
    #[inline]
    pub fn init(&mut self) {
        *self.generation.get_mut() = 0;
    }

    /// Poison the counter
    ///
    /// # Panics
    ///
    /// Panics if a write section is open.
    pub fn destroy(&self) {
        let generation = self.generation.load(Ordering::Relaxed);
        assert!(
            !writing(generation),
            "seqcount_destroy: write in progress (generation {generation:#x})"
        );
        self.generation.store(SEQCOUNT_DESTROYED, Ordering::Relaxed);
    }

    /// Whether a write section is open
    #[inline]
    pub fn is_writing(&self) -> bool {
        writing(self.generation.load(Ordering::Relaxed))
    }

    /// Open a write section
    ///
    /// # Panics
    ///
    /// Panics if a write section is already open (nested writers).
    #[inline]
    pub fn write_begin(&self) {
        let generation = self.generation.load(Ordering::Relaxed);
        assert!(
            !writing(generation),
            "seqcount_write_begin: write already in progress (generation {generation:#x})"
        );
        self.generation
            .store(generation.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);
    }

    /// Close the write section
    ///
    /// # Panics
    ///
    /// Panics if no write section is open.
    #[inline]
    pub fn write_end(&self) {
        let generation = self.generation.load(Ordering::Relaxed);
        assert!(
            writing(generation),
            "seqcount_write_end: no write in progress (generation {generation:#x})"
        );
        fence(Ordering::Release);
        self.generation
            .store(generation.wrapping_add(1), Ordering::Relaxed);
    }

    #[inline]
    fn wait_stable(&self) -> u32 {
        let mut backoff = Backoff::new();
        loop {
            let generation = self.generation.load(Ordering::Relaxed);
            if !writing(generation) {
                return generation;
            }
            debug_assert_ne!(
                generation, SEQCOUNT_DESTROYED,
                "seqcount read after destroy"
            );
            backoff.snooze();
        }
    }

    /// Wait for a stable generation and return it
    ///
    /// Loads of protected fields issued after this call cannot be reordered
    /// before the generation load.
    #[inline]
    pub fn read_begin(&self) -> u32 {
        let generation = self.wait_stable();
        fence(Ordering::Acquire);
        generation
    }

    /// `read_begin` with only a compiler barrier
    ///
    /// For callers that supply their own consumer barrier.
    #[inline]
    pub fn read_begin_raw(&self) -> u32 {
        let generation = self.wait_stable();
        compiler_fence(Ordering::SeqCst);
        generation
    }

    /// True if the read that began at `snapshot` must be retried
    #[inline]
    #[must_use]
    pub fn read_retry(&self, snapshot: u32) -> bool {
        fence(Ordering::Acquire);
        self.generation.load(Ordering::Relaxed) != snapshot
    }

    /// Current generation, possibly odd
    ///
    /// For statistics and diagnostics only.
    #[inline]
    pub fn raw_read(&self) -> u32 {
        let generation = self.generation.load(Ordering::Relaxed);
        fence(Ordering::Acquire);
        generation
    }
}

impl Default for SeqCount {
    fn default() -> Self {
        Self::new()
    }
}

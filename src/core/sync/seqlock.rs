/*!
 * Sequence Lock
 *
 * A `SeqCount` paired with a spin mutex so that writers are serialized
 * mechanically. Readers never touch the mutex.
 *
 * # Design: Spin Mutex for Writers
 *
 * Write sections are a handful of stores, so writers busy-wait rather than
 * sleep. The guard closes the write section before the mutex is released.
 *
 * # Fairness
 *
 * None. A steady stream of writers keeps the generation moving and can
 * starve readers indefinitely; use only where writes are rare.
 *
 * # Example
 *
 * ```
 * use psz_kernel::core::sync::SeqLock;
 * use std::sync::atomic::{AtomicU64, Ordering};
 *
 * let lock = SeqLock::new();
 * let (lo, hi) = (AtomicU64::new(0), AtomicU64::new(0));
 *
 * lock.write(|| {
 *     lo.store(1, Ordering::Relaxed);
 *     hi.store(1, Ordering::Relaxed);
 * });
 *
 * let pair = lock.read(|| (lo.load(Ordering::Relaxed), hi.load(Ordering::Relaxed)));
 * assert_eq!(pair, (1, 1));
 * ```
 */

use super::seqcount::SeqCount;
use spin::{Mutex as SpinMutex, MutexGuard as SpinMutexGuard};

/// Sequence lock: spin mutex for writers, lock-free retry loop for readers
#[derive(Debug, Default)]
pub struct SeqLock {
    lock: SpinMutex<()>,
    count: SeqCount,
}

/// Open write section; closes it on drop
#[must_use = "dropping the guard immediately closes the write section"]
pub struct SeqLockWriteGuard<'a> {
    count: &'a SeqCount,
    _lock: SpinMutexGuard<'a, ()>,
}

impl SeqLock {
    /// Create an unlocked seqlock at generation 0
    pub const fn new() -> Self {
        Self {
            lock: SpinMutex::new(()),
            count: SeqCount::new(),
        }
    }

    /// Take the writer mutex and open a write section
    ///
    /// Spins while another writer holds the lock.
    #[inline]
    pub fn write_seqlock(&self) -> SeqLockWriteGuard<'_> {
        let lock = self.lock.lock();
        self.count.write_begin();
        SeqLockWriteGuard {
            count: &self.count,
            _lock: lock,
        }
    }

    /// Close the write section and release the writer mutex
    #[inline]
    pub fn write_sequnlock(guard: SeqLockWriteGuard<'_>) {
        drop(guard);
    }

    /// Begin a read; see [`SeqCount::read_begin`]
    #[inline]
    pub fn read_seqbegin(&self) -> u32 {
        self.count.read_begin()
    }

    /// True if the read that began at `snapshot` must be retried
    #[inline]
    #[must_use]
    pub fn read_seqretry(&self, snapshot: u32) -> bool {
        self.count.read_retry(snapshot)
    }

    /// Run `f` until it completes without an overlapping write
    ///
    /// `f` may run several times and must only load the protected fields.
    #[inline]
    pub fn read<R>(&self, mut f: impl FnMut() -> R) -> R {
        loop {
            let snapshot = self.read_seqbegin();
            let value = f();
            if !self.read_seqretry(snapshot) {
                return value;
            }
        }
    }

    /// Run `f` inside a write section
    #[inline]
    pub fn write<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.write_seqlock();
        f()
    }

    /// Current generation, for diagnostics
    #[inline]
    pub fn generation(&self) -> u32 {
        self.count.raw_read()
    }

    /// Poison the underlying counter
    ///
    /// # Panics
    ///
    /// Panics if a writer is inside its write section.
    pub fn destroy(&self) {
        let _lock = self.lock.lock();
        self.count.destroy();
    }
}

impl Drop for SeqLockWriteGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        self.count.write_end();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_guard_brackets_write_section() {
        let lock = SeqLock::new();

        let guard = lock.write_seqlock();
        assert_eq!(lock.generation(), 1);
        SeqLock::write_sequnlock(guard);
        assert_eq!(lock.generation(), 2);

        lock.write(|| ());
        assert_eq!(lock.generation(), 4);
    }

    #[test]
    fn test_read_retries_across_write() {
        let lock = SeqLock::new();
        let snapshot = lock.read_seqbegin();
        lock.write(|| ());
        assert!(lock.read_seqretry(snapshot));
        assert!(!lock.read_seqretry(lock.read_seqbegin()));
    }

    #[test]
    fn test_writers_are_serialized() {
        let lock = Arc::new(SeqLock::new());
        let a = Arc::new(AtomicU64::new(0));
        let b = Arc::new(AtomicU64::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let (lock, a, b) = (lock.clone(), a.clone(), b.clone());
                thread::spawn(move || {
                    for _ in 0..1_000 {
                        lock.write(|| {
                            let next = a.load(Ordering::Relaxed) + 1;
                            a.store(next, Ordering::Relaxed);
                            b.store(next * 2, Ordering::Relaxed);
                        });
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let (x, y) = lock.read(|| (a.load(Ordering::Relaxed), b.load(Ordering::Relaxed)));
        assert_eq!(x, 4_000);
        assert_eq!(y, 8_000);
        assert_eq!(lock.generation(), 8_000);
    }

    #[test]
    fn test_destroy_when_idle() {
        let lock = SeqLock::new();
        lock.write(|| ());
        lock.destroy();
        assert_eq!(lock.generation(), u32::MAX);
    }
}

/*!
 * Synchronization Primitives Integration Tests
 *
 * Sequence counters and sequence locks under concurrent readers
 */

use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use psz_kernel::core::sync::{SeqCount, SeqLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

const WRITER_ITERATIONS: u64 = 10_000;

/// 128-bit counter stored as two words; `hi` is always the complement of `lo`
/// when the pair is consistent.
#[derive(Default)]
struct Wide {
    lo: AtomicU64,
    hi: AtomicU64,
}

impl Wide {
    fn store(&self, value: u64) {
        self.lo.store(value, Ordering::Relaxed);
        self.hi.store(!value, Ordering::Relaxed);
    }

    fn load(&self) -> (u64, u64) {
        (
            self.lo.load(Ordering::Relaxed),
            self.hi.load(Ordering::Relaxed),
        )
    }
}

#[test]
fn test_seqlock_no_torn_reads() {
    let lock = Arc::new(SeqLock::new());
    let wide = Arc::new(Wide::default());
    wide.store(0);
    let done = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let (lock, wide, done) = (lock.clone(), wide.clone(), done.clone());
            thread::spawn(move || {
                let mut reads = 0u64;
                let mut last = 0u64;
                while !done.load(Ordering::Acquire) {
                    let (lo, hi) = lock.read(|| wide.load());
                    assert_eq!(hi, !lo, "torn read");
                    assert!(lo >= last, "counter went backwards");
                    last = lo;
                    reads += 1;
                }
                reads
            })
        })
        .collect();

    for i in 1..=WRITER_ITERATIONS {
        lock.write(|| wide.store(i));
    }
    done.store(true, Ordering::Release);

    for reader in readers {
        reader.join().unwrap();
    }
    assert_eq!(lock.read(|| wide.load()), (WRITER_ITERATIONS, !WRITER_ITERATIONS));
    assert_eq!(lock.generation(), (WRITER_ITERATIONS * 2) as u32);
}

#[test]
fn test_seqcount_with_external_mutex() {
    // Raw counter: writers serialize on their own mutex
    let count = Arc::new(SeqCount::new());
    let writers_lock = Arc::new(Mutex::new(()));
    let wide = Arc::new(Wide::default());
    wide.store(0);

    let writers: Vec<_> = (0..2)
        .map(|w| {
            let (count, writers_lock, wide) = (count.clone(), writers_lock.clone(), wide.clone());
            thread::spawn(move || {
                for i in 0..WRITER_ITERATIONS / 2 {
                    let _guard = writers_lock.lock();
                    count.write_begin();
                    wide.store(i * 2 + w);
                    count.write_end();
                }
            })
        })
        .collect();

    let reader = {
        let (count, wide) = (count.clone(), wide.clone());
        thread::spawn(move || {
            let mut consistent = 0u64;
            while consistent < 1000 {
                let gen = count.read_begin();
                assert_eq!(gen % 2, 0);
                let (lo, hi) = wide.load();
                if !count.read_retry(gen) {
                    assert_eq!(hi, !lo, "torn read passed retry");
                    consistent += 1;
                }
            }
        })
    };

    for writer in writers {
        writer.join().unwrap();
    }
    reader.join().unwrap();
    assert!(!count.is_writing());
    assert_eq!(count.raw_read(), (WRITER_ITERATIONS * 2) as u32);
}

#[test]
fn test_read_retry_detects_overlapping_write() {
    let lock = SeqLock::new();
    let gen = lock.read_seqbegin();
    lock.write(|| {});
    assert!(lock.read_seqretry(gen));

    let gen = lock.read_seqbegin();
    assert!(!lock.read_seqretry(gen));
}

#[test]
fn test_reader_waits_out_writer() {
    let lock = Arc::new(SeqLock::new());
    let value = Arc::new(AtomicU64::new(0));

    let guard = lock.write_seqlock();
    value.store(7, Ordering::Relaxed);

    let reader = {
        let (lock, value) = (lock.clone(), value.clone());
        thread::spawn(move || lock.read(|| value.load(Ordering::Relaxed)))
    };

    thread::sleep(std::time::Duration::from_millis(20));
    value.store(42, Ordering::Relaxed);
    SeqLock::write_sequnlock(guard);

    assert_eq!(reader.join().unwrap(), 42);
}

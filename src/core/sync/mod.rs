/*!
 * Synchronization Primitives
 *
 * Building blocks shared by the pserialize engine and its consumers:
 * - `SeqCount` / `SeqLock` for optimistic, retry-based reads
 * - `Countdown` latch for broadcast-and-wait
 * - `Backoff` for bounded busy-waiting
 */

mod backoff;
mod latch;
mod seqcount;
mod seqlock;

pub use backoff::Backoff;
pub use latch::Countdown;
pub use seqcount::{SeqCount, SEQCOUNT_DESTROYED};
pub use seqlock::{SeqLock, SeqLockWriteGuard};

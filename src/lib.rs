/*!
 * Passive Serialization Kernel Library
 *
 * Read-mostly synchronization for a simulated multiprocessor kernel:
 * - `core::sync`: sequence counters and sequence locks
 * - `kern`: CPUs, priority levels, cross-calls, and `pserialize`
 * - `pmap`: registry of tracked physical ranges with lock-free lookup
 * - `monitoring`: tracing setup
 */

pub mod core;
pub mod kern;
pub mod monitoring;
pub mod pmap;

// Re-exports
pub use crate::core::errors::{RuntimeError, RuntimeResult};
pub use crate::core::sync::{SeqCount, SeqLock, SeqLockWriteGuard};
pub use kern::{
    pserialize, Curcpu, Ipl, PserializeHandle, PserializeStats, PszToken, ReadSection,
    RuntimeConfig, RuntimeContext, RuntimeContextBuilder, XcPriority, XcStats, MAXCPUS,
};
pub use monitoring::init_tracing;
pub use pmap::{PmapPage, PvTracker, TrackedPage, TrackedRange};

/*!
 * Kernel Machine Layer
 *
 * Simulated multiprocessor the synchronization layer runs on:
 * - `RuntimeContext`: CPUs, boot state, services
 * - `Curcpu`: a thread bound to one CPU, with priority levels
 * - Cross-call barrier over a worker-per-CPU pool
 * - `pserialize`: passive serialization (read sections and `perform`)
 */

mod config;
mod context;
mod cpu;
mod ipl;
pub mod lwp;
pub mod pserialize;
mod xcall;

pub use config::{RuntimeConfig, MAXCPUS};
pub use context::{RuntimeContext, RuntimeContextBuilder};
pub use cpu::Curcpu;
pub use ipl::Ipl;
pub use pserialize::{PserializeHandle, PserializeStats, PszToken, ReadSection};
pub use xcall::{XcPriority, XcStats};

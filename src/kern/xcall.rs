/*!
 * Cross-Call Barrier
 *
 * Broadcast a no-op to every CPU and wait until all of them have run it.
 *
 * # Design: Worker per CPU
 *
 * Each CPU has one worker thread. A broadcast publishes a new generation
 * under the dispatch mutex; each worker's dispatch loop notices the new
 * generation, waits until its CPU's priority level admits the request, and
 * counts down a shared latch. The caller blocks on the latch.
 *
 * A CPU at `IPL_SOFTSERIAL` or above holds off a `High` request, so a
 * completed `High` barrier proves that every CPU has left any read section
 * it was in when the broadcast started.
 *
 * Broadcasts are serialized: a new generation is only published after every
 * worker acknowledged the previous one, so no worker can skip a generation.
 */

use super::config::RuntimeConfig;
use super::cpu::CpuState;
use super::ipl::Ipl;
use super::lwp;
use crate::core::sync::{Backoff, Countdown, SeqLock};
use crate::core::{RuntimeError, RuntimeResult};
use crossbeam_utils::CachePadded;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Barrier wait after which a stall is reported, and again at each interval
const SLOW_BARRIER: Duration = Duration::from_secs(1);

/// Priority class of a cross call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum XcPriority {
    /// Runs once the CPU is back at thread level
    Low,
    /// Runs once the CPU is below `IPL_SOFTSERIAL`
    High,
}

impl XcPriority {
    /// Lowest level at which a CPU holds this request off
    #[inline]
    fn blocked_at(self) -> Ipl {
        match self {
            XcPriority::Low => Ipl::SoftClock,
            XcPriority::High => Ipl::SoftSerial,
        }
    }
}

/// Cross-call counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct XcStats {
    /// Completed broadcasts
    pub broadcasts: u64,
    /// Total time callers spent waiting, in nanoseconds
    pub total_wait_ns: u64,
    /// Longest single wait, in nanoseconds
    pub max_wait_ns: u64,
}

#[derive(Clone)]
struct Request {
    priority: XcPriority,
    latch: Arc<Countdown>,
}

struct Dispatch {
    generation: u64,
    request: Option<Request>,
    online: bool,
}

struct Shared {
    cpus: Arc<[CachePadded<CpuState>]>,
    dispatch: Mutex<Dispatch>,
    kick: Condvar,
    shutdown: AtomicBool,
    spin_limit: u32,
    park_interval: Duration,
}

/// Published through a seqlock so readers never contend with broadcasts
struct StatsCell {
    lock: SeqLock,
    broadcasts: AtomicU64,
    total_wait_ns: AtomicU64,
    max_wait_ns: AtomicU64,
}

/// Cross-call worker pool
pub(crate) struct CrossCall {
    shared: Arc<Shared>,
    broadcast: Mutex<()>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    stats: StatsCell,
}

impl CrossCall {
    pub(crate) fn new(cpus: Arc<[CachePadded<CpuState>]>, config: &RuntimeConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                cpus,
                dispatch: Mutex::new(Dispatch {
                    generation: 0,
                    request: None,
                    online: false,
                }),
                kick: Condvar::new(),
                shutdown: AtomicBool::new(false),
                spin_limit: config.xc_spin_limit,
                park_interval: config.xc_park_interval,
            }),
            broadcast: Mutex::new(()),
            workers: Mutex::new(Vec::new()),
            stats: StatsCell {
                lock: SeqLock::new(),
                broadcasts: AtomicU64::new(0),
                total_wait_ns: AtomicU64::new(0),
                max_wait_ns: AtomicU64::new(0),
            },
        }
    }

    /// Spawn one worker per CPU
    ///
    /// The worker list lock is held throughout, so concurrent callers see
    /// either no pool or a complete one. Workers left by a failed start are
    /// kept and the missing ones spawned on retry.
    pub(crate) fn start(&self) -> RuntimeResult<()> {
        let mut workers = self.workers.lock();
        if self.is_online() {
            return Err(RuntimeError::AlreadyOnline);
        }

        // Workers are spawned in CPU order, so the list length is the next CPU
        for cpu in workers.len()..self.shared.cpus.len() {
            let shared = self.shared.clone();
            let handle = thread::Builder::new()
                .name(format!("xcall/{cpu}"))
                .spawn(move || worker_loop(&shared, cpu))?;
            workers.push(handle);
        }

        self.shared.dispatch.lock().online = true;
        debug!(workers = workers.len(), "cross-call workers online");
        Ok(())
    }

    pub(crate) fn is_online(&self) -> bool {
        self.shared.dispatch.lock().online
    }

    /// Broadcast a no-op to every CPU and wait for all acknowledgements
    ///
    /// # Panics
    ///
    /// Panics if the workers are not running; waiting would never finish.
    pub(crate) fn barrier(&self, priority: XcPriority) {
        let _serial = self.broadcast.lock();
        let latch = Arc::new(Countdown::new(self.shared.cpus.len()));
        let start = Instant::now();

        let generation = {
            let mut dispatch = self.shared.dispatch.lock();
            assert!(
                dispatch.online,
                "xc_barrier: cross-call workers are not running"
            );
            dispatch.generation += 1;
            dispatch.request = Some(Request {
                priority,
                latch: latch.clone(),
            });
            dispatch.generation
        };
        self.shared.kick.notify_all();

        while !latch.wait_for(SLOW_BARRIER) {
            warn!(
                generation,
                ?priority,
                outstanding = latch.remaining(),
                "cross-call barrier still waiting"
            );
        }
        lwp::note_switch();

        self.shared.dispatch.lock().request = None;

        let waited = u64::try_from(start.elapsed().as_nanos()).unwrap_or(u64::MAX);
        self.stats.lock.write(|| {
            let s = &self.stats;
            s.broadcasts.fetch_add(1, Ordering::Relaxed);
            s.total_wait_ns.fetch_add(waited, Ordering::Relaxed);
            if waited > s.max_wait_ns.load(Ordering::Relaxed) {
                s.max_wait_ns.store(waited, Ordering::Relaxed);
            }
        });
        trace!(generation, ?priority, waited_ns = waited, "cross-call barrier complete");
    }

    pub(crate) fn stats(&self) -> XcStats {
        let s = &self.stats;
        s.lock.read(|| XcStats {
            broadcasts: s.broadcasts.load(Ordering::Relaxed),
            total_wait_ns: s.total_wait_ns.load(Ordering::Relaxed),
            max_wait_ns: s.max_wait_ns.load(Ordering::Relaxed),
        })
    }

    /// Stop and join every worker
    pub(crate) fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        {
            // Taking the lock orders the flag before any worker's next check
            let _dispatch = self.shared.dispatch.lock();
            self.shared.kick.notify_all();
        }

        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            handle.thread().unpark();
            let _ = handle.join();
        }
    }
}

fn worker_loop(shared: &Shared, cpu: usize) {
    lwp::enter_softint();
    let mut seen = 0u64;

    loop {
        let request = {
            let mut dispatch = shared.dispatch.lock();
            while dispatch.generation == seen && !shared.shutdown.load(Ordering::Acquire) {
                shared.kick.wait(&mut dispatch);
            }
            if shared.shutdown.load(Ordering::Acquire) {
                break;
            }
            seen = dispatch.generation;
            dispatch.request.clone()
        };

        let Some(request) = request else { continue };
        if !wait_admitted(shared, cpu, request.priority) {
            break;
        }
        trace!(cpu, generation = seen, "cross call acknowledged");
        request.latch.count_down();
    }
}

/// Wait until `cpu` admits a request of `priority`; false on shutdown
fn wait_admitted(shared: &Shared, cpu: usize, priority: XcPriority) -> bool {
    let state = &shared.cpus[cpu];
    let mut backoff = Backoff::with_park(shared.spin_limit, shared.park_interval);
    let lowered = state.observe_lowered();
    while state.observe_ipl() >= priority.blocked_at() {
        if state.observe_lowered() != lowered {
            break;
        }
        if shared.shutdown.load(Ordering::Acquire) {
            return false;
        }
        backoff.snooze();
    }
    true
}

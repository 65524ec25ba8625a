/*!
 * Runtime Context
 *
 * Everything a kernel keeps in globals: the per-CPU array, the
 * "secondary CPUs are running" flag, the panic flag, the pserialize engine
 * and the cross-call pool. Built once at startup and passed to every
 * operation that needs it.
 *
 * # Boot Sequence
 *
 * 1. `RuntimeContext::builder().build()`: CPUs exist, only the boot thread
 *    runs, the pserialize engine is initialized
 * 2. `start_mp()`: one cross-call worker per CPU, then `mp_online` is set
 *
 * Between 1 and 2 the cross-call barrier cannot run (no workers would
 * answer), and `pserialize_perform` relies on `mp_online` being false to
 * take its single-thread shortcut.
 */

use super::config::RuntimeConfig;
use super::cpu::{CpuState, Curcpu};
use super::lwp;
use super::pserialize::PserializeState;
use super::xcall::{CrossCall, XcPriority, XcStats};
use crate::core::{RuntimeError, RuntimeResult};
use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, info};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Simulated machine: CPUs, boot state, and the services built on them
pub struct RuntimeContext {
    id: u64,
    config: RuntimeConfig,
    cpus: Arc<[CachePadded<CpuState>]>,
    mp_online: AtomicBool,
    panicking: AtomicBool,
    pub(crate) psz: PserializeState,
    xcall: CrossCall,
}

/// Builder for [`RuntimeContext`]
#[derive(Debug, Default)]
pub struct RuntimeContextBuilder {
    config: Option<RuntimeConfig>,
}

impl RuntimeContextBuilder {
    /// Use `config` instead of [`RuntimeConfig::default`]
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Shorthand for a default configuration with `ncpu` CPUs
    pub fn ncpu(mut self, ncpu: usize) -> Self {
        let config = self.config.take().unwrap_or_default();
        self.config = Some(RuntimeConfig { ncpu, ..config });
        self
    }

    /// Create the context (boot CPU only; call `start_mp` to go SMP)
    pub fn build(self) -> RuntimeResult<Arc<RuntimeContext>> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let cpus: Arc<[CachePadded<CpuState>]> = (0..config.ncpu)
            .map(|i| CachePadded::new(CpuState::new(i)))
            .collect();
        let xcall = CrossCall::new(cpus.clone(), &config);

        let ctx = RuntimeContext {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            config,
            cpus,
            mp_online: AtomicBool::new(false),
            panicking: AtomicBool::new(false),
            psz: PserializeState::new(),
            xcall,
        };
        super::pserialize::init(&ctx);

        info!(context = ctx.id, ncpu = ctx.ncpu(), "runtime context created");
        Ok(Arc::new(ctx))
    }
}

impl RuntimeContext {
    /// Start building a context
    pub fn builder() -> RuntimeContextBuilder {
        RuntimeContextBuilder::default()
    }

    #[inline]
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Configuration the context was built with
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Number of CPUs
    #[inline]
    pub fn ncpu(&self) -> usize {
        self.cpus.len()
    }

    /// Bring the secondary CPUs online
    ///
    /// Fails with [`RuntimeError::AlreadyOnline`] on every call after the
    /// first successful one, including concurrent ones.
    pub fn start_mp(&self) -> RuntimeResult<()> {
        self.xcall.start()?;
        self.mp_online.store(true, Ordering::Release);
        info!(context = self.id, ncpu = self.ncpu(), "secondary CPUs online");
        Ok(())
    }

    /// Whether more than the boot thread may be running
    #[inline]
    pub fn mp_online(&self) -> bool {
        self.mp_online.load(Ordering::Acquire)
    }

    /// Record that the system is going down; barriers are skipped from now on
    pub fn declare_panic(&self) {
        if !self.panicking.swap(true, Ordering::AcqRel) {
            error!(context = self.id, "system panic declared");
        }
    }

    /// Whether `declare_panic` was called
    #[inline]
    pub fn panicking(&self) -> bool {
        self.panicking.load(Ordering::Acquire)
    }

    /// Bind the calling thread to `cpu`
    ///
    /// Blocks while another thread occupies the CPU.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread is already bound to a CPU.
    pub fn bind(&self, cpu: usize) -> RuntimeResult<Curcpu<'_>> {
        let state = self.cpus.get(cpu).ok_or(RuntimeError::CpuOutOfRange {
            cpu,
            ncpu: self.ncpu(),
        })?;
        Ok(Curcpu::bind(self, state))
    }

    /// Per-CPU state of the CPU the calling thread is bound to, if that CPU
    /// belongs to this context
    pub(crate) fn current_cpu(&self) -> Option<&CpuState> {
        lwp::binding()
            .filter(|b| b.ctx == self.id)
            .map(|b| &*self.cpus[b.cpu])
    }

    /// Broadcast a no-op to every CPU and wait until all have run it
    ///
    /// # Panics
    ///
    /// Panics before `start_mp`.
    pub fn xc_barrier(&self, priority: XcPriority) {
        self.xcall.barrier(priority);
    }

    /// Cross-call statistics
    pub fn xc_stats(&self) -> XcStats {
        self.xcall.stats()
    }

    /// Pserialize read depth of `cpu`, for diagnostics
    pub fn read_depth(&self, cpu: usize) -> Option<u32> {
        self.cpus.get(cpu).map(|c| c.read_depth())
    }
}

impl Drop for RuntimeContext {
    fn drop(&mut self) {
        self.xcall.shutdown();
    }
}

impl std::fmt::Debug for RuntimeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeContext")
            .field("id", &self.id)
            .field("ncpu", &self.ncpu())
            .field("mp_online", &self.mp_online())
            .field("panicking", &self.panicking())
            .finish()
    }
}

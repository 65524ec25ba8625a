/*!
 * Passive Serialization
 *
 * Lets readers look up shared data without locks or atomic
 * read-modify-writes, while writers still unlink and free it safely.
 *
 * # Protocol
 *
 * **Reader** (never blocks):
 * ```text
 * let s = read_enter(&cpu);
 * // load pointers published with release ordering, use them
 * read_exit(&cpu, s);
 * ```
 *
 * **Writer**:
 * ```text
 * // under the writer's own lock: unlink the object
 * perform(&ctx, &psz);
 * // nobody can still be looking at it: free it
 * ```
 *
 * # Design: Quiescence by Cross Call
 *
 * `read_enter` raises the CPU to `IPL_SOFTSERIAL`, which holds off
 * high-priority cross calls on that CPU. `perform` broadcasts a
 * high-priority no-op and waits for every CPU to run it. A CPU can only run
 * it outside any read section, so when `perform` returns every section that
 * was open when it was called has closed, and every section opened later
 * sees everything the writer did before calling it.
 *
 * # Early Boot
 *
 * Until `start_mp` there is exactly one thread of execution, so `perform`
 * only counts the call. This trusts the `mp_online` flag; a barrier at that
 * point would wait forever for workers that do not exist yet.
 */

use super::context::RuntimeContext;
use super::cpu::Curcpu;
use super::ipl::Ipl;
use super::lwp;
use super::xcall::XcPriority;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{compiler_fence, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use tracing::{trace, warn};

const PSZ_UNINITIALIZED: u8 = 0;
const PSZ_READY: u8 = 1;

#[derive(Debug, Default)]
struct PszCounters {
    /// Calls answered without a barrier (single CPU running)
    exclusive: u64,
    /// Calls that completed a barrier
    performs: u64,
}

/// Engine state held by the runtime context
#[derive(Debug)]
pub(crate) struct PserializeState {
    state: AtomicU8,
    lock: Mutex<PszCounters>,
    next_handle: AtomicU64,
    live_handles: AtomicUsize,
}

impl PserializeState {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(PSZ_UNINITIALIZED),
            lock: Mutex::new(PszCounters::default()),
            next_handle: AtomicU64::new(1),
            live_handles: AtomicUsize::new(0),
        }
    }

    #[inline]
    fn assert_ready(&self) {
        assert_eq!(
            self.state.load(Ordering::Acquire),
            PSZ_READY,
            "pserialize used before pserialize_init"
        );
    }
}

/// Opaque handle owned by one subsystem
///
/// Carries no state beyond an id for diagnostics; all synchronization is
/// context-wide.
#[derive(Debug)]
pub struct PserializeHandle {
    id: u64,
    ctx: u64,
}

impl PserializeHandle {
    /// Diagnostic id
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Token returned by [`read_enter`], consumed by [`read_exit`]
#[derive(Debug)]
#[must_use = "a read section must be closed with read_exit"]
pub struct PszToken {
    previous: Ipl,
    cpu: usize,
    ctx: u64,
}

impl PszToken {
    /// Priority level restored by `read_exit`
    pub fn previous_ipl(&self) -> Ipl {
        self.previous
    }
}

/// Engine counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PserializeStats {
    /// `perform` calls answered before secondary CPUs came online
    pub exclusive: u64,
    /// `perform` calls that completed a cross-call barrier
    pub performs: u64,
    /// Handles created and not yet destroyed
    pub live_handles: usize,
}

/// Initialize the engine (`Uninitialized -> Ready`)
///
/// Called once by the context builder.
///
/// # Panics
///
/// Panics on a second call.
pub(crate) fn init(ctx: &RuntimeContext) {
    let previous = ctx.psz.state.swap(PSZ_READY, Ordering::AcqRel);
    assert_eq!(previous, PSZ_UNINITIALIZED, "pserialize_init called twice");
}

/// Create a handle
pub fn create(ctx: &RuntimeContext) -> PserializeHandle {
    ctx.psz.assert_ready();
    ctx.psz.live_handles.fetch_add(1, Ordering::Relaxed);
    PserializeHandle {
        id: ctx.psz.next_handle.fetch_add(1, Ordering::Relaxed),
        ctx: ctx.id(),
    }
}

/// Destroy a handle
pub fn destroy(ctx: &RuntimeContext, psz: PserializeHandle) {
    assert_eq!(psz.ctx, ctx.id(), "pserialize_destroy: foreign handle");
    ctx.psz.live_handles.fetch_sub(1, Ordering::Relaxed);
}

/// Wait until every read section open at the time of the call has closed
///
/// # Panics
///
/// Panics from soft-interrupt context (a cross-call worker) or at raised
/// priority on the caller's CPU, including inside a read section: the
/// barrier could never complete there.
pub fn perform(ctx: &RuntimeContext, psz: &PserializeHandle) {
    assert!(
        !lwp::in_softint(),
        "pserialize_perform from soft interrupt context"
    );
    if let Some(cpu) = ctx.current_cpu() {
        let ipl = cpu.ipl();
        assert!(
            ipl == Ipl::None,
            "pserialize_perform at raised priority {ipl} on cpu{}",
            cpu.id()
        );
    }
    assert_eq!(psz.ctx, ctx.id(), "pserialize_perform: foreign handle");
    ctx.psz.assert_ready();

    if ctx.panicking() {
        warn!(handle = psz.id, "pserialize_perform skipped: system panicking");
        return;
    }

    if !ctx.mp_online() {
        ctx.psz.lock.lock().exclusive += 1;
        trace!(handle = psz.id, "pserialize_perform: single CPU, no barrier");
        return;
    }

    ctx.xc_barrier(XcPriority::High);

    ctx.psz.lock.lock().performs += 1;
    trace!(handle = psz.id, "pserialize_perform complete");
}

/// Open a read section on the calling CPU
///
/// Never blocks. Sections nest.
#[inline]
pub fn read_enter(cpu: &Curcpu<'_>) -> PszToken {
    let previous = cpu.splsoftserial();
    cpu.state().read_depth_inc();
    compiler_fence(Ordering::SeqCst);
    PszToken {
        previous,
        cpu: cpu.id(),
        ctx: cpu.context().id(),
    }
}

/// Close the read section opened by `read_enter`
///
/// # Panics
///
/// Panics if `token` belongs to another CPU, if the CPU is not at
/// `IPL_SOFTSERIAL` or above, or if no section is open.
#[inline]
pub fn read_exit(cpu: &Curcpu<'_>, token: PszToken) {
    assert!(
        token.cpu == cpu.id() && token.ctx == cpu.context().id(),
        "pserialize_read_exit: token from cpu{} used on cpu{}",
        token.cpu,
        cpu.id()
    );
    assert!(
        cpu.ipl() >= Ipl::SoftSerial,
        "pserialize_read_exit at {} on cpu{}",
        cpu.ipl(),
        cpu.id()
    );
    compiler_fence(Ordering::SeqCst);
    if cpu.state().read_depth_dec() == 0 {
        panic!("mismatching pserialize_read_exit() on cpu{}", cpu.id());
    }
    cpu.splx(token.previous);
}

/// RAII read section; closes on drop
///
/// Borrowing from the section is how lock-free lookups hand out references
/// that cannot outlive it.
#[must_use = "dropping the section closes it immediately"]
pub struct ReadSection<'c, 'ctx> {
    cpu: &'c Curcpu<'ctx>,
    token: Option<PszToken>,
}

impl<'c, 'ctx> ReadSection<'c, 'ctx> {
    /// CPU the section runs on
    #[inline]
    pub fn cpu(&self) -> &'c Curcpu<'ctx> {
        self.cpu
    }

    /// Runtime context of the section's CPU
    #[inline]
    pub fn context(&self) -> &'ctx RuntimeContext {
        self.cpu.context()
    }
}

impl Drop for ReadSection<'_, '_> {
    #[inline]
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            read_exit(self.cpu, token);
        }
    }
}

/// Open a read section closed when the returned guard drops
#[inline]
pub fn read_section<'c, 'ctx>(cpu: &'c Curcpu<'ctx>) -> ReadSection<'c, 'ctx> {
    ReadSection {
        cpu,
        token: Some(read_enter(cpu)),
    }
}

/// True if the calling thread is inside a read section of `ctx`
///
/// For assertions only.
pub fn in_read_section(ctx: &RuntimeContext) -> bool {
    // Being bound is what "preemption disabled" means here
    ctx.current_cpu().is_some_and(|cpu| cpu.read_depth() > 0)
}

/// True if the calling thread is certainly not inside a read section of
/// `ctx`
///
/// A voluntary switch between the two samples of the switch counter proves
/// the thread was not in a section (sections cannot block), whatever the
/// depth read in between said.
pub fn not_in_read_section(ctx: &RuntimeContext) -> bool {
    let ncsw = lwp::voluntary_switches();
    compiler_fence(Ordering::SeqCst);
    let mut notin = ctx.current_cpu().map_or(true, |cpu| cpu.read_depth() == 0);
    compiler_fence(Ordering::SeqCst);
    if ncsw != lwp::voluntary_switches() {
        notin = true;
    }
    notin
}

/// Engine counters
pub fn stats(ctx: &RuntimeContext) -> PserializeStats {
    let counters = ctx.psz.lock.lock();
    PserializeStats {
        exclusive: counters.exclusive,
        performs: counters.performs,
        live_handles: ctx.psz.live_handles.load(Ordering::Relaxed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn context(ncpu: usize) -> Arc<RuntimeContext> {
        RuntimeContext::builder().ncpu(ncpu).build().unwrap()
    }

    #[test]
    fn test_handles_are_counted() {
        let ctx = context(1);
        let a = create(&ctx);
        let b = create(&ctx);
        assert_ne!(a.id(), b.id());
        assert_eq!(stats(&ctx).live_handles, 2);

        destroy(&ctx, a);
        destroy(&ctx, b);
        assert_eq!(stats(&ctx).live_handles, 0);
    }

    #[test]
    #[should_panic(expected = "pserialize_init called twice")]
    fn test_init_twice_panics() {
        let ctx = context(1);
        init(&ctx);
    }

    #[test]
    fn test_read_section_nesting() {
        let ctx = context(1);
        let cpu = ctx.bind(0).unwrap();
        assert!(!in_read_section(&ctx));

        let outer = read_enter(&cpu);
        assert_eq!(outer.previous_ipl(), Ipl::None);
        let inner = read_enter(&cpu);
        assert_eq!(inner.previous_ipl(), Ipl::SoftSerial);
        assert_eq!(ctx.read_depth(0), Some(2));
        assert!(in_read_section(&ctx));
        assert!(!not_in_read_section(&ctx));

        read_exit(&cpu, inner);
        assert_eq!(cpu.ipl(), Ipl::SoftSerial);
        read_exit(&cpu, outer);
        assert_eq!(cpu.ipl(), Ipl::None);
        assert_eq!(ctx.read_depth(0), Some(0));
        assert!(!in_read_section(&ctx));
        assert!(not_in_read_section(&ctx));
    }

    #[test]
    fn test_guard_closes_section() {
        let ctx = context(1);
        let cpu = ctx.bind(0).unwrap();
        {
            let section = read_section(&cpu);
            assert_eq!(section.cpu().id(), 0);
            assert!(in_read_section(section.context()));
        }
        assert!(!in_read_section(&ctx));
        assert_eq!(cpu.ipl(), Ipl::None);
    }

    #[test]
    fn test_unbound_thread_is_not_in_section() {
        let ctx = context(1);
        assert!(!in_read_section(&ctx));
        assert!(not_in_read_section(&ctx));
    }

    #[test]
    fn test_perform_before_mp_is_exclusive() {
        let ctx = context(2);
        let psz = create(&ctx);
        perform(&ctx, &psz);
        perform(&ctx, &psz);

        let s = stats(&ctx);
        assert_eq!(s.exclusive, 2);
        assert_eq!(s.performs, 0);
        assert_eq!(ctx.xc_stats().broadcasts, 0);
        destroy(&ctx, psz);
    }

    #[test]
    fn test_perform_after_mp_uses_barrier() {
        let ctx = context(2);
        ctx.start_mp().unwrap();
        let psz = create(&ctx);
        perform(&ctx, &psz);

        assert_eq!(stats(&ctx).performs, 1);
        assert_eq!(ctx.xc_stats().broadcasts, 1);
        destroy(&ctx, psz);
    }

    #[test]
    fn test_perform_while_panicking_returns() {
        let ctx = context(2);
        ctx.start_mp().unwrap();
        ctx.declare_panic();
        let psz = create(&ctx);
        perform(&ctx, &psz);

        let s = stats(&ctx);
        assert_eq!(s.performs + s.exclusive, 0);
        destroy(&ctx, psz);
    }

    #[test]
    fn test_perform_from_bound_thread_at_ipl_none() {
        let ctx = context(2);
        ctx.start_mp().unwrap();
        let psz = create(&ctx);
        let cpu = ctx.bind(0).unwrap();
        perform(&ctx, &psz);
        drop(cpu);
        assert_eq!(stats(&ctx).performs, 1);
        destroy(&ctx, psz);
    }

    #[test]
    #[should_panic(expected = "at raised priority")]
    fn test_perform_inside_read_section_panics() {
        let ctx = context(1);
        let psz = create(&ctx);
        let cpu = ctx.bind(0).unwrap();
        let _section = read_section(&cpu);
        perform(&ctx, &psz);
    }

    #[test]
    #[should_panic(expected = "token from cpu0 used on cpu0")]
    fn test_foreign_token_panics() {
        let a = context(1);
        let b = context(1);
        let token = {
            let cpu = a.bind(0).unwrap();
            let token = read_enter(&cpu);
            // Leave the cpu usable for the assertion below
            cpu.state().read_depth_dec();
            cpu.splx(token.previous_ipl());
            token
        };
        let cpu = b.bind(0).unwrap();
        read_exit(&cpu, token);
    }

    #[test]
    #[should_panic(expected = "mismatching pserialize_read_exit")]
    fn test_exit_without_open_section_panics() {
        let ctx = context(1);
        let cpu = ctx.bind(0).unwrap();
        let token = read_enter(&cpu);
        // Simulate a corrupted depth: the section has already been closed
        cpu.state().read_depth_dec();
        read_exit(&cpu, token);
    }

    #[test]
    #[should_panic(expected = "pserialize_read_exit at IPL_NONE")]
    fn test_exit_at_low_priority_panics() {
        let ctx = context(1);
        let cpu = ctx.bind(0).unwrap();
        let token = read_enter(&cpu);
        // Drop the level behind the section's back
        cpu.state().read_depth_dec();
        cpu.splx(Ipl::None);
        cpu.state().read_depth_inc();
        read_exit(&cpu, token);
    }

    #[test]
    fn test_switch_forces_not_in_section() {
        let ctx = context(1);
        let cpu = ctx.bind(0).unwrap();
        let token = read_enter(&cpu);
        assert!(!not_in_read_section(&ctx));
        read_exit(&cpu, token);
        drop(cpu);
        // Unbound now, and the drop was a switch
        assert!(not_in_read_section(&ctx));
    }
}

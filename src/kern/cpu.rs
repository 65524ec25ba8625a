/*!
 * Per-CPU State and CPU Binding
 *
 * # Design: Pinning Instead of Hardware Priority
 *
 * A host thread cannot raise a real interrupt priority level, so a CPU here
 * is a slot a thread occupies exclusively through a `Curcpu` guard. The
 * guard is `!Send`: the thread cannot migrate while it holds it. The slot
 * carries a priority level that the CPU's cross-call worker honours, which
 * is all the pserialize engine needs from "raise to IPL_SOFTSERIAL".
 *
 * # Memory Ordering
 *
 * Every change of the level is a read-modify-write, and the cross-call
 * worker samples it with a read-modify-write too. All of them therefore
 * sit in one modification order: either the worker's sample comes first
 * (and a reader raising afterwards synchronizes with everything the
 * barrier's caller did before broadcasting) or the reader's raise comes
 * first (and the worker waits for the matching restore).
 *
 * A reader that re-enters sections back to back may rarely be caught at
 * `IPL_NONE`. Each restore to `IPL_NONE` therefore also bumps a per-CPU
 * epoch (again a read-modify-write); a worker that sees the epoch move
 * past its first sample knows every section open at that sample has ended.
 */

use super::context::RuntimeContext;
use super::ipl::Ipl;
use super::lwp::{self, Binding};
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

/// State of one CPU
#[derive(Debug)]
pub(crate) struct CpuState {
    id: usize,
    ipl: AtomicU8,
    /// Restores to `IPL_NONE` so far
    lowered: AtomicU64,
    psz_read_depth: AtomicU32,
    occupancy: Mutex<()>,
}

impl CpuState {
    pub(crate) fn new(id: usize) -> Self {
        Self {
            id,
            ipl: AtomicU8::new(Ipl::None.raw()),
            lowered: AtomicU64::new(0),
            psz_read_depth: AtomicU32::new(0),
            occupancy: Mutex::new(()),
        }
    }

    #[inline]
    pub(crate) fn id(&self) -> usize {
        self.id
    }

    /// Current level, for assertions on the owning CPU
    #[inline]
    pub(crate) fn ipl(&self) -> Ipl {
        Ipl::from_raw(self.ipl.load(Ordering::Relaxed))
    }

    /// Sample the level from another thread
    ///
    /// The no-op `fetch_add` places the sample in the level's modification
    /// order.
    #[inline]
    pub(crate) fn observe_ipl(&self) -> Ipl {
        Ipl::from_raw(self.ipl.fetch_add(0, Ordering::AcqRel))
    }

    /// Sample the restore epoch from another thread
    #[inline]
    pub(crate) fn observe_lowered(&self) -> u64 {
        self.lowered.fetch_add(0, Ordering::AcqRel)
    }

    #[inline]
    fn note_lowered(&self) {
        self.lowered.fetch_add(1, Ordering::AcqRel);
    }

    #[inline]
    pub(crate) fn read_depth(&self) -> u32 {
        self.psz_read_depth.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn read_depth_inc(&self) {
        self.psz_read_depth.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement the read depth, returning the value before the decrement
    ///
    /// A depth of zero is left untouched.
    #[inline]
    pub(crate) fn read_depth_dec(&self) -> u32 {
        let depth = self.psz_read_depth.load(Ordering::Relaxed);
        if depth > 0 {
            self.psz_read_depth.store(depth - 1, Ordering::Relaxed);
        }
        depth
    }

    fn reset(&self) {
        self.psz_read_depth.store(0, Ordering::Relaxed);
        self.ipl.swap(Ipl::None.raw(), Ordering::AcqRel);
        self.note_lowered();
    }
}

/// The calling thread, bound to one CPU
///
/// Obtained from [`RuntimeContext::bind`]. Dropping it releases the CPU and
/// counts as a voluntary context switch.
pub struct Curcpu<'ctx> {
    ctx: &'ctx RuntimeContext,
    state: &'ctx CpuState,
    _occupancy: MutexGuard<'ctx, ()>,
}

impl<'ctx> Curcpu<'ctx> {
    pub(crate) fn bind(ctx: &'ctx RuntimeContext, state: &'ctx CpuState) -> Self {
        if let Some(bound) = lwp::binding() {
            panic!(
                "lwp already bound to cpu{} while binding to cpu{}",
                bound.cpu,
                state.id()
            );
        }
        let occupancy = state.occupancy.lock();
        lwp::set_binding(Some(Binding {
            ctx: ctx.id(),
            cpu: state.id(),
        }));
        Self {
            ctx,
            state,
            _occupancy: occupancy,
        }
    }

    /// CPU index
    #[inline]
    pub fn id(&self) -> usize {
        self.state.id()
    }

    /// Runtime context this CPU belongs to
    #[inline]
    pub fn context(&self) -> &'ctx RuntimeContext {
        self.ctx
    }

    #[inline]
    pub(crate) fn state(&self) -> &'ctx CpuState {
        self.state
    }

    /// Current priority level
    #[inline]
    pub fn ipl(&self) -> Ipl {
        self.state.ipl()
    }

    /// Raise the priority level to at least `level`, returning the previous
    /// level for [`Curcpu::splx`]
    #[inline]
    pub fn splraise(&self, level: Ipl) -> Ipl {
        Ipl::from_raw(self.state.ipl.fetch_max(level.raw(), Ordering::AcqRel))
    }

    /// `splraise(Ipl::SoftSerial)`
    #[inline]
    pub fn splsoftserial(&self) -> Ipl {
        self.splraise(Ipl::SoftSerial)
    }

    /// Restore a level returned by `splraise`
    ///
    /// # Panics
    ///
    /// Panics if `previous` is above the current level, or if it is below
    /// `IPL_SOFTSERIAL` while a pserialize read section is open on this CPU.
    #[inline]
    pub fn splx(&self, previous: Ipl) {
        assert!(
            previous >= Ipl::SoftSerial || self.state.read_depth() == 0,
            "splx below IPL_SOFTSERIAL inside a pserialize read section on cpu{}",
            self.id()
        );
        let current = Ipl::from_raw(self.state.ipl.swap(previous.raw(), Ordering::AcqRel));
        assert!(
            current >= previous,
            "splx: restoring {previous} from lower level {current} on cpu{}",
            self.id()
        );
        if previous == Ipl::None && current != Ipl::None {
            self.state.note_lowered();
        }
    }
}

impl Drop for Curcpu<'_> {
    fn drop(&mut self) {
        let depth = self.state.read_depth();
        let ipl = self.state.ipl();

        lwp::set_binding(None);
        lwp::note_switch();

        if std::thread::panicking() {
            // Unwinding out of a section: leave the CPU usable for the
            // cross-call worker.
            self.state.reset();
            return;
        }

        assert_eq!(
            depth,
            0,
            "lwp leaving cpu{} inside a pserialize read section",
            self.state.id()
        );
        assert_eq!(
            ipl,
            Ipl::None,
            "lwp leaving cpu{} at raised priority",
            self.state.id()
        );
    }
}

/*!
 * Light-Weight Process State
 *
 * Per-thread bookkeeping the synchronization layer consults: which CPU the
 * thread is bound to, whether it is a soft-interrupt (cross-call worker)
 * thread, and how many voluntary context switches it has made.
 */

use std::cell::Cell;

/// CPU binding of the current thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Binding {
    pub(crate) ctx: u64,
    pub(crate) cpu: usize,
}

struct Lwp {
    ncsw: Cell<u64>,
    binding: Cell<Option<Binding>>,
    softint: Cell<bool>,
}

thread_local! {
    static CURLWP: Lwp = const {
        Lwp {
            ncsw: Cell::new(0),
            binding: Cell::new(None),
            softint: Cell::new(false),
        }
    };
}

/// Voluntary context switches made by the current thread
///
/// Incremented whenever the thread gives up its CPU or blocks waiting for
/// a cross call.
#[inline]
pub fn voluntary_switches() -> u64 {
    CURLWP.with(|l| l.ncsw.get())
}

#[inline]
pub(crate) fn note_switch() {
    CURLWP.with(|l| l.ncsw.set(l.ncsw.get().wrapping_add(1)));
}

#[inline]
pub(crate) fn binding() -> Option<Binding> {
    CURLWP.with(|l| l.binding.get())
}

#[inline]
pub(crate) fn set_binding(binding: Option<Binding>) {
    CURLWP.with(|l| l.binding.set(binding));
}

/// Whether the current thread runs soft-interrupt work
#[inline]
pub fn in_softint() -> bool {
    CURLWP.with(|l| l.softint.get())
}

#[inline]
pub(crate) fn enter_softint() {
    CURLWP.with(|l| l.softint.set(true));
}

/*!
 * Tracking of Unmanaged Physical Ranges
 *
 * Ranges registered here get per-page metadata even though the page
 * allocator never sees them. Lookups happen on hot paths on every CPU, so
 * they take no lock: they walk a singly linked list inside a pserialize read
 * section.
 *
 * # Writers
 *
 * `track` links a fully built node at the head and publishes it with a
 * release store. `untrack` unlinks under the mutex, then waits in
 * `pserialize::perform` before freeing, so a reader that still holds the
 * old link has finished with the node by the time it goes away.
 *
 * # Node Lifecycle
 *
 * ```text
 * allocated -> linked -> unlinked (readers may still see it) -> freed
 *                                 \__ one completed perform() __/
 * ```
 *
 * Registered ranges must not overlap; this is the caller's responsibility.
 */

use super::page::PmapPage;
use super::{atop, ptoa, trunc_page, Paddr, Psize};
use crate::kern::pserialize::{self, ReadSection};
use crate::kern::{Curcpu, PserializeHandle, RuntimeContext};
use crate::monitoring::span_operation;
use parking_lot::Mutex;
use serde::Serialize;
use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::ops::Deref;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;
use tracing::{debug, instrument};

/// Written over the link of a node before it is freed
const PVT_POISON: usize = 0x1a1a_1a1a_1a1a_1a1a_u64 as usize;

struct PvTrack<P> {
    start: Paddr,
    size: Psize,
    next: AtomicPtr<PvTrack<P>>,
    pages: Box<[P]>,
}

impl<P> PvTrack<P> {
    #[inline]
    fn contains(&self, pa: Paddr) -> bool {
        self.start <= pa && pa - self.start < self.size
    }
}

/// A registered range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TrackedRange {
    pub start: Paddr,
    pub size: Psize,
}

/// Metadata of one tracked page, borrowed from a read section
///
/// Only valid until the section it was looked up in closes.
#[derive(Debug)]
pub struct TrackedPage<'s, P> {
    range: TrackedRange,
    index: usize,
    page: &'s P,
}

impl<'s, P> TrackedPage<'s, P> {
    /// Range the page belongs to
    #[inline]
    pub fn range(&self) -> TrackedRange {
        self.range
    }

    /// Page number within the range
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Physical address of the page
    #[inline]
    pub fn page_address(&self) -> Paddr {
        self.range.start + ptoa(self.index as u64)
    }
}

impl<P> Deref for TrackedPage<'_, P> {
    type Target = P;

    fn deref(&self) -> &P {
        self.page
    }
}

/// Registry of tracked ranges
///
/// # Performance
///
/// - **lookup**: lock-free list walk, O(ranges)
/// - **track**: one allocation, mutex held for two stores
/// - **untrack**: mutex held for the unlink, then one cross-call barrier
pub struct PvTracker<P = PmapPage> {
    ctx: Arc<RuntimeContext>,
    lock: Mutex<()>,
    psz: ManuallyDrop<PserializeHandle>,
    head: AtomicPtr<PvTrack<P>>,
    _owns: PhantomData<Box<PvTrack<P>>>,
}

// SAFETY: nodes are shared with readers on every CPU (`&P` crosses threads)
// and freed by whichever thread untracks them (`P` crosses threads).
unsafe impl<P: Send + Sync> Send for PvTracker<P> {}
unsafe impl<P: Send + Sync> Sync for PvTracker<P> {}

impl<P: Default + Send + Sync> PvTracker<P> {
    /// Create an empty registry bound to `ctx`
    pub fn new(ctx: Arc<RuntimeContext>) -> Self {
        let psz = pserialize::create(&ctx);
        Self {
            ctx,
            lock: Mutex::new(()),
            psz: ManuallyDrop::new(psz),
            head: AtomicPtr::new(ptr::null_mut()),
            _owns: PhantomData,
        }
    }

    /// Runtime context the registry synchronizes on
    pub fn context(&self) -> &Arc<RuntimeContext> {
        &self.ctx
    }

    /// Register `[start, start + size)`
    ///
    /// May sleep.
    ///
    /// # Panics
    ///
    /// Panics if `start` or `size` is not page-aligned, if the range wraps
    /// the address space, or if called inside a read section.
    #[instrument(level = "debug", skip(self))]
    pub fn track(&self, start: Paddr, size: Psize) {
        assert_eq!(start, trunc_page(start), "pmap_pv_track: start {start:#x} not page-aligned");
        assert_eq!(size, trunc_page(size), "pmap_pv_track: size {size:#x} not page-aligned");
        assert!(
            start.checked_add(size).is_some(),
            "pmap_pv_track: range at {start:#x} wraps"
        );
        assert!(
            pserialize::not_in_read_section(&self.ctx),
            "pmap_pv_track: may sleep, called inside a read section"
        );

        let npages = atop(size) as usize;
        let pages: Box<[P]> = (0..npages).map(|_| P::default()).collect();
        let node = Box::into_raw(Box::new(PvTrack {
            start,
            size,
            next: AtomicPtr::new(ptr::null_mut()),
            pages,
        }));

        let _guard = self.lock.lock();
        // SAFETY: not yet published, nobody else can see the node
        unsafe { (*node).next.store(self.head.load(Ordering::Relaxed), Ordering::Relaxed) };
        self.head.store(node, Ordering::Release);
        debug!(npages, "range pv-tracked");
    }

    /// Unregister a range registered with exactly `(start, size)`
    ///
    /// Blocks until no reader can still see the range.
    ///
    /// # Panics
    ///
    /// Panics if no range starts at `start`, or if the range starting there
    /// has a different size: either means the caller's bookkeeping is
    /// already corrupt. Panics before touching the list if called inside a
    /// read section.
    #[instrument(level = "debug", skip(self))]
    pub fn untrack(&self, start: Paddr, size: Psize) {
        assert!(
            pserialize::not_in_read_section(&self.ctx),
            "pmap_pv_untrack: may sleep, called inside a read section"
        );

        let unlinked = {
            let _guard = self.lock.lock();
            let mut link = &self.head;
            loop {
                let cur = link.load(Ordering::Relaxed);
                if cur.is_null() {
                    panic!("pmap_pv_untrack: pages not pv-tracked at {start:#x} ({size:#x} bytes)");
                }
                // SAFETY: a node reachable under the lock has not been
                // unlinked, so no untrack is about to free it
                let node = unsafe { &*cur };
                if node.start != start {
                    link = &node.next;
                    continue;
                }
                if node.size != size {
                    panic!(
                        "pmap_pv_untrack: pv-tracking at {:#x}: {:#x} bytes, not {size:#x} bytes",
                        node.start, node.size
                    );
                }
                // Readers can see either the old or the new list; both are
                // consistent
                link.store(node.next.load(Ordering::Relaxed), Ordering::Release);
                break cur;
            }
        };

        {
            let _span = span_operation("pv_untrack.perform");
            pserialize::perform(&self.ctx, &self.psz);
        }

        // SAFETY: unlinked above, and every read section that could have
        // seen the node closed before perform returned
        let mut node = unsafe { Box::from_raw(unlinked) };
        *node.next.get_mut() = PVT_POISON as *mut PvTrack<P>;
        debug!(npages = node.pages.len(), "range pv-untracked");
        drop(node);
    }

    /// Find the metadata for the page containing `pa`
    ///
    /// Lock-free. The result borrows `section`.
    ///
    /// # Panics
    ///
    /// Panics if `section` belongs to another runtime context.
    #[inline]
    pub fn lookup<'s>(
        &'s self,
        section: &'s ReadSection<'_, '_>,
        pa: Paddr,
    ) -> Option<TrackedPage<'s, P>> {
        assert!(
            ptr::eq(section.context(), Arc::as_ptr(&self.ctx)),
            "pmap_pv_tracked: read section from another runtime context"
        );

        let mut cur = self.head.load(Ordering::Acquire);
        while !cur.is_null() {
            // SAFETY: reached inside a read section; untrack cannot free the
            // node before the section closes, and `section` outlives 's
            let node: &'s PvTrack<P> = unsafe { &*cur };
            if node.contains(pa) {
                let index = atop(pa - node.start) as usize;
                return Some(TrackedPage {
                    range: TrackedRange {
                        start: node.start,
                        size: node.size,
                    },
                    index,
                    page: &node.pages[index],
                });
            }
            cur = node.next.load(Ordering::Acquire);
        }
        None
    }

    /// Run `f` on the lookup result inside a read section of its own
    pub fn with_tracked<R>(
        &self,
        cpu: &Curcpu<'_>,
        pa: Paddr,
        f: impl for<'s> FnOnce(Option<TrackedPage<'s, P>>) -> R,
    ) -> R {
        let section = pserialize::read_section(cpu);
        let page = self.lookup(&section, pa);
        f(page)
    }

    /// Whether `pa` lies in a tracked range
    pub fn is_tracked(&self, cpu: &Curcpu<'_>, pa: Paddr) -> bool {
        self.with_tracked(cpu, pa, |page| page.is_some())
    }

    /// Snapshot of the registered ranges, most recent first
    pub fn ranges(&self) -> Vec<TrackedRange> {
        let _guard = self.lock.lock();
        let mut ranges = Vec::new();
        let mut cur = self.head.load(Ordering::Relaxed);
        while !cur.is_null() {
            // SAFETY: lock held, see untrack
            let node = unsafe { &*cur };
            ranges.push(TrackedRange {
                start: node.start,
                size: node.size,
            });
            cur = node.next.load(Ordering::Relaxed);
        }
        ranges
    }

    /// Number of registered ranges
    pub fn len(&self) -> usize {
        self.ranges().len()
    }

    /// Whether no range is registered
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }
}

impl<P> Drop for PvTracker<P> {
    fn drop(&mut self) {
        // Exclusive access: lookups borrow the tracker
        let mut cur = *self.head.get_mut();
        while !cur.is_null() {
            // SAFETY: every linked node came from Box::into_raw in track
            let mut node = unsafe { Box::from_raw(cur) };
            cur = *node.next.get_mut();
        }
        // SAFETY: taken exactly once, and the field is never used after drop
        let psz = unsafe { ManuallyDrop::take(&mut self.psz) };
        pserialize::destroy(&self.ctx, psz);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pmap::{PAGE_SIZE, PP_ATTRS_D};

    fn tracker() -> PvTracker {
        let ctx = RuntimeContext::builder().ncpu(2).build().unwrap();
        PvTracker::new(ctx)
    }

    #[test]
    fn test_lookup_index_and_address() {
        let pvt = tracker();
        pvt.track(0x10000, 4 * PAGE_SIZE);

        let ctx = pvt.context().clone();
        let cpu = ctx.bind(0).unwrap();
        let section = pserialize::read_section(&cpu);

        let page = pvt.lookup(&section, 0x12345).unwrap();
        assert_eq!(page.index(), 2);
        assert_eq!(page.page_address(), 0x12000);
        assert_eq!(
            page.range(),
            TrackedRange {
                start: 0x10000,
                size: 0x4000
            }
        );
        assert!(pvt.lookup(&section, 0x14000).is_none());
        assert!(pvt.lookup(&section, 0xffff).is_none());
    }

    #[test]
    fn test_metadata_survives_lookups() {
        let pvt = tracker();
        pvt.track(0x4000, 2 * PAGE_SIZE);

        let ctx = pvt.context().clone();
        let cpu = ctx.bind(1).unwrap();
        pvt.with_tracked(&cpu, 0x5000, |page| {
            page.unwrap().set_attrs(PP_ATTRS_D);
        });
        let attrs = pvt.with_tracked(&cpu, 0x5fff, |page| page.map(|p| p.attrs()));
        assert_eq!(attrs, Some(PP_ATTRS_D));
        let other = pvt.with_tracked(&cpu, 0x4000, |page| page.map(|p| p.attrs()));
        assert_eq!(other, Some(0));
    }

    #[test]
    fn test_ranges_most_recent_first() {
        let pvt = tracker();
        assert!(pvt.is_empty());
        pvt.track(0x1000, 0x1000);
        pvt.track(0x8000, 0x2000);
        pvt.track(0x20000, 0x1000);

        let starts: Vec<_> = pvt.ranges().iter().map(|r| r.start).collect();
        assert_eq!(starts, vec![0x20000, 0x8000, 0x1000]);

        // Unlink from the middle
        pvt.untrack(0x8000, 0x2000);
        let starts: Vec<_> = pvt.ranges().iter().map(|r| r.start).collect();
        assert_eq!(starts, vec![0x20000, 0x1000]);
        assert_eq!(pvt.len(), 2);
    }

    #[test]
    fn test_drop_frees_remaining_ranges() {
        let ctx = RuntimeContext::builder().ncpu(1).build().unwrap();
        {
            let pvt: PvTracker = PvTracker::new(ctx.clone());
            pvt.track(0x1000, 0x3000);
            pvt.track(0x10000, 0x1000);
            assert_eq!(pserialize::stats(&ctx).live_handles, 1);
        }
        assert_eq!(pserialize::stats(&ctx).live_handles, 0);
    }

    #[test]
    #[should_panic(expected = "not page-aligned")]
    fn test_track_unaligned_start_panics() {
        tracker().track(0x1001, 0x1000);
    }

    #[test]
    #[should_panic(expected = "not page-aligned")]
    fn test_track_unaligned_size_panics() {
        tracker().track(0x1000, 0x800);
    }

    #[test]
    #[should_panic(expected = "inside a read section")]
    fn test_track_inside_section_panics() {
        let pvt = tracker();
        let ctx = pvt.context().clone();
        let cpu = ctx.bind(0).unwrap();
        let _section = pserialize::read_section(&cpu);
        pvt.track(0x1000, 0x1000);
    }

    #[test]
    #[should_panic(expected = "pmap_pv_untrack: may sleep, called inside a read section")]
    fn test_untrack_inside_section_panics() {
        let pvt = tracker();
        pvt.track(0x1000, 0x1000);
        let ctx = pvt.context().clone();
        let cpu = ctx.bind(0).unwrap();
        let _section = pserialize::read_section(&cpu);
        pvt.untrack(0x1000, 0x1000);
    }

    #[test]
    fn test_untrack_inside_section_leaves_range_linked() {
        let pvt = tracker();
        pvt.track(0x1000, 0x1000);
        let ctx = pvt.context().clone();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let cpu = ctx.bind(0).unwrap();
            let _section = pserialize::read_section(&cpu);
            pvt.untrack(0x1000, 0x1000);
        }));
        assert!(result.is_err());

        assert_eq!(pvt.len(), 1);
        pvt.untrack(0x1000, 0x1000);
        assert!(pvt.is_empty());
    }

    #[test]
    #[should_panic(expected = "another runtime context")]
    fn test_lookup_with_foreign_section_panics() {
        let pvt = tracker();
        let other = RuntimeContext::builder().ncpu(1).build().unwrap();
        let cpu = other.bind(0).unwrap();
        let section = pserialize::read_section(&cpu);
        let _ = pvt.lookup(&section, 0x1000);
    }
}

/*!
 * Physical Map Support
 *
 * Page arithmetic, per-page metadata, and tracking of physical ranges the
 * page allocator does not manage (device memory, firmware regions).
 */

mod page;
mod pvt;

pub use page::{PmapPage, PP_ATTRS_A, PP_ATTRS_D, PP_ATTRS_W};
pub use pvt::{PvTracker, TrackedPage, TrackedRange};

/// Physical address
pub type Paddr = u64;
/// Physical length in bytes
pub type Psize = u64;

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;
pub const PAGE_MASK: u64 = PAGE_SIZE - 1;

/// Round down to a page boundary
#[inline]
pub const fn trunc_page(x: u64) -> u64 {
    x & !PAGE_MASK
}

/// Bytes to pages
#[inline]
pub const fn atop(x: u64) -> u64 {
    x >> PAGE_SHIFT
}

/// Pages to bytes
#[inline]
pub const fn ptoa(x: u64) -> u64 {
    x << PAGE_SHIFT
}

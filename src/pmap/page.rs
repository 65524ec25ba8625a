/*!
 * Per-Page Metadata
 */

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

/// Page modified
pub const PP_ATTRS_D: u32 = 0x01;
/// Page referenced
pub const PP_ATTRS_A: u32 = 0x02;
/// Page mapped writable at least once
pub const PP_ATTRS_W: u32 = 0x04;

/// Metadata for one physical page
///
/// All fields are atomics: lookups hand out shared references from inside
/// read sections, concurrently with other CPUs doing the same.
#[derive(Debug, Default)]
pub struct PmapPage {
    attrs: AtomicU32,
    mappings: AtomicUsize,
}

impl PmapPage {
    /// Set attribute bits, returning the previous attributes
    #[inline]
    pub fn set_attrs(&self, bits: u32) -> u32 {
        self.attrs.fetch_or(bits, Ordering::AcqRel)
    }

    /// Clear attribute bits, returning the previous attributes
    #[inline]
    pub fn clear_attrs(&self, bits: u32) -> u32 {
        self.attrs.fetch_and(!bits, Ordering::AcqRel)
    }

    /// Current attributes
    #[inline]
    pub fn attrs(&self) -> u32 {
        self.attrs.load(Ordering::Acquire)
    }

    /// Whether any of `bits` is set
    #[inline]
    pub fn test_attrs(&self, bits: u32) -> bool {
        self.attrs() & bits != 0
    }

    /// Record a new mapping of the page
    #[inline]
    pub fn add_mapping(&self) -> usize {
        self.mappings.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Record removal of a mapping
    ///
    /// # Panics
    ///
    /// Panics if the page has no mappings.
    pub fn remove_mapping(&self) -> usize {
        let previous = self
            .mappings
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .unwrap_or_else(|_| panic!("pmap_page: mapping count underflow"));
        previous - 1
    }

    /// Current number of mappings
    #[inline]
    pub fn mappings(&self) -> usize {
        self.mappings.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attrs() {
        let pg = PmapPage::default();
        assert_eq!(pg.attrs(), 0);

        assert_eq!(pg.set_attrs(PP_ATTRS_A | PP_ATTRS_D), 0);
        assert!(pg.test_attrs(PP_ATTRS_D));
        assert!(!pg.test_attrs(PP_ATTRS_W));

        assert_eq!(pg.clear_attrs(PP_ATTRS_D), PP_ATTRS_A | PP_ATTRS_D);
        assert_eq!(pg.attrs(), PP_ATTRS_A);
    }

    #[test]
    fn test_mapping_count() {
        let pg = PmapPage::default();
        assert_eq!(pg.add_mapping(), 1);
        assert_eq!(pg.add_mapping(), 2);
        assert_eq!(pg.remove_mapping(), 1);
        assert_eq!(pg.mappings(), 1);
    }

    #[test]
    #[should_panic(expected = "underflow")]
    fn test_mapping_underflow_panics() {
        PmapPage::default().remove_mapping();
    }
}

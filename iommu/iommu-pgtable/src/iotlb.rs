//! TLB maintenance boundary.
//!
//! The page-table code never touches hardware; it reports what must be
//! invalidated through [`FlushOps`] and lets the caller batch leaf
//! invalidations with an [`IotlbGather`].

use iommu_addresses::Iova;

/// Invalidation requests issued while the tree is mutated, implemented by
/// the surrounding driver.
pub trait FlushOps {
    /// Invalidate cached intermediate-walk state covering `[iova,
    /// iova + size)`. Issued after a table entry is removed (its subtree is
    /// freed right after, so stale walk caches must not reference it).
    /// `granule` is the table's page size, for drivers that invalidate by
    /// page.
    fn flush_walk(&self, iova: Iova, size: u64, granule: u64);

    /// Invalidate the single cached leaf translation for `[iova,
    /// iova + size)`. Only issued when the caller has not opted into
    /// deferred flushing (see [`IotlbGather::set_queued`]).
    fn flush_page(&self, iova: Iova, size: u64);
}

/// Accumulates the range of leaf translations removed by unmap calls so the
/// caller can invalidate them in one sweep.
///
/// With [`set_queued`](Self::set_queued) the caller declares it will flush
/// later in bulk; per-page [`FlushOps::flush_page`] calls are then skipped
/// while the range keeps accumulating.
#[derive(Debug, Clone)]
pub struct IotlbGather {
    start: u64,
    end: u64,
    pgsize: u64,
    queued: bool,
}

impl IotlbGather {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            start: u64::MAX,
            end: 0,
            pgsize: 0,
            queued: false,
        }
    }

    /// Declare that the caller flushes in bulk later; per-page flush
    /// callbacks are suppressed for unmaps using this gather.
    pub const fn set_queued(&mut self, queued: bool) {
        self.queued = queued;
    }

    #[inline]
    #[must_use]
    pub const fn is_queued(&self) -> bool {
        self.queued
    }

    /// Grow the accumulated range to include `[iova, iova + size)`.
    pub fn add_range(&mut self, iova: Iova, size: u64) {
        let start = iova.as_u64();
        let end = start + size - 1;
        self.start = self.start.min(start);
        self.end = self.end.max(end);
        self.pgsize = size;
    }

    /// Whether any range has been recorded.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.start > self.end
    }

    /// The accumulated inclusive range, if any.
    #[must_use]
    pub fn range(&self) -> Option<(Iova, Iova)> {
        if self.is_empty() {
            None
        } else {
            Some((Iova::new(self.start), Iova::new(self.end)))
        }
    }

    /// Block size of the most recently recorded leaf.
    #[must_use]
    pub const fn pgsize(&self) -> u64 {
        self.pgsize
    }
}

impl Default for IotlbGather {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_gather_has_no_range() {
        let gather = IotlbGather::new();
        assert!(gather.is_empty());
        assert_eq!(gather.range(), None);
        assert!(!gather.is_queued());
    }

    #[test]
    fn ranges_accumulate_to_min_max() {
        let mut gather = IotlbGather::new();
        gather.add_range(Iova::new(0x5000), 0x1000);
        gather.add_range(Iova::new(0x2000), 0x1000);
        gather.add_range(Iova::new(0x9000), 0x1000);

        let (start, end) = gather.range().unwrap();
        assert_eq!(start.as_u64(), 0x2000);
        assert_eq!(end.as_u64(), 0x9FFF);
        assert_eq!(gather.pgsize(), 0x1000);
    }
}

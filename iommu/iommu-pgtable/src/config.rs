//! Page-table configuration as requested by the surrounding driver.
//!
//! A [`IoPgtableCfg`] describes what the caller wants; construction
//! restricts it to what the hardware format supports (see
//! [`DartPageTable::new`](crate::DartPageTable::new)) and derives the tree
//! geometry from the result.

/// 4 KiB, the small DART granule.
pub const SZ_4K: u64 = 1 << 12;
/// 16 KiB, the large DART granule.
pub const SZ_16K: u64 = 1 << 14;
/// 2 MiB, the level-1 block size of a 4 KiB-granule table.
pub const SZ_2M: u64 = 1 << 21;
/// 32 MiB, the level-1 block size of a 16 KiB-granule table.
pub const SZ_32M: u64 = 1 << 25;
/// 1 GiB, the level-0 block size of a 4 KiB-granule table.
pub const SZ_1G: u64 = 1 << 30;

/// Hardware entry encoding generation.
///
/// The two generations lay out the same information incompatibly; the codec
/// in [`dart::entry`](crate::dart::entry) dispatches on this once per
/// instance.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DartFormat {
    /// First-generation layout: in-place physical address (bits 35:12),
    /// deny bits at 8/7, sub-page disable at bit 1. 36-bit physical reach.
    V1,
    /// Second-generation layout: physical address shifted right by 4 into
    /// bits 37:10, deny bits at 3/2, no-cache at bit 1. 42-bit physical
    /// reach at 16 KiB alignment.
    V2,
}

/// How the hardware consumes the top of the tree.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RootStyle {
    /// One table-base register. The root table may span more or fewer bits
    /// than a full level.
    Single,
    /// Up to four table-base registers walking two levels each. The top
    /// level is folded into consecutive root tables inside one contiguous
    /// block; each base register points at one of them.
    Concatenated,
}

/// Requested page-table configuration.
///
/// Plain data; field combinations are validated when the table is built.
#[derive(Debug, Copy, Clone)]
pub struct IoPgtableCfg {
    /// Bitmap of block sizes the caller wants to map with, e.g.
    /// `SZ_4K | SZ_2M`. Restricted at construction to the sizes one granule
    /// supports; the granule is the smallest requested size.
    pub pgsize_bitmap: u64,
    /// Input (IOVA) address width in bits. Capped at 48.
    pub ias: u32,
    /// Output (physical) address width in bits. Capped at 48 and at the
    /// format's physical reach (v1: 36, v2: 42).
    pub oas: u32,
    /// Whether the hardware walks tables coherently with the CPU caches.
    /// Only coherent-walk setups are accepted; non-coherent ones would need
    /// a cache clean per entry write, which this crate does not issue.
    pub coherent_walk: bool,
    /// Entry encoding generation.
    pub format: DartFormat,
    /// Root-table arrangement.
    pub root_style: RootStyle,
}

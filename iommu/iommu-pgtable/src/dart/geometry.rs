//! Walk geometry: page-size restriction, level derivation and index math.
//!
//! Everything here is pure arithmetic over the configuration; no table
//! memory is touched.

use crate::config::{IoPgtableCfg, RootStyle, SZ_1G, SZ_2M, SZ_4K, SZ_16K, SZ_32M};

use super::MAX_LEVELS;

/// Upper bound on the input and output address widths.
const MAX_ADDR_BITS: u32 = 48;

/// Entries are 64-bit, so indices start above the low three address bits.
const PTE_SHIFT: u32 = 3;

/// Why a configuration cannot be turned into a page table.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// The page-size bitmap holds no size the hardware can express.
    #[error("no supported page size remains after restriction")]
    UnsupportedPageSizes,
    /// The input address width does not reach past the page offset.
    #[error("input address width does not clear the page shift")]
    InputWidthTooSmall,
    /// The input address width would need a deeper walk than the hardware
    /// performs.
    #[error("input address width needs more than three levels")]
    TooManyLevels,
    /// The root table is too wide to express as concatenated base registers.
    #[error("root table is too wide to concatenate")]
    TooManyRoots,
    /// The walker reads table memory without snooping caches.
    #[error("table walks must be cache-coherent")]
    NonCoherentWalk,
    /// The root table allocation failed.
    #[error("out of memory")]
    OutOfMemory,
}

/// Derived shape of the walk: granule, level span and root width.
///
/// The three potential levels are numbered 0..3 from the top; a walk that
/// needs fewer levels starts further down at `start_level`. The root table
/// may be wider than a granule, in which case it spans several consecutive
/// base registers.
#[derive(Debug, Copy, Clone)]
pub(crate) struct Geometry {
    pgsize_bitmap: u64,
    ias: u32,
    oas: u32,
    bits_per_level: u32,
    start_level: usize,
    root_bits: u32,
    n_ttbrs: usize,
}

impl Geometry {
    /// Derive the walk shape for `cfg`, or explain why there is none.
    pub(crate) fn new(cfg: &IoPgtableCfg) -> Result<Self, ConfigError> {
        let (pgsize_bitmap, ias, oas) = restrict_pgsizes(cfg);

        if (pgsize_bitmap & (SZ_4K | SZ_16K)) == 0 {
            return Err(ConfigError::UnsupportedPageSizes);
        }

        let pg_shift = pgsize_bitmap.trailing_zeros();
        let bits_per_level = pg_shift - PTE_SHIFT;

        if ias <= pg_shift {
            return Err(ConfigError::InputWidthTooSmall);
        }
        let va_bits = ias - pg_shift;
        let levels = va_bits.div_ceil(bits_per_level) as usize;
        if levels > MAX_LEVELS {
            return Err(ConfigError::TooManyLevels);
        }

        let mut start_level = MAX_LEVELS - levels;
        let mut root_bits = va_bits - bits_per_level * (levels as u32 - 1);
        let mut n_ttbrs = 1_usize;

        if cfg.root_style == RootStyle::Concatenated {
            // The hardware always walks two levels but can fan the root
            // table out over up to four base registers, each covering one
            // granule-sized slice of it.
            if start_level == 0 && root_bits > 2 {
                return Err(ConfigError::TooManyRoots);
            }
            if start_level > 0 {
                root_bits = 0;
            }
            start_level = 1;
            n_ttbrs = 1 << root_bits;
            root_bits += bits_per_level;
        }

        Ok(Self {
            pgsize_bitmap,
            ias,
            oas,
            bits_per_level,
            start_level,
            root_bits,
            n_ttbrs,
        })
    }

    /// Page sizes that survived restriction.
    pub(crate) const fn pgsize_bitmap(&self) -> u64 {
        self.pgsize_bitmap
    }

    /// Input (bus) address width in bits.
    pub(crate) const fn ias(&self) -> u32 {
        self.ias
    }

    /// Output (physical) address width in bits.
    pub(crate) const fn oas(&self) -> u32 {
        self.oas
    }

    /// Size in bytes of one non-root table, equal to the page size.
    pub(crate) const fn granule(&self) -> u64 {
        (size_of::<u64>() as u64) << self.bits_per_level
    }

    /// Size in bytes of the root table block.
    pub(crate) const fn root_size(&self) -> u64 {
        (size_of::<u64>() as u64) << self.root_bits
    }

    /// Topmost populated level of the walk.
    pub(crate) const fn start_level(&self) -> usize {
        self.start_level
    }

    /// Number of consecutive granule-sized root slices.
    pub(crate) const fn n_ttbrs(&self) -> usize {
        self.n_ttbrs
    }

    /// Right shift that brings the index bits for `level` to the bottom.
    const fn level_shift(&self, level: usize) -> u32 {
        (MAX_LEVELS - level) as u32 * self.bits_per_level + PTE_SHIFT
    }

    /// Index width at `level`; only the root can be wider than a granule.
    const fn level_width(&self, level: usize) -> u32 {
        if level == self.start_level {
            self.root_bits
        } else {
            self.bits_per_level
        }
    }

    /// Index into the table at `level` selecting `iova`.
    #[inline]
    pub(crate) const fn level_index(&self, iova: u64, level: usize) -> usize {
        ((iova >> self.level_shift(level)) & ((1 << self.level_width(level)) - 1)) as usize
    }

    /// Number of entries in a table at `level`.
    #[inline]
    pub(crate) const fn ptes_per_table(&self, level: usize) -> usize {
        1 << self.level_width(level)
    }

    /// Bytes mapped by one entry at `level`.
    #[inline]
    pub(crate) const fn block_size(&self, level: usize) -> u64 {
        1 << self.level_shift(level)
    }
}

/// Clamp the requested page sizes to one granule's translation regime and
/// cap the address widths.
///
/// The granule is the smallest requested size; everything the chosen
/// granule cannot express is dropped. The output width is additionally
/// capped by the reach of the format's address field.
fn restrict_pgsizes(cfg: &IoPgtableCfg) -> (u64, u32, u32) {
    let granule = cfg.pgsize_bitmap & cfg.pgsize_bitmap.wrapping_neg();
    let page_sizes = match granule {
        SZ_4K => SZ_4K | SZ_2M | SZ_1G,
        SZ_16K => SZ_16K | SZ_32M,
        _ => 0,
    };

    let oas_cap = MAX_ADDR_BITS.min(cfg.format.paddr_bits());
    (
        cfg.pgsize_bitmap & page_sizes,
        cfg.ias.min(MAX_ADDR_BITS),
        cfg.oas.min(oas_cap),
    )
}

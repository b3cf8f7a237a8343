//! DART page-table entry layouts and the per-format PTE codec.
//!
//! Both generations share the valid bit and the subpage range fields; they
//! differ in where the physical address and the protection bits live.

use bitfield_struct::bitfield;
use iommu_addresses::PhysicalAddress;

use crate::Prot;
use crate::config::DartFormat;

use super::MAX_LEVELS;

/// Hardware **Valid** bit position shared by both formats (bit 0).
pub(crate) const PTE_VALID: u64 = 1 << 0;

/// v1 physical address field (bits **35:12**), in place.
const DART1_PADDR_MASK: u64 = 0x0000_000F_FFFF_F000;

/// v2 physical address field (bits **37:10**), holding `paddr >> 4`.
const DART2_PADDR_MASK: u64 = 0x0000_003F_FFFF_FC00;

/// v2 stores the physical address right-shifted by this amount.
const DART2_PADDR_SHIFT: u32 = 4;

/// Subpage end index covering the whole page (disables subpage clipping).
const SUBPAGE_END_FULL: u16 = 0xFFF;

/* ============================ v1 entry layout ============================= */

/// DART **v1** entry (T8103 generation).
///
/// The same layout is used at every level; only the valid bit and the
/// address field matter for non-leaf entries. Subpage fields are meaningful
/// on leaves and are written as the full-page range.
#[bitfield(u64)]
pub struct DartV1Pte {
    /// **Valid** (bit 0): the entry points at a page or a next-level table.
    pub valid: bool,

    /// **Subpage protection disable** (bit 1): set on bottom-level leaves.
    pub sp_dis: bool,

    /// (bits 6:2): reserved, written as zero.
    #[bits(5)]
    __reserved_6_2: u8,

    /// **No write** (bit 7): write accesses through this leaf fault.
    pub no_write: bool,

    /// **No read** (bit 8): read accesses through this leaf fault.
    pub no_read: bool,

    /// (bits 11:9): reserved, written as zero.
    #[bits(3)]
    __reserved_11_9: u8,

    /// **Physical address** (bits 35:12): page or next-level table base.
    #[bits(24)]
    addr_35_12: u64,

    /// (bits 39:36): reserved, written as zero.
    #[bits(4)]
    __reserved_39_36: u8,

    /// **Subpage end** (bits 51:40): last valid 4-byte unit, inclusive.
    #[bits(12)]
    pub subpage_end: u16,

    /// **Subpage start** (bits 63:52): first valid 4-byte unit.
    #[bits(12)]
    pub subpage_start: u16,
}

impl DartV1Pte {
    /// Set the page or table base address (must be 4 KiB-aligned).
    #[inline]
    pub const fn set_physical_address(&mut self, phys: PhysicalAddress) {
        debug_assert!(phys.is_aligned_to(0x1000));
        self.set_addr_35_12(phys.as_u64() >> 12);
    }

    /// Get the page or table base address.
    #[inline]
    #[must_use]
    pub const fn physical_address(self) -> PhysicalAddress {
        PhysicalAddress::new(self.addr_35_12() << 12)
    }
}

/* ============================ v2 entry layout ============================= */

/// DART **v2** entry (T6000 generation).
///
/// The address field is stored pre-shifted by four, which moves its reach up
/// to 42 bits and its granularity up to 16 KiB.
#[bitfield(u64)]
pub struct DartV2Pte {
    /// **Valid** (bit 0): the entry points at a page or a next-level table.
    pub valid: bool,

    /// **No cache** (bit 1): accesses through this leaf bypass the cache.
    pub no_cache: bool,

    /// **No write** (bit 2): write accesses through this leaf fault.
    pub no_write: bool,

    /// **No read** (bit 3): read accesses through this leaf fault.
    pub no_read: bool,

    /// (bits 9:4): reserved, written as zero.
    #[bits(6)]
    __reserved_9_4: u8,

    /// **Physical address** (bits 37:10): bits 41:14 of the page or
    /// next-level table base.
    #[bits(28)]
    addr_41_14: u64,

    /// (bits 39:38): reserved, written as zero.
    #[bits(2)]
    __reserved_39_38: u8,

    /// **Subpage end** (bits 51:40): last valid 4-byte unit, inclusive.
    #[bits(12)]
    pub subpage_end: u16,

    /// **Subpage start** (bits 63:52): first valid 4-byte unit.
    #[bits(12)]
    pub subpage_start: u16,
}

impl DartV2Pte {
    /// Set the page or table base address (must be 16 KiB-aligned).
    #[inline]
    pub const fn set_physical_address(&mut self, phys: PhysicalAddress) {
        debug_assert!(phys.is_aligned_to(0x4000));
        self.set_addr_41_14(phys.as_u64() >> 14);
    }

    /// Get the page or table base address.
    #[inline]
    #[must_use]
    pub const fn physical_address(self) -> PhysicalAddress {
        PhysicalAddress::new(self.addr_41_14() << 14)
    }
}

/* ============================ entry inspection ============================ */

/// What a raw entry means at a given level of the walk.
///
/// The hardware has no dedicated table bit. An entry at the bottom level is
/// a leaf when its valid bit is set; a non-empty entry anywhere above is a
/// pointer to the next-level table.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EntryKind {
    /// All-zero entry; nothing is mapped here.
    Empty,
    /// Bottom-level entry mapping a page.
    Leaf,
    /// Entry pointing at a next-level table.
    Table,
}

impl EntryKind {
    /// Classify a raw entry read from level `level`.
    #[must_use]
    pub const fn of(pte: u64, level: usize) -> Self {
        if pte == 0 {
            Self::Empty
        } else if level == MAX_LEVELS - 1 && (pte & PTE_VALID) != 0 {
            Self::Leaf
        } else {
            Self::Table
        }
    }
}

/* ============================= format codec =============================== */

impl DartFormat {
    /// Reach of the physical address field, in bits.
    pub(crate) const fn paddr_bits(self) -> u32 {
        match self {
            Self::V1 => 36,
            Self::V2 => 42,
        }
    }

    /// Place a physical address into the format's entry address field.
    #[inline]
    #[must_use]
    pub const fn encode_paddr(self, paddr: u64) -> u64 {
        match self {
            Self::V1 => paddr & DART1_PADDR_MASK,
            Self::V2 => (paddr >> DART2_PADDR_SHIFT) & DART2_PADDR_MASK,
        }
    }

    /// Recover the physical address held in an entry's address field.
    #[inline]
    #[must_use]
    pub const fn decode_paddr(self, pte: u64) -> u64 {
        match self {
            Self::V1 => pte & DART1_PADDR_MASK,
            Self::V2 => (pte & DART2_PADDR_MASK) << DART2_PADDR_SHIFT,
        }
    }

    /// Deny bits for a leaf granting `prot`.
    ///
    /// The hardware expresses permissions negatively, so an absent right
    /// sets a bit. v2 additionally marks non-cacheable mappings.
    pub(crate) fn prot_bits(self, prot: Prot) -> u64 {
        match self {
            Self::V1 => {
                let mut pte = DartV1Pte::new();
                if !prot.contains(Prot::WRITE) {
                    pte = pte.with_no_write(true);
                }
                if !prot.contains(Prot::READ) {
                    pte = pte.with_no_read(true);
                }
                pte.into_bits()
            }
            Self::V2 => {
                let mut pte = DartV2Pte::new();
                if !prot.contains(Prot::WRITE) {
                    pte = pte.with_no_write(true);
                }
                if !prot.contains(Prot::READ) {
                    pte = pte.with_no_read(true);
                }
                if !prot.contains(Prot::CACHE) {
                    pte = pte.with_no_cache(true);
                }
                pte.into_bits()
            }
        }
    }

    /// Address-free part of a leaf entry: valid bit, full subpage range and
    /// the deny bits, plus subpage-disable on bottom-level v1 leaves.
    pub(crate) fn leaf_base(self, prot_bits: u64, bottom_level: bool) -> u64 {
        let base = match self {
            Self::V1 => DartV1Pte::new()
                .with_valid(true)
                .with_sp_dis(bottom_level)
                .with_subpage_end(SUBPAGE_END_FULL)
                .into_bits(),
            Self::V2 => DartV2Pte::new()
                .with_valid(true)
                .with_subpage_end(SUBPAGE_END_FULL)
                .into_bits(),
        };
        base | prot_bits
    }

    /// Entry pointing at a next-level table at `child`.
    pub(crate) const fn table_pte(self, child: u64) -> u64 {
        self.encode_paddr(child) | PTE_VALID
    }
}

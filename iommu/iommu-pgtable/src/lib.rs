//! # DART-style IOMMU Page Tables
//!
//! Builds, mutates and tears down the radix page-table trees that a DART
//! ("device address resolution table") IOMMU walks to translate device
//! addresses, and answers the same translation queries in software.
//!
//! ## What you get
//! - A [`DartPageTable`] per device address space: map, unmap, translate,
//!   free.
//! - Two bit-exact hardware entry encodings ([`DartV1Pte`], [`DartV2Pte`])
//!   behind one [`DartFormat`] codec.
//! - Geometry derivation from a page-size bitmap and address widths,
//!   including the multi-root "concatenation" used by hardware with several
//!   table-base registers ([`RootStyle`]).
//! - A tiny allocator/mapper boundary ([`TableAlloc`], [`PhysMapper`]) and a
//!   TLB maintenance boundary ([`FlushOps`], [`IotlbGather`]) so the
//!   surrounding driver stays in charge of memory and hardware.
//!
//! ## IOVA → Physical Address Walk
//!
//! The tree has a fixed depth of three levels; narrow address spaces elide
//! the top levels by starting the walk further down. With a 4 KiB granule
//! each level indexes 9 bits:
//!
//! ```text
//! | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  L0   |  L1   |  L2   | Offset |
//! ```
//!
//! ```text
//!  root (L0)  →  L1 table  →  L2 table  →  physical block
//!    │             │             │
//!    │             │             └───► leaf entry, maps one granule (4 KiB)
//!    │             └─────────────────► table entry, points at an L2 table
//!    └───────────────────────────────► table entry, points at an L1 table
//! ```
//!
//! | Level | Role | Block size (4 KiB granule) |
//! |:------|:-----|:---------------------------|
//! | L0 | root (may be narrower or wider than a full level) | 1 GiB |
//! | L1 | intermediate | 2 MiB |
//! | L2 | deepest — every valid entry here is a leaf | 4 KiB |
//!
//! ### Leaf vs. table entries
//!
//! DART entries carry no leaf/table discriminator bit; the tag is derived
//! from the level. A valid entry at the deepest level is a **leaf** (maps
//! physical memory); a valid entry above it is a **table entry** (points at
//! a child table). See [`EntryKind`].
//!
//! ### Concatenated roots
//!
//! Some DART instances walk only two levels in hardware but expose up to
//! four table-base registers. [`RootStyle::Concatenated`] folds the top
//! level into consecutive root tables inside one contiguous allocation:
//!
//! ```text
//! TTBR0 ──► root granule 0 ┐
//! TTBR1 ──► root granule 1 │  one contiguous block; the walk treats it
//! TTBR2 ──► root granule 2 │  as a single wide top level
//! TTBR3 ──► root granule 3 ┘
//! ```
//!
//! ## Concurrency
//!
//! Callers serialize map/unmap against each other at a coarser level (an
//! IOMMU framework lock, typically); hardware walks read concurrently at any
//! time. The one race this crate resolves itself is two map calls populating
//! the same empty intermediate slot, settled by a compare-and-swap on the
//! raw entry — the loser frees its allocation and adopts the winner's table.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod config;
pub mod dart;
pub mod iotlb;

use core::ptr::NonNull;

pub use crate::config::{DartFormat, IoPgtableCfg, RootStyle};
pub use crate::dart::entry::{DartV1Pte, DartV2Pte, EntryKind};
pub use crate::dart::geometry::ConfigError;
pub use crate::dart::{DartPageTable, MapError};
pub use crate::iotlb::{FlushOps, IotlbGather};
pub use iommu_addresses::{Iova, MemoryAddress, PhysicalAddress};

bitflags::bitflags! {
    /// Access permissions requested for a mapping.
    ///
    /// DART entries store the *inverse* (deny bits); the codec inverts on
    /// encode. A request with neither [`READ`](Prot::READ) nor
    /// [`WRITE`](Prot::WRITE) maps nothing and succeeds — see
    /// [`DartPageTable::map_pages`].
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct Prot: u32 {
        /// Device may read through the mapping.
        const READ = 1 << 0;
        /// Device may write through the mapping.
        const WRITE = 1 << 1;
        /// Accesses may be cached/coherent. Only the v2 format encodes
        /// this; v1 hardware has no cache-control bit.
        const CACHE = 1 << 2;
    }
}

/// Allocator for table pages, implemented by the surrounding IOMMU driver.
///
/// ### Contract
/// - `alloc_pages(size)` returns `size` bytes of **zeroed** memory,
///   naturally aligned (aligned to `size`, a power of two), owned by the
///   caller until passed back to [`free_pages`](Self::free_pages).
/// - Returned addresses lie within the entry format's physical reach
///   (v1: 36 bits, v2: 42 bits): table pointers are stored through the
///   same entry address field as leaf targets, and an address beyond the
///   field would be silently truncated when stored.
/// - Takes `&self`: mappings may be installed from several threads at once,
///   so implementations synchronize internally (kernel page allocators
///   already do).
pub trait TableAlloc {
    /// Allocate `size` bytes of zeroed, naturally aligned table memory.
    fn alloc_pages(&self, size: usize) -> Option<PhysicalAddress>;

    /// Return a block previously handed out by
    /// [`alloc_pages`](Self::alloc_pages) with the same `size`.
    fn free_pages(&self, addr: PhysicalAddress, size: usize);
}

/// Converts physical addresses of table pages into usable pointers.
///
/// In a kernel this is typically an identity or constant-offset mapping of
/// physical memory; tests back it with plain heap allocations.
pub trait PhysMapper {
    /// Map a physical table-page address to an accessible pointer.
    ///
    /// ### Safety
    /// `addr` must be a live table page obtained from the companion
    /// [`TableAlloc`], and the returned pointer must stay valid for as long
    /// as that page remains allocated. The caller performs only properly
    /// aligned 64-bit accesses within the page.
    unsafe fn phys_to_ptr(&self, addr: PhysicalAddress) -> NonNull<u8>;
}

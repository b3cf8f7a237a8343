//! # Device and Physical Memory Address Types
//!
//! Strongly typed wrappers for the raw addresses handled by IOMMU page-table
//! code.
//!
//! ## Overview
//!
//! An IOMMU translates between two address spaces that are easy to confuse
//! when both are carried around as bare `u64` values:
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`Iova`] | An I/O virtual address — the address a device issues a DMA transaction in. |
//! | [`PhysicalAddress`] | A host physical address — RAM or MMIO, the result of a translation. |
//! | [`MemoryAddress`] | The shared raw 64-bit representation both wrappers are built on. |
//!
//! The wrappers are zero-cost (`#[repr(transparent)]` over `u64`), implement
//! `Copy`, `Eq`, `Ord` and `Hash`, and only carry *intent* — no canonicality
//! or range validation happens here. Page-table code decides what is in range
//! for a given table geometry.
//!
//! ## Typical Usage
//!
//! ```rust
//! # use iommu_addresses::*;
//! let iova = Iova::new(0x0000_0000_4000_1234);
//! let paddr = PhysicalAddress::new(0x0000_0001_2000_0000);
//!
//! // Block-offset arithmetic is explicit and uses runtime block sizes,
//! // because IOMMU tables pick their granule per instance.
//! let block = 0x1000;
//! assert_eq!(iova.align_down(block).as_u64(), 0x0000_0000_4000_1000);
//! assert_eq!((paddr + 0x42).as_u64(), 0x0000_0001_2000_0042);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod iova;
mod memory_address;
mod physical_address;

pub use iova::Iova;
pub use memory_address::MemoryAddress;
pub use physical_address::PhysicalAddress;

use crate::MemoryAddress;
use core::fmt;
use core::ops::{Add, AddAssign};
use core::ptr::NonNull;

/// Physical memory address.
///
/// A thin wrapper around [`MemoryAddress`] that denotes **physical** addresses
/// (host RAM / MMIO). Like [`Iova`](crate::Iova), this type carries intent and
/// prevents accidental IOVA↔PA mix-ups.
///
/// ### Semantics
/// - Page-table entries store **block-aligned** physical bases plus flag bits;
///   use [`align_down`](Self::align_down) / [`offset_in`](Self::offset_in) to
///   reason about base vs. offset explicitly.
/// - [`from_ptr`](Self::from_ptr) exists for identity-mapped environments
///   (and test harnesses) where a host pointer doubles as the physical
///   address.
///
/// ### Examples
/// ```rust
/// # use iommu_addresses::*;
/// let pa = PhysicalAddress::new(0x0000_0010_2000_0042);
/// assert!(pa.align_down(0x1000).is_aligned_to(0x1000));
/// assert_eq!(pa.offset_in(0x1000), 0x42);
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalAddress(pub(crate) MemoryAddress);

impl PhysicalAddress {
    #[inline]
    #[must_use]
    pub const fn from_nonnull<T>(ptr: NonNull<T>) -> Self {
        Self::from_ptr(ptr.as_ptr())
    }

    #[inline]
    #[must_use]
    pub const fn from_ptr<T>(ptr: *const T) -> Self {
        Self(MemoryAddress::from_ptr(ptr))
    }

    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self::new(0)
    }

    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(MemoryAddress::new(v))
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0.as_u64()
    }

    /// Align down to an `align`-byte boundary (`align` a power of two).
    #[inline]
    #[must_use]
    pub const fn align_down(self, align: u64) -> Self {
        Self(self.0.align_down(align))
    }

    /// The offset of this address within an `align`-sized, aligned block.
    #[inline]
    #[must_use]
    pub const fn offset_in(self, align: u64) -> u64 {
        self.0.offset_in(align)
    }

    /// Whether the low bits below `align` are all zero.
    #[inline]
    #[must_use]
    pub const fn is_aligned_to(self, align: u64) -> bool {
        self.0.is_aligned_to(align)
    }
}

impl fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PA(0x{:016X})", self.as_u64())
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.as_u64())
    }
}

impl From<u64> for PhysicalAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self::new(v)
    }
}

impl From<PhysicalAddress> for u64 {
    #[inline]
    fn from(a: PhysicalAddress) -> Self {
        a.as_u64()
    }
}

impl Add<u64> for PhysicalAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for PhysicalAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

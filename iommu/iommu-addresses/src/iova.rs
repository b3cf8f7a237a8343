use crate::MemoryAddress;
use core::fmt;
use core::ops::{Add, AddAssign};

/// I/O virtual address.
///
/// A thin wrapper around [`MemoryAddress`] that denotes the address space a
/// *device* issues transactions in. It is the input of an IOMMU translation,
/// never a host pointer — there is deliberately no way to build an `Iova`
/// from a pointer.
///
/// ### Invariants
/// - None beyond "this is intended to be a device address". Whether a value
///   fits a particular table's input width is checked by the table, not here.
///
/// ### Examples
/// ```rust
/// # use iommu_addresses::*;
/// let iova = Iova::new(0x4000_2345);
/// assert_eq!(iova.align_down(0x1000).as_u64(), 0x4000_2000);
/// assert_eq!(iova.offset_in(0x1000), 0x345);
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Iova(pub(crate) MemoryAddress);

impl Iova {
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
}

impl fmt::Debug for Iova {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IOVA(0x{:016X})", self.as_u64())
    }
}

impl fmt::Display for Iova {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.as_u64())
    }
}

impl From<u64> for Iova {
    #[inline]
    fn from(v: u64) -> Self {
        Self::new(v)
    }
}

impl From<Iova> for u64 {
    #[inline]
    fn from(a: Iova) -> Self {
        a.as_u64()
    }
}

impl Add<u64> for Iova {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for Iova {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

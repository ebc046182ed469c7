//! Physical and virtual address newtypes.
//!
//! `PhysAddr` and `VirtAddr` are thin `u64` wrappers; mixing them up is the
//! classic kernel bug, so conversions are explicit. Translation between the
//! two goes through the higher-half direct map (HHDM) offset published by
//! the bootloader.

use core::fmt;
use core::ops::{Add, Sub};

/// Size of one page frame in bytes.
pub const PAGE_SIZE: usize = 4096;

/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: usize = 12;

/// First virtual address of the shared kernel half.
///
/// Everything at or above this address is mapped identically in every
/// address-space context and never torn down with one.
pub const KSPACE_START: u64 = 0xffff_8000_0000_0000;

/// A physical memory address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(u64);

impl PhysAddr {
    /// Wraps a raw physical address.
    #[must_use]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// The zero address.
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns whether the address is page-aligned.
    #[must_use]
    pub const fn is_page_aligned(self) -> bool {
        self.0 % PAGE_SIZE as u64 == 0
    }

    /// Rounds down to the containing page boundary.
    #[must_use]
    pub const fn page_base(self) -> Self {
        Self(self.0 & !(PAGE_SIZE as u64 - 1))
    }

    /// Translates to the HHDM virtual alias given the boot-published offset.
    #[must_use]
    pub const fn to_hhdm(self, hhdm_offset: u64) -> VirtAddr {
        VirtAddr(self.0 + hhdm_offset)
    }
}

impl Add<u64> for PhysAddr {
    type Output = Self;
    fn add(self, rhs: u64) -> Self {
        Self(self.0 + rhs)
    }
}

impl Sub<PhysAddr> for PhysAddr {
    type Output = u64;
    fn sub(self, rhs: PhysAddr) -> u64 {
        self.0 - rhs.0
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#x})", self.0)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A virtual memory address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VirtAddr(u64);

impl VirtAddr {
    /// Wraps a raw virtual address.
    #[must_use]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// The zero address.
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the address as a const pointer.
    #[must_use]
    pub const fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    /// Returns the address as a mut pointer.
    #[must_use]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// Returns whether the address is page-aligned.
    #[must_use]
    pub const fn is_page_aligned(self) -> bool {
        self.0 % PAGE_SIZE as u64 == 0
    }

    /// Rounds down to the containing page boundary.
    #[must_use]
    pub const fn page_base(self) -> Self {
        Self(self.0 & !(PAGE_SIZE as u64 - 1))
    }

    /// Rounds up to the next page boundary.
    #[must_use]
    pub const fn page_align_up(self) -> Self {
        Self((self.0 + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1))
    }

    /// Returns whether the address belongs to the shared kernel half.
    #[must_use]
    pub const fn is_kernel_space(self) -> bool {
        self.0 >= KSPACE_START
    }

    /// Translates an HHDM alias back to its physical address.
    ///
    /// # Panics
    ///
    /// Panics in debug builds if the address is below the HHDM base.
    #[must_use]
    pub const fn hhdm_to_phys(self, hhdm_offset: u64) -> PhysAddr {
        debug_assert!(self.0 >= hhdm_offset);
        PhysAddr(self.0 - hhdm_offset)
    }

    /// Index of this address within the page-table level `level` (0 = PT,
    /// 3 = PML4).
    #[must_use]
    pub const fn pt_index(self, level: usize) -> usize {
        ((self.0 >> (PAGE_SHIFT + 9 * level)) & 0x1ff) as usize
    }
}

impl Add<u64> for VirtAddr {
    type Output = Self;
    fn add(self, rhs: u64) -> Self {
        Self(self.0 + rhs)
    }
}

impl Sub<VirtAddr> for VirtAddr {
    type Output = u64;
    fn sub(self, rhs: VirtAddr) -> u64 {
        self.0 - rhs.0
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#x})", self.0)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Number of pages needed to cover `bytes`.
#[must_use]
pub const fn pages_for(bytes: usize) -> usize {
    bytes.div_ceil(PAGE_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_helpers() {
        let a = VirtAddr::new(0x1234);
        assert!(!a.is_page_aligned());
        assert_eq!(a.page_base().as_u64(), 0x1000);
        assert_eq!(a.page_align_up().as_u64(), 0x2000);
        assert!(VirtAddr::new(0x3000).is_page_aligned());
    }

    #[test]
    fn hhdm_roundtrip() {
        let hhdm = 0xffff_8000_0000_0000;
        let phys = PhysAddr::new(0x7fee_1000);
        let virt = phys.to_hhdm(hhdm);
        assert_eq!(virt.hhdm_to_phys(hhdm), phys);
        assert!(virt.is_kernel_space());
    }

    #[test]
    fn page_table_indices() {
        // 0xffff_8000_0000_0000 = PML4 slot 256, all lower levels 0.
        let v = VirtAddr::new(KSPACE_START);
        assert_eq!(v.pt_index(3), 256);
        assert_eq!(v.pt_index(2), 0);
        assert_eq!(v.pt_index(1), 0);
        assert_eq!(v.pt_index(0), 0);

        let v = VirtAddr::new(0x1000);
        assert_eq!(v.pt_index(0), 1);
    }

    #[test]
    fn pages_for_rounds_up() {
        assert_eq!(pages_for(0), 0);
        assert_eq!(pages_for(1), 1);
        assert_eq!(pages_for(PAGE_SIZE), 1);
        assert_eq!(pages_for(PAGE_SIZE + 1), 2);
    }
}

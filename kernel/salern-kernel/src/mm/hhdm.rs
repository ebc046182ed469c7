//! Higher-half direct map.
//!
//! The boot loader maps all of physical memory at a fixed offset in the
//! upper half; every in-kernel access to raw frames goes through it.

use core::sync::atomic::{AtomicU64, Ordering};

use salern_core::addr::{PhysAddr, VirtAddr};

static OFFSET: AtomicU64 = AtomicU64::new(0);

/// Records the boot-published HHDM offset.
///
/// # Safety
///
/// Must be called once, before any physical-memory access, with the
/// offset the boot loader actually mapped.
pub unsafe fn init(offset: u64) {
    OFFSET.store(offset, Ordering::Release);
}

/// The HHDM offset.
#[must_use]
pub fn offset() -> u64 {
    OFFSET.load(Ordering::Acquire)
}

/// Virtual alias of a physical address.
#[must_use]
pub fn virt(phys: PhysAddr) -> VirtAddr {
    phys.to_hhdm(offset())
}

/// Mutable byte window onto one frame.
#[must_use]
pub fn frame_window(phys: PhysAddr) -> *mut u8 {
    virt(phys).as_mut_ptr()
}

//! Slab-backed kernel heap.
//!
//! `GlobalAlloc` glue: sub-page requests go through the slab size
//! classes, page-and-larger requests take contiguous frames straight
//! from the PMM. Everything is addressed through the HHDM, so freeing
//! translates back to physical trivially.

use core::alloc::{GlobalAlloc, Layout};

use salern_core::addr::{PAGE_SIZE, PhysAddr, VirtAddr};
use salern_core::sync::SpinLock;
use salern_mm::slab::{SlabAllocator, ZeroPolicy};

use crate::mm::{hhdm, pmm};

/// The kernel allocator instance.
#[cfg(target_os = "none")]
#[global_allocator]
static HEAP: KernelHeap = KernelHeap::new();

/// The kernel heap.
pub struct KernelHeap {
    slab: SpinLock<SlabAllocator>,
}

impl KernelHeap {
    const fn new() -> Self {
        Self {
            // The heap zeroes nothing itself; the PMM policy governs.
            slab: SpinLock::new(SlabAllocator::new(ZeroPolicy::Off)),
        }
    }

    /// Effective slab request size honoring the layout's alignment.
    ///
    /// Slab cells sit at multiples of their class size inside a page, so
    /// rounding the size up to the alignment keeps every cell aligned.
    fn slab_size(layout: Layout) -> usize {
        layout.size().max(layout.align())
    }
}

// SAFETY: All state is behind locks; the returned memory is exclusive
// until deallocated.
unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.size() == 0 {
            return layout.align() as *mut u8;
        }
        let size = Self::slab_size(layout);
        if size <= PAGE_SIZE && layout.align() <= PAGE_SIZE {
            let mut slab = self.slab.lock();
            // SAFETY: Pages handed to the slab come from the PMM via the
            // HHDM and live forever (slabs are never returned).
            let ptr = unsafe {
                slab.alloc(size, || pmm::alloc().map(hhdm::frame_window))
            };
            return ptr.unwrap_or(core::ptr::null_mut());
        }

        // Large allocation: whole contiguous frames.
        let pages = size.div_ceil(PAGE_SIZE);
        match pmm::alloc_contiguous(pages) {
            Some(frame) => hhdm::frame_window(frame),
            None => core::ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if layout.size() == 0 {
            return;
        }
        let size = Self::slab_size(layout);
        if size <= PAGE_SIZE && layout.align() <= PAGE_SIZE {
            let mut slab = self.slab.lock();
            // SAFETY: `ptr` came from our alloc with the same layout.
            unsafe { slab.free(ptr, size) };
            return;
        }
        let pages = size.div_ceil(PAGE_SIZE);
        let phys = VirtAddr::new(ptr as u64).hhdm_to_phys(hhdm::offset());
        pmm::free(phys, pages);
    }
}

/// Hands the heap statistics to `sysinfo`.
#[must_use]
pub fn slab_live(size: usize) -> usize {
    HEAP.slab.lock().live_in_class(size)
}

/// Translates a heap pointer back to its physical address.
#[must_use]
pub fn heap_phys(ptr: *const u8) -> PhysAddr {
    VirtAddr::new(ptr as u64).hhdm_to_phys(hhdm::offset())
}

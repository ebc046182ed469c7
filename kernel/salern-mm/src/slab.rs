//! Size-class slab allocator.
//!
//! A fixed array of size classes in 16-byte increments up to one page.
//! Each class threads a singly-linked freelist through its free cells;
//! refilling a class takes one fresh page from the frame source and
//! carves it. Backs the kernel heap for sub-page allocations.

use salern_core::addr::PAGE_SIZE;

/// Size-class granularity in bytes.
pub const SLAB_ALIGN: usize = 16;

/// Number of size classes (16, 32, …, 4096).
pub const SLAB_CLASSES: usize = PAGE_SIZE / SLAB_ALIGN;

/// Zeroing policy, mirroring the PMM configuration knob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZeroPolicy {
    /// Never zero.
    Off,
    /// Zero cells as they are freed.
    OnFree,
    /// Zero cells as they are allocated.
    OnAlloc,
}

/// One size class: a freelist head plus bookkeeping.
struct SizeClass {
    /// Head of the freelist threaded through free cells; null when empty.
    head: *mut usize,
    /// Cells handed out and not yet returned.
    live: usize,
}

/// The slab allocator.
///
/// Not internally locked; the kernel wraps it in a spin lock.
pub struct SlabAllocator {
    classes: [SizeClass; SLAB_CLASSES],
    zero: ZeroPolicy,
}

// SAFETY: The raw freelist pointers are only dereferenced by the owner;
// the kernel serializes access through its lock.
unsafe impl Send for SlabAllocator {}

impl SlabAllocator {
    /// Creates an empty allocator.
    #[must_use]
    pub const fn new(zero: ZeroPolicy) -> Self {
        Self {
            classes: [const {
                SizeClass {
                    head: core::ptr::null_mut(),
                    live: 0,
                }
            }; SLAB_CLASSES],
            zero,
        }
    }

    /// Rounds a request up to its class size. `None` for zero or
    /// larger-than-page requests (those go straight to the PMM).
    #[must_use]
    pub fn class_size(size: usize) -> Option<usize> {
        if size == 0 || size > PAGE_SIZE {
            return None;
        }
        Some(size.div_ceil(SLAB_ALIGN) * SLAB_ALIGN)
    }

    /// Allocates `size` bytes.
    ///
    /// `page_source` supplies one writable page (the HHDM alias of a fresh
    /// frame) when the class freelist is empty.
    ///
    /// # Safety
    ///
    /// Pages returned by `page_source` must be valid, page-aligned,
    /// exclusively owned, and live for the allocator's lifetime.
    pub unsafe fn alloc(
        &mut self,
        size: usize,
        mut page_source: impl FnMut() -> Option<*mut u8>,
    ) -> Option<*mut u8> {
        let class_size = Self::class_size(size)?;
        let idx = class_size / SLAB_ALIGN - 1;
        if self.classes[idx].head.is_null() {
            let page = page_source()?;
            // SAFETY: The page is exclusively ours per the caller contract.
            unsafe { self.refill(idx, class_size, page) };
        }
        let cell = self.classes[idx].head;
        // SAFETY: A non-null head always points at a free cell whose first
        // word is the next link.
        self.classes[idx].head = unsafe { *cell } as *mut usize;
        self.classes[idx].live += 1;
        let ptr = cell.cast::<u8>();
        if self.zero == ZeroPolicy::OnAlloc {
            // SAFETY: The cell is class_size bytes and now exclusively ours.
            unsafe { core::ptr::write_bytes(ptr, 0, class_size) };
        }
        Some(ptr)
    }

    /// Returns a cell to its class.
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`alloc`](Self::alloc) with the same `size`,
    /// and must not be used afterwards.
    pub unsafe fn free(&mut self, ptr: *mut u8, size: usize) {
        let class_size = Self::class_size(size).expect("slab free of non-slab size");
        let idx = class_size / SLAB_ALIGN - 1;
        if self.zero == ZeroPolicy::OnFree {
            // SAFETY: The cell is ours again and class_size bytes long.
            unsafe { core::ptr::write_bytes(ptr, 0, class_size) };
        }
        let cell = ptr.cast::<usize>();
        // SAFETY: Writing the link into the first word of the dead cell.
        unsafe { *cell = self.classes[idx].head as usize };
        self.classes[idx].head = cell;
        self.classes[idx].live -= 1;
    }

    /// Cells currently live in the class serving `size`-byte requests.
    #[must_use]
    pub fn live_in_class(&self, size: usize) -> usize {
        match Self::class_size(size) {
            Some(cs) => self.classes[cs / SLAB_ALIGN - 1].live,
            None => 0,
        }
    }

    /// Threads every cell of a fresh page onto the class freelist.
    ///
    /// # Safety
    ///
    /// `page` must be a valid, exclusively owned, page-sized allocation.
    unsafe fn refill(&mut self, idx: usize, class_size: usize, page: *mut u8) {
        let cells = PAGE_SIZE / class_size;
        for i in (0..cells).rev() {
            // SAFETY: Each cell lies within the page.
            let cell = unsafe { page.add(i * class_size) }.cast::<usize>();
            // SAFETY: Free cells store the next link in their first word.
            unsafe { *cell = self.classes[idx].head as usize };
            self.classes[idx].head = cell;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page_source() -> impl FnMut() -> Option<*mut u8> {
        || {
            let layout = std::alloc::Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap();
            // SAFETY: valid non-zero layout; pages are leaked for the test.
            let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
            assert!(!ptr.is_null());
            Some(ptr)
        }
    }

    #[test]
    fn class_rounding() {
        assert_eq!(SlabAllocator::class_size(1), Some(16));
        assert_eq!(SlabAllocator::class_size(16), Some(16));
        assert_eq!(SlabAllocator::class_size(17), Some(32));
        assert_eq!(SlabAllocator::class_size(PAGE_SIZE), Some(PAGE_SIZE));
        assert_eq!(SlabAllocator::class_size(0), None);
        assert_eq!(SlabAllocator::class_size(PAGE_SIZE + 1), None);
    }

    #[test]
    fn alloc_free_reuses_cells() {
        let mut slab = SlabAllocator::new(ZeroPolicy::Off);
        let mut source = page_source();
        // SAFETY: test pages satisfy the source contract.
        let a = unsafe { slab.alloc(24, &mut source) }.unwrap();
        assert_eq!(slab.live_in_class(24), 1);
        // SAFETY: a was allocated with size 24 above.
        unsafe { slab.free(a, 24) };
        assert_eq!(slab.live_in_class(24), 0);
        // SAFETY: as above.
        let b = unsafe { slab.alloc(24, &mut source) }.unwrap();
        // LIFO freelist: the freed cell comes back first.
        assert_eq!(a, b);
    }

    #[test]
    fn distinct_allocations_do_not_alias() {
        let mut slab = SlabAllocator::new(ZeroPolicy::Off);
        let mut source = page_source();
        let mut ptrs = Vec::new();
        for _ in 0..300 {
            // SAFETY: test pages satisfy the source contract.
            let p = unsafe { slab.alloc(48, &mut source) }.unwrap();
            // Distance check against all previous pointers.
            for &q in &ptrs {
                let d = (p as isize - q as isize).unsigned_abs();
                assert!(d >= 48);
            }
            ptrs.push(p);
        }
    }

    #[test]
    fn zero_on_alloc_clears_recycled_cells() {
        let mut slab = SlabAllocator::new(ZeroPolicy::OnAlloc);
        let mut source = page_source();
        // SAFETY: test pages satisfy the source contract.
        let p = unsafe { slab.alloc(64, &mut source) }.unwrap();
        // Dirty the cell, free it, re-allocate it.
        // SAFETY: p is a live 64-byte cell.
        unsafe { core::ptr::write_bytes(p, 0xAA, 64) };
        // SAFETY: p came from alloc(64).
        unsafe { slab.free(p, 64) };
        // SAFETY: as above.
        let q = unsafe { slab.alloc(64, &mut source) }.unwrap();
        assert_eq!(p, q);
        // First word was the freelist link, rest must be zeroed; with
        // OnAlloc the whole cell is cleared after unlinking.
        let bytes = unsafe { core::slice::from_raw_parts(q, 64) };
        assert!(bytes.iter().all(|&b| b == 0));
    }
}

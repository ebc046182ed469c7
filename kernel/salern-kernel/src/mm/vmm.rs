//! Virtual memory manager.
//!
//! Address-space contexts wrap a page table plus the list of mappings
//! the fault handler consults for lazy population. Forks duplicate user
//! mappings copy-on-write; destruction is deferred to the VMM reaper
//! thread, which returns every user frame and table level to the PMM.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use salern_abi::Errno;
use salern_core::addr::{PAGE_SHIFT, PAGE_SIZE, PhysAddr, VirtAddr};
use salern_core::sync::SpinLock;
use salern_fs::VnodeRef;

use crate::arch::x86_64::mmu::{PageTable, PteFlags};
use crate::arch::x86_64::{lapic, vectors};
use crate::config::{VMM_ANON_START, VMM_REAPER_NOTIFY};
use crate::mm::{hhdm, pmm};
use crate::percpu;
use crate::sync::Condvar;

bitflags::bitflags! {
    /// Options for [`AddressSpace::map`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmmFlags: u32 {
        /// Backing frames come from the PMM; `phys` is ignored.
        const ANONYMOUS = 0x01;
        /// Map the supplied physical range directly (device memory).
        const PHYSICAL  = 0x02;
        /// Frames come from the vnode's pagecache, faulted in lazily.
        const FILE      = 0x04;
        /// Placement must match the hint exactly.
        const EXACT     = 0x08;
        /// Ignore the hint; the VMM picks a base.
        const NOHINT    = 0x10;
        /// The mapping survives fork without copy-on-write.
        const SHARED    = 0x20;
        /// Unmap anything already in the range first.
        const REPLACE   = 0x40;
        /// Populate frames eagerly instead of on first fault.
        const ALLOCATE  = 0x80;
    }
}

/// One recorded mapping in an address space.
#[derive(Clone)]
struct Mapping {
    start: VirtAddr,
    pages: usize,
    flags: VmmFlags,
    prot: PteFlags,
    /// Backing file for `FILE` mappings.
    vnode: Option<VnodeRef>,
    /// Byte offset of the mapping within the file.
    file_off: u64,
}

impl Mapping {
    fn end(&self) -> VirtAddr {
        self.start + (self.pages << PAGE_SHIFT) as u64
    }

    fn contains(&self, addr: VirtAddr) -> bool {
        addr >= self.start && addr < self.end()
    }

    fn overlaps(&self, start: VirtAddr, pages: usize) -> bool {
        let end = start + ((pages << PAGE_SHIFT) as u64);
        start < self.end() && self.start < end
    }
}

struct SpaceInner {
    mappings: Vec<Mapping>,
    /// Bump pointer for hint-less placements.
    next_anon: u64,
    /// Anonymous pages currently materialized.
    anon_pages: usize,
}

/// An address-space context.
pub struct AddressSpace {
    pt: PageTable,
    inner: SpinLock<SpaceInner>,
    /// Kernel space is never reaped.
    is_kernel: bool,
}

/// Queue of dead address spaces for the reaper.
static REAP_QUEUE: SpinLock<Vec<Arc<AddressSpace>>> = SpinLock::new(Vec::new());
static REAPER_CV: Condvar = Condvar::new();
static REAPED: AtomicUsize = AtomicUsize::new(0);

impl AddressSpace {
    /// Wraps the boot page table as the kernel's own context.
    #[must_use]
    pub fn kernel() -> Arc<Self> {
        Arc::new(Self {
            pt: PageTable::from_root(crate::arch::x86_64::mmu::read_cr3()),
            inner: SpinLock::new(SpaceInner {
                mappings: Vec::new(),
                next_anon: VMM_ANON_START,
                anon_pages: 0,
            }),
            is_kernel: true,
        })
    }

    /// Creates an empty user context.
    pub fn new() -> Result<Arc<Self>, Errno> {
        let pt = PageTable::new().ok_or(Errno::Enomem)?;
        Ok(Arc::new(Self {
            pt,
            inner: SpinLock::new(SpaceInner {
                mappings: Vec::new(),
                next_anon: VMM_ANON_START,
                anon_pages: 0,
            }),
            is_kernel: false,
        }))
    }

    /// The root page table.
    #[must_use]
    pub fn table(&self) -> &PageTable {
        &self.pt
    }

    /// Loads this context on the calling CPU.
    pub fn switch(&self) {
        self.pt.switch();
    }

    /// Duplicates the context for `fork`: user pages become shared
    /// read-only copy-on-write in both parent and child.
    pub fn duplicate(&self) -> Result<Arc<Self>, Errno> {
        let inner = self.inner.lock();
        let pt = self.pt.duplicate_cow().ok_or(Errno::Enomem)?;
        let child = Arc::new(Self {
            pt,
            inner: SpinLock::new(SpaceInner {
                mappings: inner.mappings.clone(),
                next_anon: inner.next_anon,
                anon_pages: inner.anon_pages,
            }),
            is_kernel: false,
        });
        drop(inner);
        shootdown_all();
        Ok(child)
    }

    /// Establishes a mapping.
    ///
    /// Returns the chosen base address. See [`VmmFlags`] for the option
    /// semantics; `prot` carries the architectural permission bits.
    pub fn map(
        &self,
        hint: VirtAddr,
        phys: PhysAddr,
        len: usize,
        flags: VmmFlags,
        prot: PteFlags,
        vnode: Option<VnodeRef>,
        file_off: u64,
    ) -> Result<VirtAddr, Errno> {
        if len == 0 {
            return Err(Errno::Einval);
        }
        let pages = len.div_ceil(PAGE_SIZE);
        let mut inner = self.inner.lock();

        let start = if flags.contains(VmmFlags::NOHINT) || hint.as_u64() == 0 {
            if flags.contains(VmmFlags::EXACT) {
                // A fixed placement needs an address to fix to.
                return Err(Errno::Einval);
            }
            let base = VirtAddr::new(inner.next_anon);
            inner.next_anon += (pages << PAGE_SHIFT) as u64;
            base
        } else {
            hint.page_base()
        };

        if flags.contains(VmmFlags::REPLACE) {
            Self::unmap_range_locked(&self.pt, &mut inner, start, pages);
        } else if inner.mappings.iter().any(|m| m.overlaps(start, pages)) {
            if flags.contains(VmmFlags::EXACT) {
                return Err(Errno::Eexist);
            }
            // Non-exact collision: fall back to a fresh region.
            let base = VirtAddr::new(inner.next_anon);
            inner.next_anon += (pages << PAGE_SHIFT) as u64;
            return self.map_at(&mut inner, base, phys, pages, flags, prot, vnode, file_off);
        }

        self.map_at(&mut inner, start, phys, pages, flags, prot, vnode, file_off)
    }

    #[allow(clippy::too_many_arguments)]
    fn map_at(
        &self,
        inner: &mut SpaceInner,
        start: VirtAddr,
        phys: PhysAddr,
        pages: usize,
        flags: VmmFlags,
        prot: PteFlags,
        vnode: Option<VnodeRef>,
        file_off: u64,
    ) -> Result<VirtAddr, Errno> {
        if flags.contains(VmmFlags::PHYSICAL) {
            // Direct mapping: no allocation, never COW, never freed.
            for i in 0..pages {
                let off = (i << PAGE_SHIFT) as u64;
                self.pt
                    .map(start + off, phys + off, prot | PteFlags::NOCOPY)
                    .ok_or(Errno::Enomem)?;
            }
        } else if flags.contains(VmmFlags::ALLOCATE) {
            for i in 0..pages {
                let frame = pmm::alloc_zeroed().ok_or(Errno::Enomem)?;
                let off = (i << PAGE_SHIFT) as u64;
                self.pt.map(start + off, frame, prot).ok_or(Errno::Enomem)?;
                inner.anon_pages += 1;
            }
        }
        // Lazy ANONYMOUS / FILE ranges only get a mapping record; the
        // fault handler materializes pages.

        inner.mappings.push(Mapping {
            start,
            pages,
            flags,
            prot,
            vnode,
            file_off,
        });
        Ok(start)
    }

    /// Removes mappings covering `[start, start + len)`.
    pub fn unmap(&self, start: VirtAddr, len: usize) -> Result<(), Errno> {
        if !start.is_page_aligned() || len == 0 {
            return Err(Errno::Einval);
        }
        let pages = len.div_ceil(PAGE_SIZE);
        let mut inner = self.inner.lock();
        Self::unmap_range_locked(&self.pt, &mut inner, start, pages);
        drop(inner);
        shootdown_all();
        Ok(())
    }

    fn unmap_range_locked(
        pt: &PageTable,
        inner: &mut SpaceInner,
        start: VirtAddr,
        pages: usize,
    ) {
        for i in 0..pages {
            let virt = start + ((i << PAGE_SHIFT) as u64);
            if let Some((frame, flags)) = pt.unmap(virt) {
                release_frame(frame, flags);
                if !flags.contains(PteFlags::NOCOPY) {
                    inner.anon_pages = inner.anon_pages.saturating_sub(1);
                }
            }
        }
        PageTable::invalidate(start, pages);
        // Trim or drop the bookkeeping records. Partial unmaps keep the
        // record edges; a hole simply re-faults as unmapped.
        inner.mappings.retain(|m| !m.overlaps(start, pages));
    }

    /// Page-fault entry. Returns `true` if the fault was resolved.
    pub fn handle_fault(&self, addr: VirtAddr, write: bool) -> bool {
        if addr.is_kernel_space() && !self.is_kernel {
            return false;
        }
        let page = addr.page_base();

        // Copy-on-write?
        if let Some((frame, flags)) = self.pt.translate(page) {
            if flags.contains(PteFlags::WRITE) {
                // Present and writable yet faulted: a real bug.
                return false;
            }
            if write && flags.is_cow() {
                return self.resolve_cow(page, frame, flags);
            }
            if !write {
                // Present, readable, read fault: spurious (TLB race).
                PageTable::invalidate(page, 1);
                return true;
            }
            return false;
        }

        // Lazy population.
        let inner = self.inner.lock();
        let Some(mapping) = inner.mappings.iter().find(|m| m.contains(page)).cloned() else {
            return false;
        };
        drop(inner);

        if mapping.flags.contains(VmmFlags::ANONYMOUS) {
            let Some(frame) = pmm::alloc_zeroed() else {
                return false;
            };
            if self.pt.map(page, frame, mapping.prot).is_none() {
                pmm::free(frame, 1);
                return false;
            }
            self.inner.lock().anon_pages += 1;
            return true;
        }

        if mapping.flags.contains(VmmFlags::FILE) {
            let Some(vnode) = mapping.vnode.as_ref() else {
                return false;
            };
            let page_index =
                (mapping.file_off >> PAGE_SHIFT) + ((page - mapping.start) >> PAGE_SHIFT);
            let Ok(frame) = vnode.ops().mmap_frame(vnode, page_index) else {
                return false;
            };
            // Pagecache frames are owned by the vnode, not the context.
            let mut prot = mapping.prot | PteFlags::NOCOPY;
            if !mapping.flags.contains(VmmFlags::SHARED) {
                // Private file pages become anonymous on first write.
                prot.remove(PteFlags::WRITE);
                prot.insert(PteFlags::PRIVATE);
            }
            return self.pt.map(page, frame, prot).is_some();
        }

        false
    }

    /// Breaks a COW share: fresh frame, copy, install writable.
    fn resolve_cow(&self, page: VirtAddr, old: PhysAddr, flags: PteFlags) -> bool {
        let shared_file = flags.contains(PteFlags::NOCOPY);
        if !shared_file && pmm::shares(old) == 0 {
            // Last reference: take ownership in place.
            let mut new_flags = flags;
            new_flags.insert(PteFlags::WRITE);
            new_flags.remove(PteFlags::PRIVATE);
            self.pt.chflags(page, new_flags);
            PageTable::invalidate(page, 1);
            return true;
        }

        let Some(fresh) = pmm::alloc() else {
            return false;
        };
        // SAFETY: Both frames are mapped in the HHDM; `old` stays valid
        // because we still hold a share on it.
        unsafe {
            core::ptr::copy_nonoverlapping(
                hhdm::frame_window(old),
                hhdm::frame_window(fresh),
                PAGE_SIZE,
            );
        }
        let mut new_flags = flags;
        new_flags.insert(PteFlags::WRITE);
        new_flags.remove(PteFlags::PRIVATE | PteFlags::NOCOPY);
        if self.pt.map(page, fresh, new_flags).is_none() {
            pmm::free(fresh, 1);
            return false;
        }
        PageTable::invalidate(page, 1);
        if !shared_file {
            pmm::share_dec(old);
        }
        true
    }

    /// Count of materialized anonymous pages.
    #[must_use]
    pub fn anon_pages(&self) -> usize {
        self.inner.lock().anon_pages
    }

    /// Hands the context to the reaper. Call when the owning process
    /// exits; the reaper frees user memory off the exit path.
    pub fn destroy(self: Arc<Self>) {
        debug_assert!(!self.is_kernel, "destroying the kernel context");
        let queued = {
            let mut queue = REAP_QUEUE.lock();
            queue.push(self);
            queue.len()
        };
        if queued >= VMM_REAPER_NOTIFY {
            // The reaper is not keeping up with exits.
            crate::kdebug!("vmm: reap queue at {queued}");
        }
        REAPER_CV.signal();
    }

    /// Immediate teardown, used by the reaper (and execve, which must
    /// not leave the old image mapped while it builds the new one).
    pub fn teardown(&self) {
        self.pt.for_each_user(|_virt, entry| {
            let value = *entry;
            let frame = PhysAddr::new(value & 0x000f_ffff_ffff_f000);
            let flags = PteFlags::from_bits_truncate(value & !0x000f_ffff_ffff_f000);
            *entry = 0;
            release_frame(frame, flags);
        });
        self.pt.destroy_user_levels();
        self.inner.lock().mappings.clear();
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        if !self.is_kernel {
            pmm::free(self.pt.root(), 1);
        }
    }
}

/// Frees a frame unmapped from a user context, honoring share counts
/// and borrowed (`NOCOPY`) frames.
fn release_frame(frame: PhysAddr, flags: PteFlags) {
    if flags.contains(PteFlags::NOCOPY) {
        return;
    }
    if pmm::shares(frame) > 0 {
        pmm::share_dec(frame);
    } else {
        pmm::free(frame, 1);
    }
}

/// Invalidates the whole TLB on every other CPU (and reloads locally).
fn shootdown_all() {
    shootdown(VirtAddr::zero(), u64::MAX);
}

/// One shooter at a time, so two CPUs can never sit in each other's
/// ack loops with interrupts masked.
static SHOOTDOWN_LOCK: SpinLock<()> = SpinLock::new(());

/// Cross-CPU TLB invalidation of a page range.
///
/// The ack wait is bounded: a CPU that sits with interrupts masked for
/// that long has bigger problems, and a stale TLB entry is preferable
/// to a livelock.
pub fn shootdown(addr: VirtAddr, pages: u64) {
    if percpu::cpu_count() <= 1 {
        return;
    }
    let _shooter = SHOOTDOWN_LOCK.lock();
    let here = percpu::cpu_get();
    percpu::for_each_cpu(|cpu| {
        if cpu.cpu_id == here.cpu_id {
            return;
        }
        let _guard = cpu.shootdown.lock.lock();
        cpu.shootdown.addr.store(addr.as_u64(), Ordering::Release);
        cpu.shootdown.pages.store(pages, Ordering::Release);
        cpu.shootdown.pending.fetch_add(1, Ordering::AcqRel);
        lapic::send_ipi(
            cpu.lapic_id.load(Ordering::Relaxed),
            vectors::IPI_SHOOTDOWN,
        );
        let mut spins = 0u64;
        while cpu.shootdown.pending.load(Ordering::Acquire) != 0 {
            crate::arch::cpu_relax();
            spins += 1;
            if spins == 100_000_000 {
                crate::kurgent!("vmm: cpu {} ignored a tlb shootdown", cpu.cpu_id);
                break;
            }
        }
    });
}

/// The VMM reaper: frees dead address spaces off the exit path.
pub extern "C" fn reaper_thread(_arg: usize) -> ! {
    loop {
        let dead = {
            // Classic condvar shape: re-check the predicate after every
            // wakeup (signals are batched, wakeups may be spurious).
            let mut queue = REAP_QUEUE.lock();
            loop {
                if let Some(space) = queue.pop() {
                    break space;
                }
                REAPER_CV.wait(queue);
                queue = REAP_QUEUE.lock();
            }
        };
        dead.teardown();
        REAPED.fetch_add(1, Ordering::Relaxed);
        crate::kdebug!(
            "vmm: reaped address space ({} total)",
            REAPED.load(Ordering::Relaxed)
        );
        drop(dead);
    }
}

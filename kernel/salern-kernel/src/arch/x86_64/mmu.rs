//! 4-level page-table management.
//!
//! Table frames come from the PMM and are edited through the HHDM. The
//! upper (kernel) half of every root is shared: a new table copies the
//! 256 kernel PML4 slots from the boot template and user teardown never
//! touches them.

use salern_core::addr::{PAGE_SHIFT, PAGE_SIZE, PhysAddr, VirtAddr};

use crate::mm::{hhdm, pmm};

bitflags::bitflags! {
    /// Page-table entry flags, hardware plus the OS-reserved bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u64 {
        /// Mapping is live.
        const PRESENT = 1 << 0;
        /// Writable.
        const WRITE = 1 << 1;
        /// User-accessible.
        const USER = 1 << 2;
        /// Write-through caching.
        const WRITETHROUGH = 1 << 3;
        /// Cache disable (device memory).
        const NOCACHE = 1 << 4;
        /// Set by hardware on access.
        const ACCESSED = 1 << 5;
        /// Set by hardware on write.
        const DIRTY = 1 << 6;
        /// 2 MiB / 1 GiB leaf at a directory level.
        const HUGE = 1 << 7;
        /// Survives CR3 reloads.
        const GLOBAL = 1 << 8;
        /// OS: mapping is shared across forks.
        const SHARED = 1 << 9;
        /// OS: private copy-on-write page.
        const PRIVATE = 1 << 10;
        /// OS: frame is borrowed (device/boot memory), never freed or
        /// duplicated with the address space.
        const NOCOPY = 1 << 11;
        /// Not executable.
        const NOEXEC = 1 << 63;
    }
}

impl PteFlags {
    /// Returns whether these flags mark a copy-on-write page.
    #[must_use]
    pub fn is_cow(self) -> bool {
        self.contains(Self::PRIVATE) && !self.contains(Self::WRITE)
    }

    /// Returns whether pages with these flags may be executed.
    #[must_use]
    pub fn is_executable(self) -> bool {
        !self.contains(Self::NOEXEC)
    }
}

/// Physical-address bits of a PTE.
const ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

/// PML4 slot where the kernel half begins.
const KERNEL_SLOT: usize = 256;

/// Template kernel-half PML4 entries, captured from the boot page table.
static mut KERNEL_TEMPLATE: [u64; 256] = [0; 256];

/// Captures the kernel half of the current (bootloader-built) root so
/// later [`PageTable::new`] calls can share it.
///
/// # Safety
///
/// Must run once on the BSP before any `PageTable::new`.
pub unsafe fn capture_kernel_template() {
    let root = read_cr3();
    let table = table(root);
    // SAFETY: Single early-boot writer.
    unsafe {
        let tpl = &mut *core::ptr::addr_of_mut!(KERNEL_TEMPLATE);
        tpl.copy_from_slice(&table[KERNEL_SLOT..]);
    }
}

/// Reads the current root table address.
#[must_use]
pub fn read_cr3() -> PhysAddr {
    let value: u64;
    // SAFETY: Reading CR3 has no side effects.
    unsafe { core::arch::asm!("mov {}, cr3", out(reg) value, options(nomem, nostack)) };
    PhysAddr::new(value & ADDR_MASK)
}

fn table(frame: PhysAddr) -> &'static [u64; 512] {
    // SAFETY: Table frames are PMM-owned and HHDM-mapped.
    unsafe { &*frame.to_hhdm(hhdm::offset()).as_ptr() }
}

#[allow(clippy::mut_from_ref)]
fn table_mut(frame: PhysAddr) -> &'static mut [u64; 512] {
    // SAFETY: Callers hold the owning address-space lock; aliasing is
    // prevented at that level.
    unsafe { &mut *frame.to_hhdm(hhdm::offset()).as_mut_ptr() }
}

/// A 4-level page table, identified by its root frame.
#[derive(Debug, Clone, Copy)]
pub struct PageTable {
    root: PhysAddr,
}

impl PageTable {
    /// Allocates a fresh root with the shared kernel half installed.
    pub fn new() -> Option<Self> {
        let root = pmm::alloc_zeroed()?;
        let slots = table_mut(root);
        // SAFETY: The template was captured during early boot and is
        // read-only afterwards.
        let tpl = unsafe { &*core::ptr::addr_of!(KERNEL_TEMPLATE) };
        slots[KERNEL_SLOT..].copy_from_slice(tpl);
        Some(Self { root })
    }

    /// Wraps an existing root (the boot page table).
    #[must_use]
    pub const fn from_root(root: PhysAddr) -> Self {
        Self { root }
    }

    /// The root frame, as loaded into CR3.
    #[must_use]
    pub const fn root(&self) -> PhysAddr {
        self.root
    }

    /// Loads this table on the calling CPU.
    pub fn switch(&self) {
        // SAFETY: The root is a valid page table with the kernel half
        // mapped; the kernel survives the switch.
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) self.root.as_u64(), options(nostack));
        }
    }

    /// Maps one 4 KiB page. Intermediate levels are allocated on demand.
    ///
    /// Fails with `None` on PMM exhaustion. Mapping over a present entry
    /// replaces it silently; callers decide replace semantics.
    pub fn map(&self, virt: VirtAddr, phys: PhysAddr, flags: PteFlags) -> Option<()> {
        let leaf = self.walk_alloc(virt)?;
        leaf[virt.pt_index(0)] = (phys.as_u64() & ADDR_MASK) | flags.bits() | PteFlags::PRESENT.bits();
        Some(())
    }

    /// Unmaps one page, returning the old frame if one was mapped.
    pub fn unmap(&self, virt: VirtAddr) -> Option<(PhysAddr, PteFlags)> {
        let leaf = self.walk(virt)?;
        let entry = &mut table_mut(leaf)[virt.pt_index(0)];
        let value = *entry;
        if value & PteFlags::PRESENT.bits() == 0 {
            return None;
        }
        *entry = 0;
        Some((
            PhysAddr::new(value & ADDR_MASK),
            PteFlags::from_bits_truncate(value & !ADDR_MASK),
        ))
    }

    /// Rewrites the flags of an existing mapping.
    pub fn chflags(&self, virt: VirtAddr, flags: PteFlags) -> Option<()> {
        let leaf = self.walk(virt)?;
        let entry = &mut table_mut(leaf)[virt.pt_index(0)];
        if *entry & PteFlags::PRESENT.bits() == 0 {
            return None;
        }
        *entry = (*entry & ADDR_MASK) | flags.bits() | PteFlags::PRESENT.bits();
        Some(())
    }

    /// Translates a virtual address.
    #[must_use]
    pub fn translate(&self, virt: VirtAddr) -> Option<(PhysAddr, PteFlags)> {
        let leaf = self.walk(virt)?;
        let value = table(leaf)[virt.pt_index(0)];
        if value & PteFlags::PRESENT.bits() == 0 {
            return None;
        }
        Some((
            PhysAddr::new(value & ADDR_MASK),
            PteFlags::from_bits_truncate(value & !ADDR_MASK),
        ))
    }

    /// Invalidates `count` pages starting at `virt` on the calling CPU.
    pub fn invalidate(virt: VirtAddr, count: usize) {
        for i in 0..count {
            let addr = virt.as_u64() + ((i as u64) << PAGE_SHIFT);
            // SAFETY: invlpg only drops a TLB entry.
            unsafe {
                core::arch::asm!("invlpg [{}]", in(reg) addr, options(nostack));
            }
        }
    }

    /// Produces a copy-on-write duplicate for `fork`.
    ///
    /// User leaf pages lose their write bit and gain `PRIVATE` in both
    /// tables; `SHARED` and `NOCOPY` mappings keep their flags and are
    /// aliased. Frame share counts go up for every page now referenced
    /// twice.
    pub fn duplicate_cow(&self) -> Option<Self> {
        let child = Self::new()?;
        let mut ok = true;
        self.for_each_user(|virt, entry_ref| {
            if !ok {
                return;
            }
            let value = *entry_ref;
            let phys = PhysAddr::new(value & ADDR_MASK);
            let mut flags = PteFlags::from_bits_truncate(value & !ADDR_MASK);
            if !flags.contains(PteFlags::SHARED) && !flags.contains(PteFlags::NOCOPY) {
                // Demote to COW in the parent as well.
                flags.remove(PteFlags::WRITE);
                flags.insert(PteFlags::PRIVATE);
                *entry_ref = (value & ADDR_MASK) | flags.bits();
            }
            if !flags.contains(PteFlags::NOCOPY) {
                pmm::share_inc(phys);
            }
            if child.map(virt, phys, flags).is_none() {
                ok = false;
            }
        });
        if !ok {
            return None;
        }
        // The parent's demotions must reach the TLB.
        self.switch_if_current();
        Some(child)
    }

    /// Walks every present user leaf entry, passing a mutable reference.
    pub fn for_each_user(&self, mut f: impl FnMut(VirtAddr, &mut u64)) {
        let root = table_mut(self.root);
        for i4 in 0..KERNEL_SLOT {
            let Some(l3) = entry_table(root[i4]) else { continue };
            for i3 in 0..512 {
                let Some(l2) = entry_table(table_mut(l3)[i3]) else { continue };
                for i2 in 0..512 {
                    let Some(l1) = entry_table(table_mut(l2)[i2]) else { continue };
                    for i1 in 0..512 {
                        let entry = &mut table_mut(l1)[i1];
                        if *entry & PteFlags::PRESENT.bits() != 0 {
                            let virt = ((i4 as u64) << 39)
                                | ((i3 as u64) << 30)
                                | ((i2 as u64) << 21)
                                | ((i1 as u64) << 12);
                            f(VirtAddr::new(virt), entry);
                        }
                    }
                }
            }
        }
    }

    /// Frees every user page-table level bottom-up and clears the user
    /// PML4 slots. The root itself stays with the owning context.
    ///
    /// Leaf frames are the VMM reaper's business and must be released
    /// (or kept, for `NOCOPY`) before calling this.
    pub fn destroy_user_levels(&self) {
        let root = table_mut(self.root);
        for i4 in 0..KERNEL_SLOT {
            let Some(l3) = entry_table(root[i4]) else { continue };
            for i3 in 0..512 {
                let Some(l2) = entry_table(table(l3)[i3]) else { continue };
                for i2 in 0..512 {
                    if let Some(l1) = entry_table(table(l2)[i2]) {
                        pmm::free(l1, 1);
                    }
                }
                pmm::free(l2, 1);
            }
            pmm::free(l3, 1);
            root[i4] = 0;
        }
    }

    /// Reloads CR3 if this table is the active one (flushes the TLB).
    fn switch_if_current(&self) {
        if read_cr3() == self.root {
            self.switch();
        }
    }

    /// Returns the leaf (L1) table covering `virt`, if all levels exist.
    fn walk(&self, virt: VirtAddr) -> Option<PhysAddr> {
        let mut cur = self.root;
        for level in (1..4).rev() {
            let entry = table(cur)[virt.pt_index(level)];
            cur = entry_table(entry)?;
        }
        Some(cur)
    }

    /// Like [`walk`](Self::walk) but allocates missing levels.
    fn walk_alloc(&self, virt: VirtAddr) -> Option<&'static mut [u64; 512]> {
        let mut cur = self.root;
        for level in (1..4).rev() {
            let slot = &mut table_mut(cur)[virt.pt_index(level)];
            if *slot & PteFlags::PRESENT.bits() == 0 {
                let fresh = pmm::alloc_zeroed()?;
                // Intermediate entries are maximally permissive; the leaf
                // decides the real protection.
                *slot = fresh.as_u64()
                    | (PteFlags::PRESENT | PteFlags::WRITE | PteFlags::USER).bits();
            }
            cur = PhysAddr::new(*slot & ADDR_MASK);
        }
        Some(table_mut(cur))
    }
}

/// Decodes a non-leaf entry into the next level's table address.
fn entry_table(entry: u64) -> Option<PhysAddr> {
    if entry & PteFlags::PRESENT.bits() == 0 || entry & PteFlags::HUGE.bits() != 0 {
        return None;
    }
    Some(PhysAddr::new(entry & ADDR_MASK))
}

/// Reads the faulting address after a page fault.
#[must_use]
pub fn fault_address() -> VirtAddr {
    let value: u64;
    // SAFETY: Reading CR2 has no side effects.
    unsafe { core::arch::asm!("mov {}, cr2", out(reg) value, options(nomem, nostack)) };
    VirtAddr::new(value)
}

/// Number of 4 KiB pages covering `bytes`.
#[must_use]
pub const fn pages(bytes: usize) -> usize {
    bytes.div_ceil(PAGE_SIZE)
}

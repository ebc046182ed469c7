//! Global descriptor table and TSS.
//!
//! One GDT + TSS pair per CPU. Layout (fixed — the syscall/interrupt
//! paths and the user-mode iretq frames hard-code these selectors):
//! null, kernel code `0x08`, kernel data `0x10`, user data `0x18`,
//! user code `0x20`, TSS `0x28`.

use core::mem::size_of;

/// Kernel code selector.
pub const KERNEL_CODE: u16 = 0x08;
/// Kernel data selector.
pub const KERNEL_DATA: u16 = 0x10;
/// User data selector with RPL 3.
pub const USER_DATA: u16 = 0x18 | 3;
/// User code selector with RPL 3.
pub const USER_CODE: u16 = 0x20 | 3;
/// TSS selector.
pub const TSS_SEL: u16 = 0x28;

/// 64-bit task state segment.
#[repr(C, packed)]
pub struct Tss {
    _rsvd0: u32,
    /// Stack for ring-0 entry from ring 3.
    pub rsp0: u64,
    rsp1: u64,
    rsp2: u64,
    _rsvd1: u64,
    /// Interrupt stacks (unused; RSP0 is enough for this design).
    ist: [u64; 7],
    _rsvd2: u64,
    _rsvd3: u16,
    iopb_offset: u16,
}

static_assertions::const_assert_eq!(size_of::<Tss>(), 104);

impl Tss {
    const fn new() -> Self {
        Self {
            _rsvd0: 0,
            rsp0: 0,
            rsp1: 0,
            rsp2: 0,
            _rsvd1: 0,
            ist: [0; 7],
            _rsvd2: 0,
            _rsvd3: 0,
            iopb_offset: size_of::<Tss>() as u16,
        }
    }
}

/// A per-CPU GDT with its TSS.
#[repr(C, align(16))]
pub struct Gdt {
    entries: [u64; 7],
    tss: Tss,
}

/// 64-bit code segment: present, code, long mode.
const KCODE_DESC: u64 = 0x00af_9b00_0000_ffff;
/// Data segment: present, writable.
const KDATA_DESC: u64 = 0x00af_9300_0000_ffff;
/// User data (DPL 3).
const UDATA_DESC: u64 = 0x00af_f300_0000_ffff;
/// User code (DPL 3, long mode).
const UCODE_DESC: u64 = 0x00af_fb00_0000_ffff;

impl Gdt {
    /// Creates a GDT with an empty TSS.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: [0, KCODE_DESC, KDATA_DESC, UDATA_DESC, UCODE_DESC, 0, 0],
            tss: Tss::new(),
        }
    }

    /// Sets the ring-0 entry stack in the TSS.
    pub fn set_rsp0(&mut self, rsp0: u64) {
        self.tss.rsp0 = rsp0;
    }

    /// Loads this GDT, reloads the segment registers, and loads the TSS.
    ///
    /// # Safety
    ///
    /// `self` must live for the CPU's lifetime (per-CPU static or leaked).
    pub unsafe fn load(&mut self) {
        // Fill in the 16-byte TSS descriptor now that the address is final.
        let base = core::ptr::addr_of!(self.tss) as u64;
        let limit = (size_of::<Tss>() - 1) as u64;
        let low = (limit & 0xffff)
            | ((base & 0xff_ffff) << 16)
            | (0x89u64 << 40) // present, type = available 64-bit TSS
            | ((limit & 0xf_0000) << 32)
            | ((base & 0xff00_0000) << 32);
        let high = base >> 32;
        self.entries[5] = low;
        self.entries[6] = high;

        #[repr(C, packed)]
        struct Gdtr {
            limit: u16,
            base: u64,
        }
        let gdtr = Gdtr {
            limit: (size_of::<[u64; 7]>() - 1) as u16,
            base: self.entries.as_ptr() as u64,
        };

        // SAFETY: The descriptor table is valid and lives long enough per
        // the caller contract; the selector constants match the layout.
        unsafe {
            core::arch::asm!(
                "lgdt [{gdtr}]",
                // Reload CS via a far return.
                "push {kcode}",
                "lea {tmp}, [rip + 2f]",
                "push {tmp}",
                "retfq",
                "2:",
                "mov ds, {kdata:x}",
                "mov es, {kdata:x}",
                "mov ss, {kdata:x}",
                "xor eax, eax",
                "mov fs, ax",
                "mov gs, ax",
                "ltr {tss:x}",
                gdtr = in(reg) &gdtr,
                kcode = const KERNEL_CODE as u64,
                kdata = in(reg) u64::from(KERNEL_DATA),
                tss = in(reg) u64::from(TSS_SEL),
                tmp = out(reg) _,
                out("rax") _,
            );
        }
    }
}

impl Default for Gdt {
    fn default() -> Self {
        Self::new()
    }
}

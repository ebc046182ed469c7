//! Interrupt descriptor table and entry stubs.
//!
//! All 256 vectors funnel through assembly stubs that build a full
//! [`CpuContext`](super::context::CpuContext) trap frame and call
//! [`crate::interrupt::dispatch`]. Exceptions that push a hardware error
//! code are handled by omitting the dummy push in their stubs; everything
//! else is uniform.

use core::mem::size_of;

use super::gdt;

// The stub array and the common entry/exit path. `.altmacro` + `.rept`
// generate one short stub per vector and a table of their addresses.
core::arch::global_asm!(
    r#"
.altmacro

.macro isr_stub vec
isr_stub_\vec:
    // CPU pushed an error code only for these exceptions.
    .if (\vec == 8) || (\vec == 10) || (\vec == 11) || (\vec == 12) || (\vec == 13) || (\vec == 14) || (\vec == 17) || (\vec == 21)
    .else
    push 0
    .endif
    push \vec
    jmp {isr_common}
.endm

.macro isr_table_entry vec
    .quad isr_stub_\vec
.endm

.section .text
.set vec, 0
.rept 256
    isr_stub %vec
    .set vec, vec + 1
.endr

{isr_common}:
    // Build the CpuContext GPR block.
    push rax
    push rbx
    push rcx
    push rdx
    push rsi
    push rdi
    push rbp
    push r8
    push r9
    push r10
    push r11
    push r12
    push r13
    push r14
    push r15

    // swapgs iff we came from ring 3 (CS.RPL at offset 144).
    test qword ptr [rsp + 144], 3
    jz 1f
    swapgs
1:
    mov rdi, [rsp + 120]    // vector
    mov rsi, rsp            // &mut CpuContext
    cld
    call {dispatch}

    test qword ptr [rsp + 144], 3
    jz 2f
    swapgs
2:
    pop r15
    pop r14
    pop r13
    pop r12
    pop r11
    pop r10
    pop r9
    pop r8
    pop rbp
    pop rdi
    pop rsi
    pop rdx
    pop rcx
    pop rbx
    pop rax
    add rsp, 16             // vector + error code
    iretq

.section .rodata
.global ISR_STUB_TABLE
.balign 8
ISR_STUB_TABLE:
.set vec, 0
.rept 256
    isr_table_entry %vec
    .set vec, vec + 1
.endr
.section .text
"#,
    isr_common = sym isr_common_symbol,
    dispatch = sym crate::interrupt::dispatch_entry,
);

unsafe extern "C" {
    /// Addresses of the 256 per-vector entry stubs.
    static ISR_STUB_TABLE: [u64; 256];

    /// Label only; never called from Rust.
    fn isr_common_symbol();
}

/// One 16-byte IDT gate descriptor.
#[derive(Clone, Copy)]
#[repr(C)]
struct IdtEntry {
    offset_low: u16,
    selector: u16,
    options: u16,
    offset_mid: u16,
    offset_high: u32,
    _rsvd: u32,
}

static_assertions::const_assert_eq!(size_of::<IdtEntry>(), 16);

impl IdtEntry {
    const fn missing() -> Self {
        Self {
            offset_low: 0,
            selector: 0,
            options: 0,
            offset_mid: 0,
            offset_high: 0,
            _rsvd: 0,
        }
    }

    fn set(&mut self, handler: u64, dpl: u16) {
        self.offset_low = handler as u16;
        self.selector = gdt::KERNEL_CODE;
        // Present, 64-bit interrupt gate (interrupts auto-masked), DPL.
        self.options = 0x8e00 | (dpl << 13);
        self.offset_mid = (handler >> 16) as u16;
        self.offset_high = (handler >> 32) as u32;
    }
}

/// The interrupt descriptor table, shared by every CPU.
#[repr(C, align(16))]
struct Idt {
    entries: [IdtEntry; 256],
}

static mut IDT: Idt = Idt {
    entries: [IdtEntry::missing(); 256],
};

/// Populates the IDT from the stub table and loads it on this CPU.
///
/// The syscall gate is the single user-invokable vector (DPL 3).
///
/// # Safety
///
/// Must run with interrupts masked; the GDT must already be loaded.
pub unsafe fn init() {
    // SAFETY: Single writer during early boot (BSP), then read-only; APs
    // only call lidt on the finished table.
    unsafe {
        let idt = &mut *core::ptr::addr_of_mut!(IDT);
        for (vec, entry) in idt.entries.iter_mut().enumerate() {
            let dpl = if vec == usize::from(super::vectors::SYSCALL) {
                3
            } else {
                0
            };
            entry.set(ISR_STUB_TABLE[vec], dpl);
        }
    }
    // SAFETY: The table is fully initialized above.
    unsafe { load() };
}

/// Loads the (already initialized) IDT on the calling CPU.
///
/// # Safety
///
/// [`init`] must have completed on the BSP first.
pub unsafe fn load() {
    #[repr(C, packed)]
    struct Idtr {
        limit: u16,
        base: u64,
    }
    let idtr = Idtr {
        limit: (size_of::<Idt>() - 1) as u16,
        base: core::ptr::addr_of!(IDT) as u64,
    };
    // SAFETY: The IDT is static and initialized per the caller contract.
    unsafe {
        core::arch::asm!("lidt [{}]", in(reg) &idtr, options(nostack));
    }
}

//! CPU context save/restore.
//!
//! Three kinds of context live here:
//!
//! * [`CpuContext`] — the trap frame the interrupt stubs build on the
//!   kernel stack. It is the saved user (or kernel) state every
//!   dispatcher, signal, and fork path works on.
//! * [`ExtendedContext`] — the 512-byte FXSAVE area for FPU/SSE state.
//! * The kernel-to-kernel switch frame used by [`switch_stacks`], which
//!   only carries callee-saved registers.

use core::mem::size_of;

use salern_abi::signal::SigSet;

use super::gdt;

/// The trap frame built by the interrupt entry stubs.
///
/// Field order matches the push sequence in `isr_common` exactly; the
/// layout is part of the assembly contract.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct CpuContext {
    /// R15 register.
    pub r15: u64,
    /// R14 register.
    pub r14: u64,
    /// R13 register.
    pub r13: u64,
    /// R12 register.
    pub r12: u64,
    /// R11 register.
    pub r11: u64,
    /// R10 register.
    pub r10: u64,
    /// R9 register.
    pub r9: u64,
    /// R8 register.
    pub r8: u64,
    /// RBP register.
    pub rbp: u64,
    /// RDI register.
    pub rdi: u64,
    /// RSI register.
    pub rsi: u64,
    /// RDX register.
    pub rdx: u64,
    /// RCX register.
    pub rcx: u64,
    /// RBX register.
    pub rbx: u64,
    /// RAX register.
    pub rax: u64,
    /// Interrupt vector number.
    pub vector: u64,
    /// Hardware error code (0 for vectors without one).
    pub error: u64,
    /// Return instruction pointer.
    pub rip: u64,
    /// Return code segment.
    pub cs: u64,
    /// Saved RFLAGS.
    pub rflags: u64,
    /// Return stack pointer.
    pub rsp: u64,
    /// Return stack segment.
    pub ss: u64,
}

static_assertions::const_assert_eq!(size_of::<CpuContext>(), 22 * 8);

impl CpuContext {
    /// Returns whether this context was captured in user mode.
    #[must_use]
    pub fn from_user(&self) -> bool {
        self.cs & 3 == 3
    }

    /// Builds a fresh ring-3 context entering `entry` with stack `rsp`.
    #[must_use]
    pub fn new_user(entry: u64, rsp: u64) -> Self {
        Self {
            rip: entry,
            cs: u64::from(gdt::USER_CODE),
            // IF set, reserved bit 1 set.
            rflags: 0x202,
            rsp,
            ss: u64::from(gdt::USER_DATA),
            ..Self::default()
        }
    }

    /// Dumps the context to the kernel log (panic path).
    pub fn print(&self) {
        crate::kurgent!(
            "rip={:#018x} cs={:#06x} rflags={:#010x} rsp={:#018x} ss={:#06x}",
            self.rip,
            self.cs,
            self.rflags,
            self.rsp,
            self.ss
        );
        crate::kurgent!(
            "rax={:#018x} rbx={:#018x} rcx={:#018x} rdx={:#018x}",
            self.rax,
            self.rbx,
            self.rcx,
            self.rdx
        );
        crate::kurgent!(
            "rsi={:#018x} rdi={:#018x} rbp={:#018x} r8 ={:#018x}",
            self.rsi,
            self.rdi,
            self.rbp,
            self.r8
        );
        crate::kurgent!(
            "r9 ={:#018x} r10={:#018x} r11={:#018x} r12={:#018x}",
            self.r9,
            self.r10,
            self.r11,
            self.r12
        );
        crate::kurgent!(
            "r13={:#018x} r14={:#018x} r15={:#018x} vec={} err={:#x}",
            self.r13,
            self.r14,
            self.r15,
            self.vector,
            self.error
        );
    }
}

/// FXSAVE area for FPU/SSE state.
#[repr(C, align(16))]
pub struct ExtendedContext {
    area: [u8; 512],
}

impl ExtendedContext {
    /// A zeroed (power-on default) FPU context.
    #[must_use]
    pub const fn new() -> Self {
        Self { area: [0; 512] }
    }

    /// Saves the current FPU/SSE state into this area.
    pub fn save(&mut self) {
        // SAFETY: The area is 512 bytes and 16-byte aligned.
        unsafe {
            core::arch::asm!("fxsave64 [{}]", in(reg) self.area.as_mut_ptr(), options(nostack));
        }
    }

    /// Restores the FPU/SSE state from this area.
    pub fn restore(&self) {
        // SAFETY: The area is 512 bytes, aligned, and was written by
        // `save` (or is the zeroed default, which fxrstor accepts after
        // `reset`).
        unsafe {
            core::arch::asm!("fxrstor64 [{}]", in(reg) self.area.as_ptr(), options(nostack));
        }
    }

    /// Raw bytes of the save area (sigframe copies).
    #[must_use]
    pub fn area_bytes(&self) -> &[u8; 512] {
        &self.area
    }

    /// Mutable raw bytes of the save area (sigreturn restore).
    pub fn area_bytes_mut(&mut self) -> &mut [u8; 512] {
        &mut self.area
    }

    /// Reinitializes the live FPU state (execve).
    pub fn reset(&mut self) {
        self.area = [0; 512];
        // SAFETY: finit only touches FPU state.
        unsafe { core::arch::asm!("finit", options(nomem, nostack)) };
        self.save();
    }
}

impl Default for ExtendedContext {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Kernel stack switching
// ---------------------------------------------------------------------------

/// Switches kernel stacks: saves the callee-saved state of the current
/// thread at `*save_rsp` and resumes the thread whose switch frame lives
/// at `load_rsp`.
///
/// # Safety
///
/// `save_rsp` must point at the current thread's saved-RSP slot and
/// `load_rsp` must be a value previously produced by this function or by
/// [`prepare_initial_stack`].
#[unsafe(naked)]
pub unsafe extern "C" fn switch_stacks(save_rsp: *mut u64, load_rsp: u64) {
    core::arch::naked_asm!(
        // Callee-saved registers per the SysV ABI.
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov [rdi], rsp",
        "mov rsp, rsi",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "ret",
    );
}

/// Number of qwords in a [`switch_stacks`] frame (6 callee-saved + RIP).
const SWITCH_FRAME_QWORDS: usize = 7;

/// Prepares a brand-new kernel stack so that [`switch_stacks`] "returns"
/// into `entry` with `arg` in RDI.
///
/// Returns the initial saved-RSP value for the thread.
///
/// # Safety
///
/// `stack_top` must be the exclusive, 16-byte-aligned top of a mapped
/// kernel stack.
pub unsafe fn prepare_initial_stack(stack_top: u64, entry: extern "C" fn(usize) -> !, arg: usize) -> u64 {
    // Frame, top down: [springboard-rip][rbp=0][rbx=entry][r12=arg]
    // [r13=0][r14=0][r15=0]. `thread_springboard` moves r12 into rdi
    // and calls rbx, so `entry` gets a normal argument without a
    // custom ABI.
    let top = stack_top as *mut u64;
    // SAFETY: The caller guarantees the stack is mapped and exclusive.
    unsafe {
        // Sized so RSP is 16-byte aligned again once the springboard's
        // `call` pushes its return address.
        let frame = top.sub(SWITCH_FRAME_QWORDS);
        *frame.add(6) = thread_springboard as usize as u64; // popped as RIP
        *frame.add(5) = 0; // rbp
        *frame.add(4) = entry as usize as u64; // rbx
        *frame.add(3) = arg as u64; // r12
        *frame.add(2) = 0; // r13
        *frame.add(1) = 0; // r14
        *frame.add(0) = 0; // r15
        frame as u64
    }
}

/// First code a fresh thread runs after its first [`switch_stacks`].
///
/// The initial frame leaves the entry function in RBX and its argument in
/// R12 (see [`prepare_initial_stack`]'s pop order).
#[unsafe(naked)]
unsafe extern "C" fn thread_springboard() -> ! {
    core::arch::naked_asm!(
        // Scheduler locks are released and interrupts re-enabled by the
        // entry prologue (sched::new_thread_prologue), not here.
        "mov rdi, r12",
        "call rbx",
        // Thread entries never return.
        "ud2",
    );
}

// ---------------------------------------------------------------------------
// Ring transitions
// ---------------------------------------------------------------------------

/// Enters user mode from a saved context. Never returns.
///
/// # Safety
///
/// `ctx` must describe a valid ring-3 state in the current address
/// space; the current kernel stack is abandoned.
pub unsafe fn context_trampoline(ctx: &CpuContext) -> ! {
    // SAFETY: We load the full register file from the context and iretq.
    // swapgs pairs with the entry path's swapgs: entering ring 3 must
    // leave the kernel GS base in IA32_KERNEL_GS_BASE.
    unsafe {
        core::arch::asm!(
            "mov rsp, {ctx}",
            "pop r15",
            "pop r14",
            "pop r13",
            "pop r12",
            "pop r11",
            "pop r10",
            "pop r9",
            "pop r8",
            "pop rbp",
            "pop rdi",
            "pop rsi",
            "pop rdx",
            "pop rcx",
            "pop rbx",
            "pop rax",
            "add rsp, 16", // vector + error
            "swapgs",
            "iretq",
            ctx = in(reg) ctx,
            options(noreturn),
        );
    }
}

// ---------------------------------------------------------------------------
// Signal frames
// ---------------------------------------------------------------------------

/// The block written onto the user stack for signal delivery.
///
/// `sigreturn` reads it back; the layout is ABI between kernel and libc's
/// signal trampoline.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct SigFrame {
    /// Return address the handler `ret`s to: the sigreturn trampoline.
    pub restorer: u64,
    /// Saved user context at delivery time.
    pub ctx: CpuContext,
    /// Saved FPU state.
    pub fpu: [u8; 512],
    /// The thread's signal mask before delivery.
    pub saved_mask: SigSet,
}

/// Red-zone the sigframe must skip below the interrupted RSP.
const REDZONE: u64 = 128;

/// Computes the user address for a new sigframe below `user_rsp`.
///
/// The frame is 16-byte aligned per the ABI.
#[must_use]
pub fn alloc_sigframe(user_rsp: u64) -> u64 {
    let top = user_rsp - REDZONE - size_of::<SigFrame>() as u64;
    top & !0xf
}

/// Rewrites `ctx` so that returning to user mode runs `handler(signal)`
/// on the alternate frame at `frame_addr`, with `restorer` as the
/// handler's return address.
pub fn setup_sigframe(ctx: &mut CpuContext, frame_addr: u64, handler: u64, signal: u8) {
    ctx.rip = handler;
    ctx.rsp = frame_addr;
    ctx.rdi = u64::from(signal);
    // A fresh frame: direction flag clear, IF set.
    ctx.rflags = 0x202;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sigframe_is_aligned_and_below_redzone() {
        let rsp = 0x7fff_ffff_e000;
        let frame = alloc_sigframe(rsp);
        assert_eq!(frame % 16, 0);
        assert!(frame + size_of::<SigFrame>() as u64 + REDZONE <= rsp);
    }
}

//! Interrupt dispatch.
//!
//! A 256-slot table of `{handler, eoi}` pairs. The assembly stubs build
//! a [`CpuContext`] and call [`dispatch_entry`]; the dispatcher runs the
//! registered handler, signals end-of-interrupt, and — when the trap
//! came from ring 3 — walks the pending-signal machinery before the
//! `iretq`.

use core::sync::atomic::{AtomicPtr, Ordering};

use crate::arch::x86_64::context::CpuContext;
use crate::arch::x86_64::{lapic, vectors};
use crate::percpu;

/// An interrupt handler: receives the saved context.
pub type IsrHandler = fn(&mut CpuContext);

/// An end-of-interrupt routine.
pub type EoiFn = fn();

static HANDLERS: [AtomicPtr<()>; 256] = [const { AtomicPtr::new(core::ptr::null_mut()) }; 256];
static EOIS: [AtomicPtr<()>; 256] = [const { AtomicPtr::new(core::ptr::null_mut()) }; 256];

/// Installs a handler (and optionally an EOI routine) for a vector.
pub fn register(vector: u8, handler: IsrHandler, eoi: Option<EoiFn>) {
    HANDLERS[usize::from(vector)].store(handler as *mut (), Ordering::Release);
    if let Some(eoi) = eoi {
        EOIS[usize::from(vector)].store(eoi as *mut (), Ordering::Release);
    }
}

/// The central dispatcher, called from the assembly stubs.
///
/// Interrupts are already masked (interrupt gates); the dispatcher
/// pins the spinlock depth to 1 for the handler's duration so lock
/// releases inside the handler never re-enable interrupts early.
pub extern "C" fn dispatch_entry(vector: u64, ctx: *mut CpuContext) {
    // SAFETY: The stub passes a pointer into the live trap frame on this
    // kernel stack.
    let ctx = unsafe { &mut *ctx };
    let vec = vector as usize & 0xff;

    percpu::cpu_get().set_int_depth(1);

    let handler = HANDLERS[vec].load(Ordering::Acquire);
    if handler.is_null() {
        crate::panic::panic_with_context(ctx, format_args!("isr not set for vector {vec}"));
    }
    // SAFETY: Only valid `IsrHandler` pointers are stored in the table.
    let handler: IsrHandler = unsafe { core::mem::transmute(handler) };
    handler(ctx);

    let eoi = EOIS[vec].load(Ordering::Acquire);
    if !eoi.is_null() {
        // SAFETY: Only valid `EoiFn` pointers are stored in the table.
        let eoi: EoiFn = unsafe { core::mem::transmute(eoi) };
        eoi();
    }

    // Re-fetch: a handler that yielded may resume on another CPU.
    let cpu = percpu::cpu_get();
    if ctx.from_user() {
        if cpu.need_resched.swap(false, Ordering::AcqRel) {
            crate::sched::yield_now();
        }
        if let Some(thread) = percpu::cpu_get().current_thread() {
            crate::proc::signal::dispatch(ctx, &thread);
        }
    }

    let cpu = percpu::cpu_get();
    debug_assert_eq!(cpu.int_depth(), 1, "isr left a spinlock held");
    cpu.set_int_depth(0);
}

// ---------------------------------------------------------------------------
// Fixed handlers
// ---------------------------------------------------------------------------

fn timer_isr(_ctx: &mut CpuContext) {
    crate::sched::timer_tick();
}

fn resched_isr(_ctx: &mut CpuContext) {
    crate::sched::resched_ipi();
}

fn signal_isr(_ctx: &mut CpuContext) {
    // Nothing to do: the point of the IPI is the return-to-user signal
    // check in the dispatcher.
}

fn panic_isr(_ctx: &mut CpuContext) {
    crate::arch::halt_forever();
}

fn shootdown_isr(_ctx: &mut CpuContext) {
    use crate::arch::x86_64::mmu::{self, PageTable};
    use salern_core::addr::VirtAddr;

    let cpu = percpu::cpu_get();
    let addr = cpu.shootdown.addr.load(Ordering::Acquire);
    let pages = cpu.shootdown.pages.load(Ordering::Acquire);
    if pages == u64::MAX {
        // Full flush: reload the current root.
        PageTable::from_root(mmu::read_cr3()).switch();
    } else {
        PageTable::invalidate(VirtAddr::new(addr), pages as usize);
    }
    cpu.shootdown.pending.fetch_sub(1, Ordering::AcqRel);
    lapic::eoi();
}

fn spurious_isr(_ctx: &mut CpuContext) {
    // Spurious vectors must not EOI.
}

fn syscall_isr(ctx: &mut CpuContext) {
    crate::syscall::dispatch_trap(ctx);
}

/// Installs the kernel's fixed vectors: exceptions, timer, syscall gate,
/// and the IPI set.
pub fn init() {
    crate::proc::fault::register_exception_handlers();

    register(vectors::TIMER, timer_isr, None);
    register(vectors::SYSCALL, syscall_isr, None);
    register(vectors::IPI_RESCHEDULE, resched_isr, None);
    register(vectors::IPI_SIGNAL, signal_isr, Some(lapic::eoi));
    register(vectors::IPI_SHOOTDOWN, shootdown_isr, None);
    register(vectors::IPI_PANIC, panic_isr, None);
    register(vectors::SPURIOUS, spurious_isr, None);
}

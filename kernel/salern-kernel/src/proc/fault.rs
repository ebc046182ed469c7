//! CPU exception handling.
//!
//! Kernel-mode faults with no VMM resolution panic with the saved
//! context; user-mode faults turn into signals (`SIGSEGV`, `SIGFPE`,
//! `SIGILL`) delivered on the way back to ring 3.

use salern_abi::signal::{SIGFPE, SIGILL, SIGSEGV, SIGTRAP};

use crate::arch::x86_64::context::CpuContext;
use crate::arch::x86_64::mmu;
use crate::interrupt;
use crate::proc;

/// Page-fault error-code bit: the access was a write.
const PF_WRITE: u64 = 1 << 1;
/// Page-fault error-code bit: the access came from ring 3.
const PF_USER: u64 = 1 << 2;

fn page_fault(ctx: &mut CpuContext) {
    let addr = mmu::fault_address();
    let write = ctx.error & PF_WRITE != 0;
    let user = ctx.error & PF_USER != 0;

    if let Some(proc) = proc::current() {
        if proc.space().handle_fault(addr, write) {
            return;
        }
    }

    if user {
        crate::kdebug!(
            "fault: segv pid {:?} at {} (rip={:#x}, err={:#x})",
            proc::current().map(|p| p.pid),
            addr,
            ctx.rip,
            ctx.error
        );
        send_fatal(SIGSEGV);
        return;
    }
    crate::panic::panic_with_context(
        ctx,
        format_args!("kernel page fault at {addr} (err={:#x})", ctx.error),
    );
}

fn divide_error(ctx: &mut CpuContext) {
    if ctx.from_user() {
        send_fatal(SIGFPE);
        return;
    }
    crate::panic::panic_with_context(ctx, format_args!("kernel divide error"));
}

fn invalid_opcode(ctx: &mut CpuContext) {
    if ctx.from_user() {
        send_fatal(SIGILL);
        return;
    }
    crate::panic::panic_with_context(ctx, format_args!("kernel invalid opcode"));
}

fn breakpoint(ctx: &mut CpuContext) {
    if ctx.from_user() {
        send_fatal(SIGTRAP);
        return;
    }
    crate::kurgent!("breakpoint at {:#x}", ctx.rip);
}

fn general_protection(ctx: &mut CpuContext) {
    if ctx.from_user() {
        send_fatal(SIGSEGV);
        return;
    }
    crate::panic::panic_with_context(
        ctx,
        format_args!("general protection fault (err={:#x})", ctx.error),
    );
}

fn double_fault(ctx: &mut CpuContext) {
    crate::panic::panic_with_context(ctx, format_args!("double fault"));
}

fn unhandled_exception(ctx: &mut CpuContext) {
    if ctx.from_user() {
        send_fatal(SIGILL);
        return;
    }
    crate::panic::panic_with_context(
        ctx,
        format_args!("unhandled exception {}", ctx.vector),
    );
}

/// Posts a fatal signal to the current process; delivery (or default
/// termination) happens in the return-to-user signal check.
fn send_fatal(sig: u8) {
    if let Some(proc) = proc::current() {
        let _ = crate::proc::signal::send_to_proc(proc.pid, sig, None);
    }
}

/// Installs handlers for vectors 0-31.
pub fn register_exception_handlers() {
    for vec in 0..32u8 {
        interrupt::register(vec, unhandled_exception, None);
    }
    interrupt::register(0, divide_error, None);
    interrupt::register(3, breakpoint, None);
    interrupt::register(6, invalid_opcode, None);
    interrupt::register(8, double_fault, None);
    interrupt::register(13, general_protection, None);
    interrupt::register(14, page_fault, None);
}

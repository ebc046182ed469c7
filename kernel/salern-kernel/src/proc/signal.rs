//! POSIX-style signal delivery.
//!
//! Pending/masked bitsets exist at both process and thread level; the
//! thread mask overlays the process mask. Delivery happens on every
//! return to user mode: the dispatcher picks the lowest pending,
//! unmasked signal, pushes a sigframe onto the user stack, and rewrites
//! the trap frame to enter the handler. `sigreturn` restores the saved
//! context bit-for-bit.

use alloc::sync::Arc;

use salern_abi::signal::{
    self, NSIG, SIG_DFL, SIG_IGN, SigAction, SigActionFlags, SigSet,
};
use salern_abi::{Errno, wait};

use crate::arch::x86_64::context::{self, CpuContext, SigFrame};
use crate::arch::x86_64::{lapic, vectors};
use crate::percpu;
use crate::proc::thread::{Thread, ThreadState};
use crate::proc::{self, Process};

/// Checks for and delivers one pending signal on return to user mode.
///
/// Called by the interrupt dispatcher with the user trap frame.
pub fn dispatch(ctx: &mut CpuContext, thread: &Arc<Thread>) {
    let Some(proc) = thread.process() else {
        return;
    };

    // Thread state is consulted under the schedule lock so an exiting
    // thread cannot race us into a half-built sigframe.
    thread.sched_lock.acquire();
    if thread.state() == ThreadState::Exited {
        thread.sched_lock.release();
        return;
    }

    let (sig, action) = {
        let mut tsig = thread.signals.lock();
        let psig = proc.sig.lock();
        let blocked = tsig.mask.union(psig.mask);
        let deliverable = tsig.pending.union(psig.pending).difference(blocked);
        drop(psig);

        let Some(sig) = deliverable.lowest() else {
            thread.sched_lock.release();
            return;
        };
        let action = proc.sigactions.lock()[sig as usize - 1];

        // Claim the bit from whichever set carried it.
        if tsig.pending.contains(sig) {
            tsig.pending.remove(sig);
        } else {
            proc.sig.lock().pending.remove(sig);
        }
        (sig, action)
    };
    thread.sched_lock.release();

    match action.handler {
        SIG_IGN => {}
        SIG_DFL => {
            if signal::default_terminates(sig) {
                crate::kdebug!(
                    "signal: pid {} killed by signal {}",
                    proc.pid,
                    sig
                );
                proc::exit_current(wait::signaled(sig));
            }
            // Default-ignore signals (SIGCHLD, SIGWINCH, SIGCONT).
        }
        handler => deliver(ctx, thread, &proc, sig, handler, &action),
    }
}

/// Builds the sigframe and redirects the user context to the handler.
fn deliver(
    ctx: &mut CpuContext,
    thread: &Arc<Thread>,
    proc: &Arc<Process>,
    sig: u8,
    handler: u64,
    action: &SigAction,
) {
    let frame_addr = context::alloc_sigframe(ctx.rsp);

    let saved_mask = {
        let mut tsig = thread.signals.lock();
        let saved = tsig.mask;
        // Block the handler's mask plus the delivered signal itself.
        tsig.mask = tsig.mask.union(action.mask);
        if !action.flags.contains(SigActionFlags::NODEFER) {
            tsig.mask.add(sig);
        }
        saved
    };

    let mut frame = SigFrame {
        restorer: action.restorer,
        ctx: *ctx,
        fpu: [0; 512],
        saved_mask,
    };
    {
        let mut fpu = thread.fpu.lock();
        fpu.save();
        // The live FPU state belongs to the interrupted user code.
        frame.fpu.copy_from_slice(fpu.area_bytes());
    }

    // The frame lives in user memory; copy it through the user mapping
    // (we run with the process's page table active).
    let dst = frame_addr as *mut SigFrame;
    if !user_range_writable(proc, frame_addr, size_of::<SigFrame>()) {
        // Unwritable stack: the classic double-fault-to-death.
        crate::kdebug!("signal: pid {} bad sigstack, killing", proc.pid);
        proc::exit_current(wait::signaled(signal::SIGSEGV));
    }
    // SAFETY: Range checked writable above; we run on the process's
    // address space.
    unsafe { dst.write(frame) };

    context::setup_sigframe(ctx, frame_addr, handler, sig);
}

/// Restores the context saved in the sigframe the handler returns to.
///
/// The syscall's register writeback is skipped (`discarded`): the whole
/// frame is replaced.
pub fn sigreturn(ctx: &mut CpuContext, thread: &Arc<Thread>) -> Result<(), Errno> {
    let proc = thread.process().ok_or(Errno::Esrch)?;
    // The handler `ret`s into the restorer, which issues sigreturn with
    // the stack pointer still inside the frame (above the popped
    // restorer slot).
    let frame_addr = ctx.rsp - 8;
    if !user_range_writable(&proc, frame_addr, size_of::<SigFrame>()) {
        return Err(Errno::Efault);
    }
    // SAFETY: Range checked; process page table is active.
    let frame = unsafe { (frame_addr as *const SigFrame).read() };

    thread.signals.lock().mask = frame.saved_mask;
    {
        let mut fpu = thread.fpu.lock();
        fpu.area_bytes_mut().copy_from_slice(&frame.fpu);
        fpu.restore();
    }
    let mut restored = frame.ctx;
    // Userspace cannot be allowed to forge its privilege level.
    restored.cs = ctx.cs;
    restored.ss = ctx.ss;
    restored.rflags = (restored.rflags & 0xcd5) | 0x202;
    *ctx = restored;
    Ok(())
}

/// Sends `sig` to process `pid`.
///
/// Prefers a thread with the signal unmasked (setting its thread-level
/// pending bit); otherwise parks the signal at process level. Kicks the
/// target thread's CPU with `IPI_SIGNAL` to force a prompt
/// return-to-user check.
pub fn send_to_proc(pid: u32, sig: u8, _sender: Option<&Arc<Process>>) -> Result<(), Errno> {
    if sig == 0 || sig as usize > NSIG {
        return Err(Errno::Einval);
    }
    let target = proc::lookup(pid).ok_or(Errno::Esrch)?;
    if target.exit_status.lock().is_some() {
        return Err(Errno::Esrch);
    }

    let threads = target.threads.lock();
    for thread in threads.iter() {
        let blocked = {
            let tsig = thread.signals.lock();
            tsig.mask.contains(sig)
        };
        if !blocked && thread.state() != ThreadState::Exited {
            thread.signals.lock().pending.add(sig);
            kick_thread(thread);
            return Ok(());
        }
    }
    drop(threads);

    target.sig.lock().pending.add(sig);
    Ok(())
}

/// Sends `sig` to one specific thread of a process.
pub fn send_to_thread(pid: u32, tid: u32, sig: u8) -> Result<(), Errno> {
    if sig == 0 || sig as usize > NSIG {
        return Err(Errno::Einval);
    }
    let target = proc::lookup(pid).ok_or(Errno::Esrch)?;
    let threads = target.threads.lock();
    let thread = threads
        .iter()
        .find(|t| t.tid == tid)
        .ok_or(Errno::Esrch)?;
    thread.signals.lock().pending.add(sig);
    kick_thread(thread);
    Ok(())
}

/// Sends `sig` to every member of a process group.
pub fn send_to_group(pgid: u32, sig: u8) {
    for pid in proc::group_members(pgid) {
        let _ = send_to_proc(pid, sig, None);
    }
}

fn kick_thread(thread: &Arc<Thread>) {
    use core::sync::atomic::Ordering;
    let here = percpu::cpu_get();
    let target_cpu = thread.last_cpu.load(Ordering::Relaxed);
    if thread.state() == ThreadState::Running && target_cpu != here.cpu_id {
        if let Some(cpu) = percpu::cpu_by_id(target_cpu) {
            lapic::send_ipi(cpu.lapic_id.load(Ordering::Relaxed), vectors::IPI_SIGNAL);
        }
    }
    // A blocked thread gets the signal at its next return to user mode;
    // interruptible sleeps are woken so that happens soon.
    if thread.state() == ThreadState::Waiting {
        crate::sched::wake(thread, crate::proc::thread::WakeReason::Notified);
    }
}

/// Very coarse user-pointer check: the whole range must translate with
/// user and write permission in the current address space.
fn user_range_writable(proc: &Arc<Process>, addr: u64, len: usize) -> bool {
    use crate::arch::x86_64::mmu::PteFlags;
    use salern_core::addr::{PAGE_SIZE, VirtAddr};

    let space = proc.space();
    let mut page = VirtAddr::new(addr).page_base();
    let end = VirtAddr::new(addr + len as u64);
    while page < end {
        // Fault lazy pages in through the normal path.
        match space.table().translate(page) {
            Some((_, flags))
                if flags.contains(PteFlags::USER) && flags.contains(PteFlags::WRITE) => {}
            _ => {
                if !space.handle_fault(page, true) {
                    return false;
                }
            }
        }
        page = page + PAGE_SIZE as u64;
    }
    true
}

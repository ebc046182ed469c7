//! Per-CPU scheduler.
//!
//! One FIFO runqueue per CPU. Kernel code is cooperative: switches
//! happen at explicit `yield_now`, at scheduler waits, at timer-driven
//! preemption points inside the tick ISR, and on `IPI_RESCHEDULE`.
//!
//! The switch protocol: the outgoing thread's `sched_lock` is held from
//! before its state changes until *after* the stack switch, and released
//! by the incoming thread (`finish_switch`). A CPU switching *to* a
//! thread acquires that thread's lock first, so a thread freshly pushed
//! to a runqueue can never be entered before its registers are saved —
//! even by another CPU.

pub use crate::callout;

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;

use crate::arch::x86_64::{context, lapic, vectors};
use crate::config::{ARCH_TIMER_NS, SCHED_QUANTUM_TICKS, SCHED_REAPER_NOTIFY};
use crate::percpu::{self, PerCpu};
use crate::proc::thread::{Thread, ThreadStart, ThreadState};
use crate::sync::Waitlist;
use crate::callout::CalloutAction;

use salern_core::sync::SpinLock;

/// Threads that exited and await reclamation.
static REAP_QUEUE: SpinLock<Vec<Arc<Thread>>> = SpinLock::new(Vec::new());

/// Wakes the thread reaper.
static REAPER_WAITLIST: Waitlist = Waitlist::new();

/// Adopts the boot context as this CPU's idle thread and installs it as
/// current. Must run once per CPU before anything can block.
pub fn init_cpu() {
    let cpu = percpu::cpu_get();
    let idle = Thread::adopt_current("idle");
    idle.last_cpu.store(cpu.cpu_id, Ordering::Relaxed);
    *cpu.idle.lock() = Some(idle.clone());
    *cpu.current.lock() = Some(idle);
    cpu.callouts.lock().set_preempt_in(ARCH_TIMER_NS * SCHED_QUANTUM_TICKS);
}

/// Creates and enqueues a kernel thread.
pub fn spawn_kthread(
    name: &'static str,
    entry: extern "C" fn(usize) -> !,
    arg: usize,
) -> Option<Arc<Thread>> {
    let thread = Thread::new_kernel(name, entry, arg)?;
    enqueue(thread.clone());
    Some(thread)
}

/// Marks a thread runnable and queues it on its last CPU.
///
/// Sends `IPI_RESCHEDULE` when the target is another CPU so the wakeup
/// is observed within one tick.
pub fn enqueue(thread: Arc<Thread>) {
    let here = percpu::cpu_get();
    let target = percpu::cpu_by_id(thread.last_cpu.load(Ordering::Relaxed)).unwrap_or(here);
    thread.set_state(ThreadState::Runnable);
    target.runqueue.lock().push_back(thread);
    if target.cpu_id != here.cpu_id {
        target.need_resched.store(true, Ordering::Release);
        lapic::send_ipi(
            target.lapic_id.load(Ordering::Relaxed),
            vectors::IPI_RESCHEDULE,
        );
    }
}

/// Wakes a specific blocked thread (timeout path). No-op unless the
/// thread is still waiting, which makes duplicate wakeups idempotent.
pub fn wake(thread: &Arc<Thread>, reason: crate::proc::thread::WakeReason) -> bool {
    thread.sched_lock.acquire();
    let was_waiting = thread.state() == ThreadState::Waiting;
    if was_waiting {
        thread.wake_reason.store(reason as u8, Ordering::Release);
        thread.sched_lock.release();
        enqueue(thread.clone());
    } else {
        thread.sched_lock.release();
    }
    was_waiting
}

/// Voluntarily gives up the CPU.
pub fn yield_now() {
    let cpu = percpu::cpu_get();
    let prev = cpu.current_thread().expect("yield with no current thread");
    prev.sched_lock.acquire();

    let next = cpu.runqueue.lock().pop_front();
    let Some(next) = next else {
        // Nothing else to run.
        if prev.state() == ThreadState::Running {
            prev.sched_lock.release();
            return;
        }
        // The current thread is blocking or exiting: run idle.
        let idle = cpu.idle.lock().clone().expect("cpu has no idle thread");
        switch_to(cpu, prev, idle);
        return;
    };

    let is_idle = {
        let idle = cpu.idle.lock();
        idle.as_ref().is_some_and(|i| Arc::ptr_eq(i, &prev))
    };
    if prev.state() == ThreadState::Running && !is_idle {
        // Re-queue at the tail; idle never sits in the runqueue.
        prev.set_state(ThreadState::Runnable);
        cpu.runqueue.lock().push_back(prev.clone());
    }
    switch_to(cpu, prev, next);
}

/// Parks the current thread in `waitlist`. The caller has already
/// enqueued it and changed its state; this performs the switch.
fn deschedule(cpu: &'static PerCpu, prev: Arc<Thread>) {
    let next = cpu
        .runqueue
        .lock()
        .pop_front()
        .unwrap_or_else(|| cpu.idle.lock().clone().expect("cpu has no idle thread"));
    switch_to(cpu, prev, next);
}

/// The context switch. Enters with `prev.sched_lock` held; returns when
/// `prev` is eventually scheduled again.
fn switch_to(cpu: &'static PerCpu, prev: Arc<Thread>, next: Arc<Thread>) {
    debug_assert!(!Arc::ptr_eq(&prev, &next), "switching a thread to itself");

    // Spin until `next` has fully left its previous CPU.
    next.sched_lock.acquire();
    next.set_state(ThreadState::Running);
    next.last_cpu.store(cpu.cpu_id, Ordering::Relaxed);

    // FPU state follows the thread.
    prev.fpu.lock().save();
    next.fpu.lock().restore();

    // User threads need their address space and a ring-0 entry stack.
    if let Some(proc) = next.process() {
        proc.space().switch();
    }
    if let Some(top) = next.kstack_top() {
        crate::boot::set_tss_rsp0(top.as_u64());
    }

    *cpu.current.lock() = Some(next.clone());
    *cpu.handoff.lock() = Some(prev.clone());

    // The spinlock nesting depth is a per-thread property; stash it with
    // the outgoing thread and adopt the incoming one's.
    prev.saved_int_depth.store(cpu.int_depth(), Ordering::Release);
    cpu.set_int_depth(next.saved_int_depth.load(Ordering::Acquire));
    cpu.force_saved_if(true);

    let save = prev.saved_rsp_ptr();
    let load = next.saved_rsp();
    drop(next);
    // SAFETY: `save` points at prev's RSP slot; `load` was produced by a
    // previous switch-out or by stack priming.
    unsafe { context::switch_stacks(save, load) };

    // Back on this thread, possibly on a different CPU.
    finish_switch(percpu::cpu_get());
}

/// Completes a switch on the incoming side: releases the outgoing
/// thread's `sched_lock` and our own (taken by whoever resumed us).
fn finish_switch(cpu: &'static PerCpu) {
    let handoff = cpu.handoff.lock().take();
    if let Some(prev) = handoff {
        prev.sched_lock.release();
    }
    let current = cpu.current_thread().expect("finish_switch without current");
    current.sched_lock.release();
}

/// First Rust code of every fresh thread (see
/// [`context::prepare_initial_stack`]).
pub extern "C" fn thread_entry(thread_ptr: usize) -> ! {
    let cpu = percpu::cpu_get();
    finish_switch(cpu);
    crate::arch::interrupts_enable();

    // SAFETY: The pointer was derived from the Arc kept alive by
    // `cpu.current`.
    let thread = unsafe { &*(thread_ptr as *const Thread) };
    let start = thread.start.lock().take().expect("thread started twice");
    match start {
        ThreadStart::Kernel(entry, arg) => entry(arg),
        ThreadStart::User(ctx) => {
            // SAFETY: The context was built by exec/fork for this
            // thread's address space, which switch_to just activated.
            unsafe { context::context_trampoline(&ctx) }
        }
    }
}

/// Terminates the current thread. The reaper frees its stack.
pub fn exit_current() -> ! {
    let cpu = percpu::cpu_get();
    let prev = cpu.current_thread().expect("exit with no current thread");
    prev.disarm_interval_timer();

    let queued = {
        let mut queue = REAP_QUEUE.lock();
        queue.push(prev.clone());
        queue.len()
    };
    if queued >= SCHED_REAPER_NOTIFY {
        REAPER_WAITLIST.notify_one();
    }

    prev.sched_lock.acquire();
    prev.set_state(ThreadState::Exited);
    deschedule(cpu, prev);
    unreachable!("exited thread resumed");
}

/// Blocks the current thread after the caller linked it into a waitlist
/// and marked it [`ThreadState::Waiting`] under its `sched_lock`.
///
/// `prev.sched_lock` must be held; it is released by the next thread.
pub(crate) fn block_switched(prev: Arc<Thread>) {
    let cpu = percpu::cpu_get();
    deschedule(cpu, prev);
}

// ---------------------------------------------------------------------------
// Timer tick
// ---------------------------------------------------------------------------

/// LAPIC timer ISR body: advance the wheel, fire expired callouts,
/// preempt when the quantum ran out.
pub fn timer_tick() {
    // EOI first: this handler may yield and not return for a while.
    lapic::eoi();

    let cpu = percpu::cpu_get();
    let mut expired = Vec::new();
    let preempt = {
        let mut wheel = cpu.callouts.lock();
        wheel.advance(ARCH_TIMER_NS, &mut expired)
    };

    // Handlers run without the wheel lock so they may arm new callouts.
    for callout in expired {
        match callout.fire() {
            CalloutAction::Drop => {}
            CalloutAction::Rearm(at) => cpu.callouts.lock().rearm(callout, at),
        }
    }

    if preempt {
        cpu.callouts
            .lock()
            .set_preempt_in(ARCH_TIMER_NS * SCHED_QUANTUM_TICKS);
        yield_now();
    }
}

/// `IPI_RESCHEDULE` ISR body.
pub fn resched_ipi() {
    lapic::eoi();
    yield_now();
}

// ---------------------------------------------------------------------------
// Thread reaper
// ---------------------------------------------------------------------------

/// Reclaims exited threads' stacks and structures.
pub extern "C" fn reaper_thread(_arg: usize) -> ! {
    loop {
        loop {
            let dead = REAP_QUEUE.lock().pop();
            let Some(thread) = dead else { break };
            // Wait until the owning CPU definitively left the thread:
            // its final switch-out releases the sched_lock.
            thread.sched_lock.acquire();
            thread.sched_lock.release();
            crate::kdebug!("sched: reaped thread {} ({})", thread.tid, thread.name);
            drop(thread);
        }
        REAPER_WAITLIST.wait_timeout(1_000_000_000);
    }
}

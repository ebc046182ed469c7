//! Kernel threads.
//!
//! A thread is the unit of scheduling. At any instant it is either
//! running on exactly one CPU, queued in exactly one runqueue, parked in
//! exactly one waitlist, or exited and awaiting the reaper — the
//! `sched_lock` + state machine enforce the exclusivity.

use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};
use core::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};

use salern_abi::signal::SigSet;
use salern_core::addr::{PAGE_SIZE, PhysAddr, VirtAddr};
use salern_core::sync::{RawSpinLock, SpinLock};

use crate::arch::x86_64::context::{self, CpuContext, ExtendedContext};
use crate::config::KSTACK_PAGES;
use crate::mm::{hhdm, pmm};
use crate::proc::Process;

/// Thread scheduling state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadState {
    /// Created, never run.
    New = 0,
    /// In some CPU's runqueue.
    Runnable = 1,
    /// Executing on a CPU.
    Running = 2,
    /// Parked in a waitlist.
    Waiting = 3,
    /// Dead, awaiting the reaper.
    Exited = 4,
}

impl ThreadState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::New,
            1 => Self::Runnable,
            2 => Self::Running,
            3 => Self::Waiting,
            _ => Self::Exited,
        }
    }
}

/// Why a blocked thread woke up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WakeReason {
    /// A notifier picked this thread.
    Notified = 0,
    /// The paired timeout callout fired first.
    TimedOut = 1,
}

/// What a fresh thread runs after its first switch-in.
pub enum ThreadStart {
    /// Kernel thread: call the function with the argument.
    Kernel(extern "C" fn(usize) -> !, usize),
    /// User thread: drop to ring 3 with this context.
    User(Box<CpuContext>),
}

/// A kernel stack carved from contiguous frames.
pub struct KernelStack {
    base: PhysAddr,
    pages: usize,
}

impl KernelStack {
    /// Allocates a stack of [`KSTACK_PAGES`] pages.
    pub fn new() -> Option<Self> {
        let base = pmm::alloc_contiguous(KSTACK_PAGES)?;
        Some(Self {
            base,
            pages: KSTACK_PAGES,
        })
    }

    /// Highest usable address (stacks grow down), 16-byte aligned.
    #[must_use]
    pub fn top(&self) -> VirtAddr {
        hhdm::virt(self.base) + (self.pages * PAGE_SIZE) as u64
    }
}

impl Drop for KernelStack {
    fn drop(&mut self) {
        pmm::free(self.base, self.pages);
    }
}

/// An armed per-thread interval timer.
#[derive(Clone, Copy)]
pub struct IntervalTimer {
    /// CPU whose wheel holds the callout.
    pub cpu: u32,
    /// Callout id, for cancellation.
    pub id: u64,
    /// Rearm period in nanoseconds.
    pub interval_ns: u64,
}

/// Per-thread signal state.
#[derive(Default)]
pub struct ThreadSignals {
    /// Signals delivered to this thread and not yet taken.
    pub pending: SigSet,
    /// Thread-local mask, overlaying the process mask.
    pub mask: SigSet,
}

static NEXT_TID: AtomicU32 = AtomicU32::new(1);

/// A schedulable thread.
pub struct Thread {
    /// Thread id.
    pub tid: u32,
    /// Owning process; dangling for pure kernel threads.
    pub proc: Weak<Process>,
    /// Held across every state transition and context switch.
    pub sched_lock: RawSpinLock,
    state: AtomicU8,
    /// Saved kernel RSP while not running ([`context::switch_stacks`]).
    saved_rsp: AtomicU64,
    /// Spinlock nesting depth at switch-out, restored at switch-in.
    pub saved_int_depth: AtomicU32,
    /// Outcome of the last blocking wait.
    pub wake_reason: AtomicU8,
    /// CPU this thread last ran on (wakeup affinity).
    pub last_cpu: AtomicU32,
    /// Signal pending/mask bits.
    pub signals: SpinLock<ThreadSignals>,
    /// Saved FPU state.
    pub fpu: SpinLock<ExtendedContext>,
    /// Armed real-time interval timer, if any.
    pub interval_timer: SpinLock<Option<IntervalTimer>>,
    /// One-shot startup payload, consumed by the first switch-in.
    pub start: SpinLock<Option<ThreadStart>>,
    /// The stack; `None` for the boot CPU's bootstrap/idle thread,
    /// which keeps running on the loader-provided stack.
    kstack: Option<KernelStack>,
    /// Name for diagnostics (kernel threads).
    pub name: &'static str,
}

impl Thread {
    /// Creates a kernel thread ready to be enqueued.
    pub fn new_kernel(
        name: &'static str,
        entry: extern "C" fn(usize) -> !,
        arg: usize,
    ) -> Option<Arc<Self>> {
        let kstack = KernelStack::new()?;
        let thread = Arc::new(Self {
            tid: NEXT_TID.fetch_add(1, Ordering::Relaxed),
            proc: Weak::new(),
            sched_lock: RawSpinLock::new(),
            state: AtomicU8::new(ThreadState::New as u8),
            saved_rsp: AtomicU64::new(0),
            // A fresh thread enters through finish_switch, which
            // releases the two locks held across every switch; start
            // the depth accordingly.
            saved_int_depth: AtomicU32::new(2),
            wake_reason: AtomicU8::new(WakeReason::Notified as u8),
            last_cpu: AtomicU32::new(0),
            signals: SpinLock::new(ThreadSignals::default()),
            fpu: SpinLock::new(ExtendedContext::new()),
            interval_timer: SpinLock::new(None),
            start: SpinLock::new(Some(ThreadStart::Kernel(entry, arg))),
            kstack: Some(kstack),
            name,
        });
        thread.prime_stack();
        Some(thread)
    }

    /// Creates a user thread that will enter ring 3 with `ctx`.
    pub fn new_user(proc: &Arc<Process>, ctx: CpuContext) -> Option<Arc<Self>> {
        let kstack = KernelStack::new()?;
        let thread = Arc::new(Self {
            tid: NEXT_TID.fetch_add(1, Ordering::Relaxed),
            proc: Arc::downgrade(proc),
            sched_lock: RawSpinLock::new(),
            state: AtomicU8::new(ThreadState::New as u8),
            saved_rsp: AtomicU64::new(0),
            // A fresh thread enters through finish_switch, which
            // releases the two locks held across every switch; start
            // the depth accordingly.
            saved_int_depth: AtomicU32::new(2),
            wake_reason: AtomicU8::new(WakeReason::Notified as u8),
            last_cpu: AtomicU32::new(0),
            signals: SpinLock::new(ThreadSignals::default()),
            fpu: SpinLock::new(ExtendedContext::new()),
            interval_timer: SpinLock::new(None),
            start: SpinLock::new(Some(ThreadStart::User(Box::new(ctx)))),
            kstack: Some(kstack),
            name: "user",
        });
        thread.prime_stack();
        Some(thread)
    }

    /// Wraps the currently executing boot context into a thread object
    /// (BSP bootstrap and AP idle threads).
    pub fn adopt_current(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            tid: NEXT_TID.fetch_add(1, Ordering::Relaxed),
            proc: Weak::new(),
            sched_lock: RawSpinLock::new(),
            state: AtomicU8::new(ThreadState::Running as u8),
            saved_rsp: AtomicU64::new(0),
            saved_int_depth: AtomicU32::new(0),
            wake_reason: AtomicU8::new(WakeReason::Notified as u8),
            last_cpu: AtomicU32::new(0),
            signals: SpinLock::new(ThreadSignals::default()),
            fpu: SpinLock::new(ExtendedContext::new()),
            interval_timer: SpinLock::new(None),
            start: SpinLock::new(None),
            kstack: None,
            name,
        })
    }

    fn prime_stack(&self) {
        let top = self
            .kstack
            .as_ref()
            .expect("priming a stackless thread")
            .top()
            .as_u64();
        // SAFETY: The stack is freshly allocated and exclusively ours.
        let rsp = unsafe {
            context::prepare_initial_stack(top, crate::sched::thread_entry, self as *const Self as usize)
        };
        self.saved_rsp.store(rsp, Ordering::Release);
    }

    /// Current scheduling state.
    #[must_use]
    pub fn state(&self) -> ThreadState {
        ThreadState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Sets the scheduling state. Callers hold `sched_lock`.
    pub fn set_state(&self, state: ThreadState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Pointer to the saved-RSP slot for [`context::switch_stacks`].
    #[must_use]
    pub fn saved_rsp_ptr(&self) -> *mut u64 {
        // AtomicU64 is layout-compatible with u64.
        core::ptr::addr_of!(self.saved_rsp) as *mut u64
    }

    /// Saved RSP value (the switch target).
    #[must_use]
    pub fn saved_rsp(&self) -> u64 {
        self.saved_rsp.load(Ordering::Acquire)
    }

    /// Kernel stack top, for TSS.RSP0 while this thread runs user code.
    #[must_use]
    pub fn kstack_top(&self) -> Option<VirtAddr> {
        self.kstack.as_ref().map(KernelStack::top)
    }

    /// The owning process, if still alive.
    #[must_use]
    pub fn process(&self) -> Option<Arc<Process>> {
        self.proc.upgrade()
    }

    /// Arms (or re-arms) the thread's real-time interval timer: every
    /// `interval_ns` a `SIGALRM` lands on this thread.
    pub fn arm_interval_timer(self: &Arc<Self>, interval_ns: u64) {
        self.disarm_interval_timer();
        let cpu = crate::percpu::cpu_get();
        let raw = Arc::into_raw(self.clone()) as usize;
        let id = cpu
            .callouts
            .lock()
            .insert_in(interval_ns, interval_fire, raw);
        *self.interval_timer.lock() = Some(IntervalTimer {
            cpu: cpu.cpu_id,
            id,
            interval_ns,
        });
    }

    /// Cancels the interval timer if armed. Runs on every thread exit,
    /// so a pending expiry can never outlive its thread.
    pub fn disarm_interval_timer(&self) {
        let Some(timer) = self.interval_timer.lock().take() else {
            return;
        };
        if let Some(cpu) = crate::percpu::cpu_by_id(timer.cpu) {
            if cpu.callouts.lock().cancel(timer.id) {
                // The callout never fired again: reclaim its reference.
                // SAFETY: arm_interval_timer leaked exactly one Arc.
                drop(unsafe { Arc::from_raw(self as *const Self) });
            }
        }
    }

    /// Delivers `sig` to this thread and reports whether it is currently
    /// blocked by the thread-local mask.
    pub fn post_signal(&self, sig: u8) -> bool {
        let mut signals = self.signals.lock();
        signals.pending.add(sig);
        signals.mask.contains(sig)
    }
}

/// Interval-timer callout: post SIGALRM and rearm.
fn interval_fire(arg: usize) -> crate::callout::CalloutAction {
    use crate::callout::CalloutAction;

    // SAFETY: The argument is the Arc leaked by arm_interval_timer; it
    // stays leaked while the callout keeps rearming.
    let thread = unsafe { &*(arg as *const Thread) };
    let interval = thread.interval_timer.lock().map(|t| t.interval_ns);
    let (Some(interval), false) = (interval, thread.state() == ThreadState::Exited) else {
        // Disarmed or dead: stop rearming and reclaim the reference.
        // SAFETY: Final handoff of the Arc leaked at arm time.
        drop(unsafe { Arc::from_raw(arg as *const Thread) });
        return CalloutAction::Drop;
    };
    thread.post_signal(salern_abi::signal::SIGALRM);
    let now = crate::percpu::cpu_get().callouts.lock().now();
    CalloutAction::Rearm(now + interval.max(crate::config::ARCH_TIMER_NS))
}

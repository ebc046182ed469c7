//! Per-CPU state.
//!
//! Each CPU finds its own block through the `GS:[0]` self-pointer, set
//! up during CPU init. The BSP uses a static block (it must exist before
//! the heap); APs get leaked heap allocations. A global registry maps
//! CPU ids to blocks for cross-CPU work (IPI targeting, shootdowns).

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, Ordering};

use salern_core::sync::SpinLock;
use salern_mm::cache::{CacheFlags, FrameCache};

use crate::arch::x86_64::msr;
use crate::config::{MAX_CPUS, PMM_CACHE_SIZE};
use crate::proc::thread::Thread;
use crate::callout::CalloutWheel;

/// TLB shootdown mailbox, written by the requesting CPU and consumed by
/// the `IPI_SHOOTDOWN` handler.
pub struct ShootdownMailbox {
    /// Serializes requesters targeting this CPU.
    pub lock: SpinLock<()>,
    /// First page to invalidate.
    pub addr: AtomicU64,
    /// Number of pages.
    pub pages: AtomicU64,
    /// Outstanding request counter; the requester spins until it drops.
    pub pending: AtomicU32,
}

impl ShootdownMailbox {
    const fn new() -> Self {
        Self {
            lock: SpinLock::new(()),
            addr: AtomicU64::new(0),
            pages: AtomicU64::new(0),
            pending: AtomicU32::new(0),
        }
    }
}

/// One CPU's private state.
#[repr(C)]
pub struct PerCpu {
    /// Self-pointer, read via `GS:[0]`. Must stay the first field.
    self_ptr: AtomicU64,
    /// Logical CPU id (0 = BSP).
    pub cpu_id: u32,
    /// Local APIC id.
    pub lapic_id: AtomicU32,
    /// Spinlock/interrupt nesting depth of the running thread.
    int_depth: AtomicU32,
    /// Whether interrupts were enabled before the outermost disable.
    saved_if: AtomicBool,
    /// The thread currently executing on this CPU.
    pub current: SpinLock<Option<Arc<Thread>>>,
    /// This CPU's idle thread.
    pub idle: SpinLock<Option<Arc<Thread>>>,
    /// FIFO runqueue.
    pub runqueue: SpinLock<VecDeque<Arc<Thread>>>,
    /// Timer wheel.
    pub callouts: SpinLock<CalloutWheel>,
    /// Per-CPU frame cache.
    pub frame_cache: SpinLock<FrameCache<PMM_CACHE_SIZE>>,
    /// Set when this CPU should reschedule at the next opportunity.
    pub need_resched: AtomicBool,
    /// Outgoing thread of an in-progress context switch; its
    /// `sched_lock` is released by the incoming thread.
    pub handoff: SpinLock<Option<Arc<Thread>>>,
    /// TLB shootdown mailbox.
    pub shootdown: ShootdownMailbox,
}

impl PerCpu {
    const fn new(cpu_id: u32) -> Self {
        Self {
            self_ptr: AtomicU64::new(0),
            cpu_id,
            lapic_id: AtomicU32::new(0),
            int_depth: AtomicU32::new(0),
            saved_if: AtomicBool::new(false),
            current: SpinLock::new(None),
            idle: SpinLock::new(None),
            runqueue: SpinLock::new(VecDeque::new()),
            callouts: SpinLock::new(CalloutWheel::new()),
            frame_cache: SpinLock::new(FrameCache::new(CacheFlags::all())),
            need_resched: AtomicBool::new(false),
            handoff: SpinLock::new(None),
            shootdown: ShootdownMailbox::new(),
        }
    }

    /// Current interrupt-disable nesting depth.
    pub fn int_depth(&self) -> u32 {
        self.int_depth.load(Ordering::Relaxed)
    }

    /// Overwrites the nesting depth (trap entry/exit, thread switch).
    pub fn set_int_depth(&self, depth: u32) {
        self.int_depth.store(depth, Ordering::Relaxed);
    }

    /// Overwrites the saved interrupt flag (thread switch: kernel
    /// threads always run interruptible at depth zero).
    pub fn force_saved_if(&self, enabled: bool) {
        self.saved_if.store(enabled, Ordering::Relaxed);
    }

    /// Takes a snapshot of the running thread.
    pub fn current_thread(&self) -> Option<Arc<Thread>> {
        self.current.lock().clone()
    }
}

static BSP: PerCpu = PerCpu::new(0);

/// Registry of online CPUs for cross-CPU operations.
static CPUS: [AtomicPtr<PerCpu>; MAX_CPUS] = [const { AtomicPtr::new(core::ptr::null_mut()) }; MAX_CPUS];

static CPU_COUNT: AtomicU32 = AtomicU32::new(0);

/// Number of CPUs that completed per-CPU init.
pub fn cpu_count() -> u32 {
    CPU_COUNT.load(Ordering::Acquire)
}

/// Returns the calling CPU's block via the `GS:[0]` self-pointer.
#[must_use]
pub fn cpu_get() -> &'static PerCpu {
    let ptr: u64;
    // SAFETY: GS base was pointed at this CPU's PerCpu during init and
    // the first field is the self-pointer.
    unsafe {
        core::arch::asm!("mov {}, gs:[0]", out(reg) ptr, options(readonly, nostack));
        &*(ptr as *const PerCpu)
    }
}

/// Returns a specific CPU's block, if that CPU is online.
#[must_use]
pub fn cpu_by_id(cpu_id: u32) -> Option<&'static PerCpu> {
    if cpu_id as usize >= MAX_CPUS {
        return None;
    }
    let ptr = CPUS[cpu_id as usize].load(Ordering::Acquire);
    // SAFETY: Registered pointers are 'static (static BSP or leaked box).
    unsafe { ptr.as_ref() }
}

/// Iterates over every online CPU.
pub fn for_each_cpu(mut f: impl FnMut(&'static PerCpu)) {
    for slot in &CPUS {
        let ptr = slot.load(Ordering::Acquire);
        // SAFETY: See cpu_by_id.
        if let Some(cpu) = unsafe { ptr.as_ref() } {
            f(cpu);
        }
    }
}

fn install(cpu: &'static PerCpu) {
    cpu.self_ptr
        .store(cpu as *const PerCpu as u64, Ordering::Release);
    // SAFETY: Pointing both GS bases at the block; swapgs in the trap
    // entry relies on KERNEL_GS_BASE while ring 3 runs with GS_BASE = 0.
    unsafe {
        msr::wrmsr(msr::IA32_GS_BASE, cpu as *const PerCpu as u64);
        msr::wrmsr(msr::IA32_KERNEL_GS_BASE, cpu as *const PerCpu as u64);
    }
    CPUS[cpu.cpu_id as usize].store(
        cpu as *const PerCpu as *mut PerCpu,
        Ordering::Release,
    );
    CPU_COUNT.fetch_add(1, Ordering::AcqRel);
}

/// Initializes the BSP's per-CPU block and GS bases.
///
/// # Safety
///
/// Must run once, on the BSP, before anything calls [`cpu_get`].
pub unsafe fn init_bsp() {
    install(&BSP);
}

/// Allocates, installs, and returns a fresh AP per-CPU block.
///
/// # Safety
///
/// Must run once per AP, on that AP, after the heap is online.
pub unsafe fn init_ap(cpu_id: u32) -> &'static PerCpu {
    let cpu: &'static PerCpu = Box::leak(Box::new(PerCpu::new(cpu_id)));
    install(cpu);
    cpu
}

// ---------------------------------------------------------------------------
// Spinlock interrupt-discipline hooks
// ---------------------------------------------------------------------------

fn irq_disable_hook() {
    let was_enabled = crate::arch::interrupts_enabled();
    crate::arch::interrupts_disable();
    let cpu = cpu_get();
    let depth = cpu.int_depth.load(Ordering::Relaxed);
    if depth == 0 {
        cpu.saved_if.store(was_enabled, Ordering::Relaxed);
    }
    cpu.int_depth.store(depth + 1, Ordering::Relaxed);
}

fn irq_enable_hook() {
    let cpu = cpu_get();
    let depth = cpu.int_depth.load(Ordering::Relaxed);
    debug_assert!(depth > 0, "interrupt depth underflow");
    cpu.int_depth.store(depth - 1, Ordering::Relaxed);
    if depth == 1 && cpu.saved_if.load(Ordering::Relaxed) {
        crate::arch::interrupts_enable();
    }
}

/// Registers the spinlock interrupt hooks and the platform `pause` with
/// `salern-core`.
///
/// # Safety
///
/// [`init_bsp`] must have run; after this every spinlock acquisition
/// masks interrupts via the hooks.
pub unsafe fn register_core_hooks() {
    // SAFETY: The hooks are balanced and callable from any context once
    // the per-CPU block exists; cpu_relax never blocks.
    unsafe {
        salern_core::sync::hooks::set_irq_hooks(irq_disable_hook, irq_enable_hook);
        salern_core::sync::hooks::set_relax_fn(crate::arch::cpu_relax);
    }
}

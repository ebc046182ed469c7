//! Compile-time configuration knobs.
//!
//! One module of constants, so a port or a debug build changes behavior
//! here and nowhere else.

use salern_core::log::LogLevel;

/// Maximum log category emitted by this build.
pub const LOG_LEVEL: LogLevel = LogLevel::User;

/// Whether the kernel log is mirrored to a `/dev/kmsg` vnode.
pub const LOG_USE_VNODE: bool = true;

/// Whether boot prints the splash line and the memory-statistics dump.
pub const LOG_SHOW_SPLASH: bool = true;

/// What `kassert!` does on failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssertAction {
    /// Compile the check out entirely.
    Remove,
    /// Keep the expression for its side effects only.
    Expand,
    /// Log a warning and continue.
    Soft,
    /// Panic.
    Panic,
}

/// Assertion behavior for this build.
pub const ASSERT_ACTION: AssertAction = AssertAction::Panic;

/// Mutex implementation selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexMode {
    /// Degrade to the inner spin lock.
    Spinlock,
    /// Block on the scheduler.
    Real,
}

/// Mutex behavior for this build.
pub const MUTEX_MODE: MutexMode = MutexMode::Real;

/// PMM zeroing policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmmZero {
    /// Hand out frames raw.
    Off,
    /// Zero frames as they are freed.
    OnFree,
    /// Zero frames as they are allocated.
    OnAlloc,
    /// A background thread keeps a pool of pre-zeroed frames.
    Background,
}

/// Frame zeroing policy for this build.
pub const PMM_ZERO: PmmZero = PmmZero::Background;

/// Target size of the pre-zeroed frame pool ([`PmmZero::Background`]).
pub const PMM_ZERO_POOL: usize = 400;

/// Pages freed since the last defragment pass before the reaper runs one.
pub const PMM_DEFRAG_THRESHOLD: u64 = 500;

/// Maximum time between defragment passes, in nanoseconds.
pub const PMM_DEFRAG_TIMEOUT_NS: u64 = 10_000_000_000;

/// Per-CPU frame cache capacity.
pub const PMM_CACHE_SIZE: usize = 32;

/// Maximum number of CPUs.
pub const MAX_CPUS: usize = 32;

/// Maximum number of live processes.
pub const PROC_MAX: u32 = 250_000;

/// Exited threads queued before the thread reaper is notified.
pub const SCHED_REAPER_NOTIFY: usize = 32;

/// Destroyed address spaces queued before the VMM reaper is notified.
pub const VMM_REAPER_NOTIFY: usize = 8;

/// Local timer period in nanoseconds (1 ms tick).
pub const ARCH_TIMER_NS: u64 = 1_000_000;

/// Scheduling quantum in timer ticks.
pub const SCHED_QUANTUM_TICKS: u64 = 10;

/// Buffered framebuffer terminal flush rate, frames per second.
pub const TERM_FPS: u64 = 60;

/// Number of virtual terminals.
pub const TTY_MAX: usize = 7;

/// Path of the first userspace program.
pub const INIT_PATH: &str = "/boot/init";

/// Keyboard layout compiled in as the default.
pub const DEFAULT_KBD_LAYOUT: &str = "en_us";

/// Ring buffer capacity for UNIX sockets.
pub const UNIX_SOCK_RB_SIZE: usize = 256 * 1024;

/// Lowest virtual address the VMM picks for hint-less anonymous maps.
pub const VMM_ANON_START: u64 = 0x1_0000_0000;

/// Kernel stack size for new threads (four pages).
pub const KSTACK_PAGES: usize = 4;

/// Default user stack size (64 pages).
pub const USTACK_PAGES: usize = 64;

/// Per-syscall tracing: log before dispatching.
pub const LOG_SYSCALLS: bool = false;

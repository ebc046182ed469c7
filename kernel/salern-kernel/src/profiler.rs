//! Syscall profiler.
//!
//! Per-syscall invocation counts and cumulative time, bracketed around
//! every dispatched handler. `/dev/profile` renders the table as text;
//! writing to it resets the counters.

use core::fmt::Write as _;
use core::sync::atomic::{AtomicU64, Ordering};

use alloc::string::String;

use salern_abi::syscall::SYSCALL_MAX;

struct Slot {
    calls: AtomicU64,
    total_ns: AtomicU64,
}

static SLOTS: [Slot; SYSCALL_MAX] = [const {
    Slot {
        calls: AtomicU64::new(0),
        total_ns: AtomicU64::new(0),
    }
}; SYSCALL_MAX];

/// Opens a bracket; returns the start timestamp.
#[must_use]
pub fn enter(_num: usize) -> u64 {
    crate::time::now_ns()
}

/// Closes a bracket.
pub fn leave(num: usize, start_ns: u64) {
    let slot = &SLOTS[num];
    slot.calls.fetch_add(1, Ordering::Relaxed);
    slot.total_ns
        .fetch_add(crate::time::now_ns().saturating_sub(start_ns), Ordering::Relaxed);
}

/// Renders the non-zero rows as text.
#[must_use]
pub fn report() -> String {
    let mut out = String::new();
    let _ = writeln!(out, "syscall  calls      total_ns");
    for (num, slot) in SLOTS.iter().enumerate() {
        let calls = slot.calls.load(Ordering::Relaxed);
        if calls == 0 {
            continue;
        }
        let total = slot.total_ns.load(Ordering::Relaxed);
        let _ = writeln!(out, "{num:>7}  {calls:>9}  {total:>12}");
    }
    out
}

/// Clears every counter.
pub fn reset() {
    for slot in &SLOTS {
        slot.calls.store(0, Ordering::Relaxed);
        slot.total_ns.store(0, Ordering::Relaxed);
    }
}

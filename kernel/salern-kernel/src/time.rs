//! Kernel time.
//!
//! Thin facade over the calibrated TSC. Registered with `salern-core`
//! so spinlock timeouts and log timestamps read the same clock.

use crate::arch::x86_64::tsc;

/// Monotonic ticks since boot.
#[must_use]
pub fn timestamp() -> u64 {
    tsc::timestamp()
}

/// Converts ticks to nanoseconds.
#[must_use]
pub fn timestamp_to_ns(ticks: u64) -> u64 {
    tsc::timestamp_to_ns(ticks)
}

/// Nanoseconds since boot.
#[must_use]
pub fn now_ns() -> u64 {
    tsc::now_ns()
}

/// Calibrates the TSC and publishes the clock to `salern-core`.
///
/// # Safety
///
/// Must run once on the BSP with interrupts masked.
pub unsafe fn init() {
    // SAFETY: Per the function contract.
    unsafe {
        tsc::calibrate();
        salern_core::time::set_monotonic_fn(now_ns);
    }
}

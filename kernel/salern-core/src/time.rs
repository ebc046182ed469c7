//! Monotonic clock registry.
//!
//! The architecture layer registers its calibrated timestamp routine at
//! boot; before that, [`now_ns`] reads zero. Kept here (rather than in the
//! kernel crate) so lock timeouts and log timestamps work the same way on
//! the host, where tests may register `std::time`-based closures.

use core::sync::atomic::{AtomicPtr, Ordering};

/// Signature of the monotonic nanosecond clock.
pub type MonotonicFn = fn() -> u64;

fn zero_clock() -> u64 {
    0
}

static MONOTONIC_FN: AtomicPtr<()> = AtomicPtr::new(zero_clock as *mut ());

/// Registers the monotonic clock source.
///
/// # Safety
///
/// The function must be callable from any context, including interrupt
/// handlers.
pub unsafe fn set_monotonic_fn(f: MonotonicFn) {
    MONOTONIC_FN.store(f as *mut (), Ordering::Release);
}

/// Nanoseconds since boot (zero until a clock source is registered).
#[inline]
pub fn now_ns() -> u64 {
    let ptr = MONOTONIC_FN.load(Ordering::Acquire);
    // SAFETY: Only valid `MonotonicFn` pointers are stored in MONOTONIC_FN.
    let f: MonotonicFn = unsafe { core::mem::transmute(ptr) };
    f()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_clock_reads_zero() {
        // May race with other tests that register a clock, so only check
        // monotonicity of the default in isolation-friendly form.
        let a = now_ns();
        let b = now_ns();
        assert!(b >= a);
    }
}

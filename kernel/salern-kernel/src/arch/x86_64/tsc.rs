//! Time-stamp counter clock.
//!
//! The TSC is calibrated once against the legacy PIT during boot and
//! then serves as the kernel's monotonic clock. Invariant-TSC hardware
//! is assumed (every 64-bit x86 target this kernel supports has it).

use core::sync::atomic::{AtomicU64, Ordering};

use super::port;

/// TSC frequency in kHz, set by [`calibrate`].
static TSC_KHZ: AtomicU64 = AtomicU64::new(0);

/// TSC value at calibration time; timestamps are relative to boot.
static TSC_BOOT: AtomicU64 = AtomicU64::new(0);

/// Reads the time-stamp counter.
#[inline]
#[must_use]
pub fn read() -> u64 {
    let (lo, hi): (u32, u32);
    // SAFETY: rdtsc reads a counter, no side effects.
    unsafe {
        core::arch::asm!("lfence", "rdtsc", out("eax") lo, out("edx") hi, options(nomem, nostack));
    }
    (u64::from(hi) << 32) | u64::from(lo)
}

/// Calibrates the TSC against a 10 ms PIT countdown.
///
/// # Safety
///
/// Touches PIT ports; must run once on the BSP with interrupts masked.
pub unsafe fn calibrate() {
    // PIT channel 2, one-shot, lobyte/hibyte, gated by port 0x61.
    const PIT_HZ: u64 = 1_193_182;
    const CAL_MS: u64 = 10;
    let reload = (PIT_HZ * CAL_MS / 1000) as u16;

    // SAFETY: Standard PIT/speaker-gate programming sequence.
    unsafe {
        // Gate on, speaker off.
        let gate = port::inb(0x61);
        port::outb(0x61, (gate & !0x02) | 0x01);
        // Channel 2, access lobyte/hibyte, mode 0.
        port::outb(0x43, 0b1011_0000);
        port::outb(0x42, reload as u8);
        port::outb(0x42, (reload >> 8) as u8);
    }

    let start = read();
    // Wait for the output pin (port 0x61 bit 5) to go high.
    // SAFETY: Reading the gate port has no side effects.
    while unsafe { port::inb(0x61) } & 0x20 == 0 {
        super::cpu_relax();
    }
    let end = read();

    let khz = (end - start) / CAL_MS;
    TSC_KHZ.store(khz.max(1), Ordering::Release);
    TSC_BOOT.store(start, Ordering::Release);
    crate::kinfo!("tsc: calibrated at {} kHz", khz);
}

/// Monotonic ticks since boot (raw TSC delta).
#[must_use]
pub fn timestamp() -> u64 {
    read().wrapping_sub(TSC_BOOT.load(Ordering::Acquire))
}

/// Converts raw ticks to nanoseconds.
#[must_use]
pub fn timestamp_to_ns(ticks: u64) -> u64 {
    let khz = TSC_KHZ.load(Ordering::Acquire);
    if khz == 0 {
        return 0;
    }
    // ticks / (khz * 1000 / 1e9) = ticks * 1e6 / khz, split to avoid
    // overflow on large uptimes.
    (ticks / khz) * 1_000_000 + (ticks % khz) * 1_000_000 / khz
}

/// Nanoseconds since boot.
#[must_use]
pub fn now_ns() -> u64 {
    timestamp_to_ns(timestamp())
}

/// Spins for at least `ns` nanoseconds.
pub fn busy_wait_ns(ns: u64) {
    let khz = TSC_KHZ.load(Ordering::Acquire);
    if khz == 0 {
        // Not calibrated yet: crude fallback loop.
        for _ in 0..ns {
            super::cpu_relax();
        }
        return;
    }
    let ticks = ns * khz / 1_000_000;
    let start = read();
    while read().wrapping_sub(start) < ticks {
        super::cpu_relax();
    }
}

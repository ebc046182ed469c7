//! Local APIC driver.
//!
//! MMIO-mapped through the HHDM. Provides timer programming, EOI, and
//! the three IPI shapes the kernel uses (targeted, broadcast, self).

use salern_core::addr::PhysAddr;

use super::msr;
use crate::config;

/// Spurious interrupt vector register.
const REG_SVR: usize = 0xf0;
/// End-of-interrupt register.
const REG_EOI: usize = 0xb0;
/// Interrupt command register, low half.
const REG_ICR_LOW: usize = 0x300;
/// Interrupt command register, high half (destination).
const REG_ICR_HIGH: usize = 0x310;
/// Timer LVT entry.
const REG_LVT_TIMER: usize = 0x320;
/// Timer divide configuration.
const REG_TIMER_DIV: usize = 0x3e0;
/// Timer initial count.
const REG_TIMER_INIT: usize = 0x380;
/// Timer current count.
const REG_TIMER_CUR: usize = 0x390;
/// Local APIC ID register.
const REG_ID: usize = 0x20;

/// LVT timer periodic mode bit.
const TIMER_PERIODIC: u32 = 1 << 17;

/// ICR: level-assert, fixed delivery.
const ICR_ASSERT: u32 = 1 << 14;
/// ICR destination shorthand: all excluding self.
const ICR_ALL_BUT_SELF: u32 = 0b11 << 18;
/// ICR destination shorthand: self.
const ICR_SELF: u32 = 0b01 << 18;

static mut LAPIC_BASE: u64 = 0;

fn base() -> u64 {
    // SAFETY: Written once during BSP init before any reader.
    unsafe { LAPIC_BASE }
}

fn read(reg: usize) -> u32 {
    // SAFETY: The LAPIC MMIO window is mapped via the HHDM; registers
    // are 32-bit and 16-byte strided.
    unsafe { ((base() + reg as u64) as *const u32).read_volatile() }
}

fn write(reg: usize, value: u32) {
    // SAFETY: See read.
    unsafe { ((base() + reg as u64) as *mut u32).write_volatile(value) };
}

/// Maps and enables the local APIC on the calling CPU.
///
/// # Safety
///
/// Requires the HHDM to be initialized; must run once per CPU.
pub unsafe fn init(hhdm_offset: u64) {
    // SAFETY: IA32_APIC_BASE exists on every supported CPU.
    let apic_base = unsafe { msr::rdmsr(msr::IA32_APIC_BASE) };
    let phys = PhysAddr::new(apic_base & 0xf_ffff_f000);
    // SAFETY: Single store during per-CPU init; the physical base is
    // identical on every CPU.
    unsafe { LAPIC_BASE = phys.to_hhdm(hhdm_offset).as_u64() };
    // Globally enable (bit 11) in case firmware left it off.
    // SAFETY: Setting the enable bit with the same base.
    unsafe { msr::wrmsr(msr::IA32_APIC_BASE, apic_base | (1 << 11)) };
    // Software-enable with the spurious vector.
    write(REG_SVR, 0x100 | u32::from(super::vectors::SPURIOUS));
}

/// Returns the local APIC ID of the calling CPU.
#[must_use]
pub fn id() -> u32 {
    read(REG_ID) >> 24
}

/// Signals end-of-interrupt for the in-service vector.
pub fn eoi() {
    write(REG_EOI, 0);
}

/// Calibrates the timer against the TSC and starts it in periodic mode
/// at [`config::ARCH_TIMER_NS`] per tick.
pub fn timer_start(vector: u8) {
    // Divide by 16.
    write(REG_TIMER_DIV, 0b0011);

    // Measure how many timer ticks elapse in 10 ms of TSC time.
    const CAL_NS: u64 = 10_000_000;
    write(REG_TIMER_INIT, u32::MAX);
    super::tsc::busy_wait_ns(CAL_NS);
    let elapsed = u32::MAX - read(REG_TIMER_CUR);
    write(REG_TIMER_INIT, 0);

    let ticks_per_period =
        (u64::from(elapsed) * config::ARCH_TIMER_NS / CAL_NS).max(1) as u32;

    write(REG_LVT_TIMER, u32::from(vector) | TIMER_PERIODIC);
    write(REG_TIMER_INIT, ticks_per_period);
}

fn wait_icr_idle() {
    // Delivery-status bit 12.
    while read(REG_ICR_LOW) & (1 << 12) != 0 {
        super::cpu_relax();
    }
}

/// Sends an IPI to the CPU with the given LAPIC ID.
pub fn send_ipi(lapic_id: u32, vector: u8) {
    wait_icr_idle();
    write(REG_ICR_HIGH, lapic_id << 24);
    write(REG_ICR_LOW, u32::from(vector) | ICR_ASSERT);
}

/// Sends an IPI to every CPU except the caller.
pub fn broadcast_ipi(vector: u8) {
    wait_icr_idle();
    write(REG_ICR_LOW, u32::from(vector) | ICR_ASSERT | ICR_ALL_BUT_SELF);
}

/// Sends an IPI to the calling CPU.
pub fn self_ipi(vector: u8) {
    wait_icr_idle();
    write(REG_ICR_LOW, u32::from(vector) | ICR_ASSERT | ICR_SELF);
}

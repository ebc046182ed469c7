//! Symmetric multiprocessing bring-up.
//!
//! Application processors enter through the loader's `goto_address`
//! mechanism on a loader-provided stack, run the same per-CPU init the
//! BSP did, adopt that stack as their idle thread, and join the
//! scheduler.

use core::sync::atomic::{AtomicU32, Ordering};

use alloc::boxed::Box;

use crate::arch::x86_64::{gdt::Gdt, idt, lapic, vectors};
use crate::boot::{self, BootInfo};
use crate::config::MAX_CPUS;
use crate::mm::hhdm;
use crate::{percpu, sched};

/// CPUs that completed AP init (the BSP counts as one).
static ONLINE: AtomicU32 = AtomicU32::new(1);

/// Launches every application processor.
pub fn start_aps(boot: &'static impl BootInfo) {
    let total = boot.cpu_count().min(MAX_CPUS);
    if total <= 1 {
        crate::kinfo!("smp: single CPU");
        return;
    }
    for index in 1..total {
        if boot.start_ap(index, ap_entry, index as u64).is_none() {
            crate::kurgent!("smp: failed to start cpu {index}");
        }
    }
    // Wait for the herd; APs flip ONLINE as they finish.
    let deadline = crate::time::now_ns() + 1_000_000_000;
    while (ONLINE.load(Ordering::Acquire) as usize) < total {
        if crate::time::now_ns() > deadline {
            crate::kurgent!(
                "smp: only {}/{} CPUs came online",
                ONLINE.load(Ordering::Acquire),
                total
            );
            return;
        }
        crate::arch::cpu_relax();
    }
    crate::kinfo!("smp: {total} CPUs online");
}

/// First Rust code on an application processor.
extern "C" fn ap_entry(cpu_id: u64) -> ! {
    crate::arch::interrupts_disable();

    // A fresh GDT + TSS for this CPU, then the shared IDT.
    let gdt: &'static mut Gdt = Box::leak(Box::new(Gdt::new()));
    // SAFETY: The GDT is leaked ('static); interrupts are masked.
    unsafe { gdt.load() };
    // SAFETY: The BSP finished idt::init long before APs start.
    unsafe { idt::load() };

    // SAFETY: Once per AP, on that AP.
    let cpu = unsafe { percpu::init_ap(cpu_id as u32) };
    boot::record_gdt(cpu.cpu_id, gdt);

    // SAFETY: HHDM initialized by the BSP; one LAPIC init per CPU.
    unsafe { lapic::init(hhdm::offset()) };
    cpu.lapic_id.store(lapic::id(), Ordering::Relaxed);

    sched::init_cpu();
    lapic::timer_start(vectors::TIMER);

    ONLINE.fetch_add(1, Ordering::AcqRel);
    crate::kinfo!("smp: cpu {} online (lapic {})", cpu.cpu_id, lapic::id());

    crate::arch::interrupts_enable();
    boot::idle_loop();
}

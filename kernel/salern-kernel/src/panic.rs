//! Kernel panic.
//!
//! The panicking CPU broadcasts `IPI_PANIC` (every other CPU masks
//! interrupts and halts), dumps the saved context and the memory
//! statistics over the lock-free serial path, and parks itself.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch::x86_64::context::CpuContext;
use crate::arch::x86_64::{lapic, vectors};

static PANICKING: AtomicBool = AtomicBool::new(false);

/// Panic with a saved trap context (faults, "isr not set").
pub fn panic_with_context(ctx: &CpuContext, args: core::fmt::Arguments<'_>) -> ! {
    begin_panic(args);
    ctx.print();
    end_panic();
}

fn begin_panic(args: core::fmt::Arguments<'_>) {
    crate::arch::interrupts_disable();
    // A panic inside the panic path skips straight to the halt.
    if PANICKING.swap(true, Ordering::AcqRel) {
        crate::arch::halt_forever();
    }
    lapic::broadcast_ipi(vectors::IPI_PANIC);

    crate::log::panic_serial(format_args!("\n*** KERNEL PANIC ***\n{args}\n"));
    if crate::percpu::cpu_count() > 0 {
        crate::log::panic_serial(format_args!("cpu: {}\n", crate::percpu::cpu_get().cpu_id));
    }
}

fn end_panic() -> ! {
    // Memory statistics, if the PMM is far enough along to answer.
    if let Some(stats) = crate::mm::pmm::try_get_stats() {
        crate::log::panic_serial(format_args!(
            "mem: used={} free={} reserved={} total={}\n",
            stats.used, stats.free, stats.reserved, stats.total
        ));
    }
    crate::arch::halt_forever();
}

#[cfg(target_os = "none")]
#[panic_handler]
fn panic_handler(info: &core::panic::PanicInfo<'_>) -> ! {
    begin_panic(format_args!("{info}"));
    end_panic();
}

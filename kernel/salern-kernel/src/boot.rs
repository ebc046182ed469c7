//! Boot interface and kernel bring-up.
//!
//! The boot shim (`salern-boot`) parses the loader's responses and
//! hands the kernel a [`BootInfo`]; [`kernel_init`] runs the bring-up
//! sequence and becomes the BSP's idle loop.

use alloc::string::String;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use salern_abi::OpenFlags;
use salern_core::addr::PhysAddr;

use crate::arch::x86_64::{gdt::Gdt, idt, lapic, mmu, vectors};
use crate::config;
use crate::file::File;
use crate::mm::{hhdm, pmm, vmm};
use crate::proc::thread::Thread;
use crate::{fs, interrupt, percpu, proc, sched, smp, syscall, time, tty};

/// One entry of the boot memory map.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
    /// First byte.
    pub base: PhysAddr,
    /// Length in bytes.
    pub len: u64,
    /// Classification.
    pub kind: MemoryKind,
}

/// Memory-map entry type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    /// General-purpose RAM.
    Usable,
    /// Loader structures, reclaimable after boot.
    Reclaimable,
    /// The kernel image and modules.
    KernelAndModules,
    /// The framebuffer aperture.
    Framebuffer,
    /// Firmware-reserved.
    Reserved,
}

/// Framebuffer geometry from the loader.
#[derive(Debug, Clone, Copy)]
pub struct FramebufferInfo {
    /// Physical base of the aperture.
    pub phys: PhysAddr,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Bytes per scanline.
    pub pitch: u32,
    /// Bits per pixel.
    pub bpp: u32,
}

/// AP entry signature for [`BootInfo::start_ap`].
pub type ApEntry = extern "C" fn(u64) -> !;

/// Everything the loader published, behind one interface.
pub trait BootInfo: Sync {
    /// The memory map.
    fn memory_map(&self) -> impl Iterator<Item = MemoryRegion>;
    /// Higher-half direct map offset.
    fn hhdm_offset(&self) -> u64;
    /// Kernel image physical base.
    fn kernel_phys_base(&self) -> PhysAddr;
    /// Framebuffer, if the loader set one up.
    fn framebuffer(&self) -> Option<FramebufferInfo>;
    /// RSDP physical address, if present.
    fn rsdp(&self) -> Option<PhysAddr>;
    /// A loaded module by path.
    fn module(&self, path: &str) -> Option<&'static [u8]>;
    /// Number of CPUs (including the BSP).
    fn cpu_count(&self) -> usize;
    /// Launches AP number `index` (1-based among the non-BSP CPUs) at
    /// `entry` with `arg`. Returns its LAPIC id.
    fn start_ap(&self, index: usize, entry: ApEntry, arg: u64) -> Option<u32>;
}

// ---------------------------------------------------------------------------
// Per-CPU GDT storage
// ---------------------------------------------------------------------------

static mut BSP_GDT: Gdt = Gdt::new();

/// Per-CPU pointer to the live GDT, for TSS.RSP0 updates.
static GDT_PTRS: [AtomicU64; config::MAX_CPUS] =
    [const { AtomicU64::new(0) }; config::MAX_CPUS];

/// Loads the BSP GDT.
///
/// # Safety
///
/// Early boot only, interrupts masked.
pub(crate) unsafe fn bsp_gdt_load() {
    // SAFETY: Static storage, single early-boot caller.
    unsafe {
        let gdt = &mut *core::ptr::addr_of_mut!(BSP_GDT);
        gdt.load();
        GDT_PTRS[0].store(core::ptr::addr_of_mut!(BSP_GDT) as u64, Ordering::Release);
    }
}

/// Records an AP's leaked GDT for RSP0 updates.
pub(crate) fn record_gdt(cpu_id: u32, gdt: *mut Gdt) {
    GDT_PTRS[cpu_id as usize].store(gdt as u64, Ordering::Release);
}

/// Points this CPU's TSS.RSP0 at the incoming thread's kernel stack.
pub fn set_tss_rsp0(rsp: u64) {
    let cpu = percpu::cpu_get();
    let ptr = GDT_PTRS[cpu.cpu_id as usize].load(Ordering::Acquire);
    if ptr != 0 {
        // SAFETY: The pointer is this CPU's own GDT; only this CPU
        // writes its RSP0.
        unsafe { (*(ptr as *mut Gdt)).set_rsp0(rsp) };
    }
}

// ---------------------------------------------------------------------------
// Bring-up
// ---------------------------------------------------------------------------

/// Kernel entry, called by the boot shim on the BSP.
pub fn kernel_init(boot: &'static impl BootInfo) -> ! {
    crate::arch::interrupts_disable();

    // SAFETY: Early-boot singletons, in dependency order.
    unsafe {
        crate::log::serial_init();
    }
    crate::log::init_early_serial();
    if config::LOG_SHOW_SPLASH {
        crate::kurgent!("SalernOS kernel starting");
    }

    // SAFETY: BSP, interrupts masked, called once each.
    unsafe {
        time::init();
        bsp_gdt_load();
        idt::init();
        hhdm::init(boot.hhdm_offset());
        percpu::init_bsp();
        percpu::register_core_hooks();
    }
    pmm::init(boot);
    // SAFETY: The boot page table is live; capturing its kernel half.
    unsafe { mmu::capture_kernel_template() };

    // The heap is slab-on-PMM and needs no explicit init.
    crate::log::init_logger();

    interrupt::init();
    syscall::init();
    // SAFETY: HHDM is up; one LAPIC init per CPU.
    unsafe { lapic::init(hhdm::offset()) };
    percpu::cpu_get()
        .lapic_id
        .store(lapic::id(), Ordering::Relaxed);

    sched::init_cpu();
    lapic::timer_start(vectors::TIMER);

    sched::spawn_kthread("pmm-reaper", pmm::reaper_thread, 0)
        .expect("spawning pmm reaper");
    sched::spawn_kthread("vmm-reaper", vmm::reaper_thread, 0)
        .expect("spawning vmm reaper");
    sched::spawn_kthread("thread-reaper", sched::reaper_thread, 0)
        .expect("spawning thread reaper");

    fs::init(boot);
    if config::LOG_USE_VNODE {
        let _ = fs::devfs::register(
            None,
            "kmsg",
            Arc::new(crate::log::KmsgDev),
            salern_fs::VnodeType::CharDevice,
        );
    }
    tty::console::init();

    smp::start_aps(boot);

    spawn_init();

    crate::kurgent!("boot complete, entering idle");
    crate::arch::interrupts_enable();
    idle_loop();
}

/// The per-CPU idle loop (the adopted boot context).
pub(crate) fn idle_loop() -> ! {
    loop {
        crate::arch::x86_64::halt();
        // Something may have landed in the runqueue while we slept.
        sched::yield_now();
    }
}

/// Loads `INIT_PATH` as pid 1 with fds 0/1/2 on the console.
fn spawn_init() {
    let root = fs::root();
    let space = vmm::AddressSpace::new().expect("init address space");
    let init = proc::Process::new(space, 0, root.clone(), root);

    let argv = [String::from(config::INIT_PATH)];
    let (space, ctx) = match proc::exec::build_image(&init, config::INIT_PATH, &argv, &[]) {
        Ok(built) => built,
        Err(e) => {
            crate::kurgent!("init: cannot load {}: {e}", config::INIT_PATH);
            return;
        }
    };
    let old = init.replace_space(space);
    drop(old);

    // Standard descriptors on the console.
    {
        let console = salern_fs::lookup::resolve(
            "/dev/console",
            &init.root.lock().clone(),
            &init.cwd.lock().clone(),
            true,
        )
        .expect("init: /dev/console missing");
        let mut fds = init.fds.lock();
        fds.insert_at(0, File::new(console.clone(), OpenFlags::RDONLY), false)
            .expect("stdin");
        fds.insert_at(1, File::new(console.clone(), OpenFlags::WRONLY), false)
            .expect("stdout");
        fds.insert_at(2, File::new(console, OpenFlags::WRONLY), false)
            .expect("stderr");
    }

    let thread = Thread::new_user(&init, ctx).expect("init thread");
    init.attach_thread(thread.clone());
    sched::enqueue(thread);
    crate::kinfo!("init: pid {} started from {}", init.pid, config::INIT_PATH);
}

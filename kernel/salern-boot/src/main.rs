//! Limine boot shim.
//!
//! Publishes the protocol requests, translates the responses into the
//! kernel's [`BootInfo`] view, and jumps into `kernel_init`. Also owns
//! the AP trampoline that adapts the loader's "called with a pointer to
//! my CPU structure" convention to the kernel's plain-argument entry.

#![no_std]
#![no_main]

mod protocol;

use core::sync::atomic::{AtomicU64, Ordering};

use salern_core::addr::PhysAddr;
use salern_kernel::boot::{
    ApEntry, BootInfo, FramebufferInfo, MemoryKind, MemoryRegion,
};

use protocol::{
    BaseRevision, ExecutableAddressRequest, FramebufferRequest, HhdmRequest, MemmapRequest,
    ModuleRequest, MpCpu, MpRequest, RequestsEndMarker, RequestsStartMarker, RsdpRequest,
    memmap_type,
};

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

#[used]
#[unsafe(link_section = ".limine_requests_start")]
static START_MARKER: RequestsStartMarker = RequestsStartMarker::new();

#[used]
#[unsafe(link_section = ".limine_requests")]
static BASE_REVISION: BaseRevision = BaseRevision::new();

#[used]
#[unsafe(link_section = ".limine_requests")]
static MEMMAP: MemmapRequest = MemmapRequest::new();

#[used]
#[unsafe(link_section = ".limine_requests")]
static HHDM: HhdmRequest = HhdmRequest::new();

#[used]
#[unsafe(link_section = ".limine_requests")]
static EXEC_ADDR: ExecutableAddressRequest = ExecutableAddressRequest::new();

#[used]
#[unsafe(link_section = ".limine_requests")]
static FRAMEBUFFER: FramebufferRequest = FramebufferRequest::new();

#[used]
#[unsafe(link_section = ".limine_requests")]
static RSDP: RsdpRequest = RsdpRequest::new();

#[used]
#[unsafe(link_section = ".limine_requests")]
static MODULES: ModuleRequest = ModuleRequest::new();

#[used]
#[unsafe(link_section = ".limine_requests")]
static MP: MpRequest = MpRequest::new();

#[used]
#[unsafe(link_section = ".limine_requests_end")]
static END_MARKER: RequestsEndMarker = RequestsEndMarker::new();

// ---------------------------------------------------------------------------
// BootInfo implementation
// ---------------------------------------------------------------------------

struct LimineBootInfo;

static BOOT_INFO: LimineBootInfo = LimineBootInfo;

impl BootInfo for LimineBootInfo {
    fn memory_map(&self) -> impl Iterator<Item = MemoryRegion> {
        MEMMAP
            .response()
            .into_iter()
            .flat_map(|r| r.entries())
            .map(|e| MemoryRegion {
                base: PhysAddr::new(e.base),
                len: e.length,
                kind: match e.entry_type {
                    memmap_type::USABLE => MemoryKind::Usable,
                    memmap_type::BOOTLOADER_RECLAIMABLE | memmap_type::ACPI_RECLAIMABLE => {
                        MemoryKind::Reclaimable
                    }
                    memmap_type::KERNEL_AND_MODULES => MemoryKind::KernelAndModules,
                    memmap_type::FRAMEBUFFER => MemoryKind::Framebuffer,
                    _ => MemoryKind::Reserved,
                },
            })
    }

    fn hhdm_offset(&self) -> u64 {
        HHDM.response().expect("loader: no HHDM response").offset
    }

    fn kernel_phys_base(&self) -> PhysAddr {
        PhysAddr::new(
            EXEC_ADDR
                .response()
                .expect("loader: no address response")
                .physical_base,
        )
    }

    fn framebuffer(&self) -> Option<FramebufferInfo> {
        let fb = FRAMEBUFFER.response()?.first()?;
        Some(FramebufferInfo {
            // The loader hands out the HHDM alias.
            phys: PhysAddr::new(fb.address - self.hhdm_offset()),
            width: fb.width as u32,
            height: fb.height as u32,
            pitch: fb.pitch as u32,
            bpp: u32::from(fb.bpp),
        })
    }

    fn rsdp(&self) -> Option<PhysAddr> {
        RSDP.response().map(|r| PhysAddr::new(r.address))
    }

    fn module(&self, path: &str) -> Option<&'static [u8]> {
        MODULES
            .response()?
            .modules()
            .find(|m| m.path_str() == path)
            .map(protocol::LimineFile::data)
    }

    fn cpu_count(&self) -> usize {
        MP.response().map_or(1, protocol::MpResponse::cpu_count)
    }

    fn start_ap(&self, index: usize, entry: ApEntry, arg: u64) -> Option<u32> {
        let mp = MP.response()?;
        AP_KERNEL_ENTRY.store(entry as usize as u64, Ordering::Release);
        let cpu = mp
            .cpus()
            .filter(|c| c.lapic_id != mp.bsp_lapic_id)
            .nth(index - 1)?;
        cpu.extra_argument.store(arg, Ordering::Release);
        cpu.goto_address
            .store(ap_trampoline as usize as u64, Ordering::Release);
        Some(cpu.lapic_id)
    }
}

/// The kernel entry every AP jumps to.
static AP_KERNEL_ENTRY: AtomicU64 = AtomicU64::new(0);

/// The loader calls this with a pointer to the CPU's [`MpCpu`].
extern "C" fn ap_trampoline(info: *const MpCpu) -> ! {
    // SAFETY: The loader passes its own static per-CPU structure.
    let info = unsafe { &*info };
    let arg = info.extra_argument.load(Ordering::Acquire);
    let entry = AP_KERNEL_ENTRY.load(Ordering::Acquire);
    // SAFETY: start_ap stored a valid ApEntry before the launch.
    let entry: ApEntry = unsafe { core::mem::transmute(entry as usize) };
    entry(arg)
}

// ---------------------------------------------------------------------------
// Entry
// ---------------------------------------------------------------------------

#[unsafe(no_mangle)]
extern "C" fn _start() -> ! {
    salern_kernel::kernel_init(&BOOT_INFO)
}

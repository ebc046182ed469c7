//! Limine boot protocol structures.
//!
//! Request/response pairs live in dedicated linker sections the loader
//! scans before handing off. Only the features the kernel consumes are
//! declared: memory map, HHDM, executable address, framebuffer, RSDP,
//! modules, and MP (SMP) startup.

#![allow(dead_code)]

use core::sync::atomic::AtomicU64;

const COMMON_MAGIC: [u64; 2] = [0xc7b1_dd30_df4c_8b88, 0x0a82_e883_a194_f07b];

/// Base-revision tag: declares which protocol revision we speak.
#[repr(C)]
pub struct BaseRevision {
    magic: [u64; 2],
    revision: u64,
}

impl BaseRevision {
    pub const fn new() -> Self {
        Self {
            magic: [0xf956_2b2d_5c95_a6c8, 0x6a7b_3849_4453_6bdc],
            revision: 3,
        }
    }
}

/// Start marker for the requests section.
#[repr(C)]
pub struct RequestsStartMarker {
    magic: [u64; 4],
}

impl RequestsStartMarker {
    pub const fn new() -> Self {
        Self {
            magic: [
                0xf6b8_f4b3_9de7_d1ae,
                0xfab9_1a69_40fc_b9cf,
                0x785c_6ed0_15d3_e316,
                0x181d_5de3_0bd8_801a,
            ],
        }
    }
}

/// End marker for the requests section.
#[repr(C)]
pub struct RequestsEndMarker {
    magic: [u64; 2],
}

impl RequestsEndMarker {
    pub const fn new() -> Self {
        Self {
            magic: [0xadc0_e053_1bb1_0d03, 0x9572_709f_3176_4c62],
        }
    }
}

macro_rules! request {
    ($(#[$doc:meta])* $name:ident, $response:ty, [$id2:expr, $id3:expr]) => {
        $(#[$doc])*
        #[repr(C)]
        pub struct $name {
            id: [u64; 4],
            revision: u64,
            response: *mut $response,
        }

        impl $name {
            pub const fn new() -> Self {
                Self {
                    id: [COMMON_MAGIC[0], COMMON_MAGIC[1], $id2, $id3],
                    revision: 0,
                    response: core::ptr::null_mut(),
                }
            }

            /// The loader's response, if it honored the request.
            pub fn response(&self) -> Option<&'static $response> {
                // SAFETY: The loader writes a valid pointer (or leaves
                // null) before the kernel runs; responses are static.
                unsafe {
                    (self.response as *const $response).as_ref()
                }
            }
        }

        // SAFETY: Written by the loader before any kernel code runs;
        // read-only afterwards.
        unsafe impl Sync for $name {}
    };
}

// ---------------------------------------------------------------------------
// Memory map
// ---------------------------------------------------------------------------

/// Memory-map entry types.
pub mod memmap_type {
    /// General-purpose RAM.
    pub const USABLE: u64 = 0;
    /// Firmware-reserved.
    pub const RESERVED: u64 = 1;
    /// ACPI tables, reclaimable.
    pub const ACPI_RECLAIMABLE: u64 = 2;
    /// ACPI non-volatile storage.
    pub const ACPI_NVS: u64 = 3;
    /// Defective RAM.
    pub const BAD_MEMORY: u64 = 4;
    /// Loader structures, reclaimable once parsed.
    pub const BOOTLOADER_RECLAIMABLE: u64 = 5;
    /// Kernel image and modules.
    pub const KERNEL_AND_MODULES: u64 = 6;
    /// Framebuffer aperture.
    pub const FRAMEBUFFER: u64 = 7;
}

/// One memory-map entry.
#[repr(C)]
pub struct MemmapEntry {
    pub base: u64,
    pub length: u64,
    pub entry_type: u64,
}

/// Memory-map response.
#[repr(C)]
pub struct MemmapResponse {
    revision: u64,
    entry_count: u64,
    entries: *const *const MemmapEntry,
}

impl MemmapResponse {
    pub fn entries(&self) -> impl Iterator<Item = &'static MemmapEntry> + '_ {
        // SAFETY: The loader provides entry_count valid pointers.
        (0..self.entry_count as usize)
            .map(move |i| unsafe { &**self.entries.add(i) })
    }
}

// SAFETY: Loader-written, read-only at runtime.
unsafe impl Sync for MemmapResponse {}

request!(
    /// Memory-map request.
    MemmapRequest, MemmapResponse,
    [0x67cf_3d9d_378a_806f, 0xe304_acdf_c50c_3c62]
);

// ---------------------------------------------------------------------------
// HHDM
// ---------------------------------------------------------------------------

/// HHDM response.
#[repr(C)]
pub struct HhdmResponse {
    revision: u64,
    /// The direct-map offset.
    pub offset: u64,
}

unsafe impl Sync for HhdmResponse {}

request!(
    /// Higher-half direct map request.
    HhdmRequest, HhdmResponse,
    [0x48dc_f1cb_8ad2_b852, 0x6398_4e95_9a98_244b]
);

// ---------------------------------------------------------------------------
// Executable address
// ---------------------------------------------------------------------------

/// Kernel address response.
#[repr(C)]
pub struct ExecutableAddressResponse {
    revision: u64,
    /// Physical load base.
    pub physical_base: u64,
    /// Virtual base.
    pub virtual_base: u64,
}

unsafe impl Sync for ExecutableAddressResponse {}

request!(
    /// Kernel load-address request.
    ExecutableAddressRequest, ExecutableAddressResponse,
    [0x71ba_7686_3cc5_5f63, 0xb264_4a48_c516_a487]
);

// ---------------------------------------------------------------------------
// Framebuffer
// ---------------------------------------------------------------------------

/// One framebuffer.
#[repr(C)]
pub struct Framebuffer {
    /// HHDM-virtual base of the aperture.
    pub address: u64,
    pub width: u64,
    pub height: u64,
    pub pitch: u64,
    pub bpp: u16,
    pub memory_model: u8,
    pub red_mask_size: u8,
    pub red_mask_shift: u8,
    pub green_mask_size: u8,
    pub green_mask_shift: u8,
    pub blue_mask_size: u8,
    pub blue_mask_shift: u8,
    unused: [u8; 7],
    pub edid_size: u64,
    pub edid: u64,
}

/// Framebuffer response.
#[repr(C)]
pub struct FramebufferResponse {
    revision: u64,
    framebuffer_count: u64,
    framebuffers: *const *const Framebuffer,
}

impl FramebufferResponse {
    pub fn first(&self) -> Option<&'static Framebuffer> {
        if self.framebuffer_count == 0 {
            return None;
        }
        // SAFETY: Count checked; the loader provides valid pointers.
        Some(unsafe { &**self.framebuffers })
    }
}

unsafe impl Sync for FramebufferResponse {}

request!(
    /// Framebuffer request.
    FramebufferRequest, FramebufferResponse,
    [0x9d58_27dc_d881_dd75, 0xa314_8604_f6fa_b11b]
);

// ---------------------------------------------------------------------------
// RSDP
// ---------------------------------------------------------------------------

/// RSDP response.
#[repr(C)]
pub struct RsdpResponse {
    revision: u64,
    /// RSDP address.
    pub address: u64,
}

unsafe impl Sync for RsdpResponse {}

request!(
    /// ACPI RSDP request.
    RsdpRequest, RsdpResponse,
    [0xc5e7_7b6b_397e_7b43, 0x2763_7845_accd_cf3c]
);

// ---------------------------------------------------------------------------
// Modules
// ---------------------------------------------------------------------------

/// A loaded file (module).
#[repr(C)]
pub struct LimineFile {
    revision: u64,
    /// HHDM-virtual base of the contents.
    pub address: u64,
    /// Size in bytes.
    pub size: u64,
    /// NUL-terminated path.
    pub path: *const u8,
    cmdline: *const u8,
    media_type: u32,
    unused: u32,
    tftp_ip: u32,
    tftp_port: u32,
    partition_index: u32,
    mbr_disk_id: u32,
    gpt_disk_uuid: [u64; 2],
    gpt_part_uuid: [u64; 2],
    part_uuid: [u64; 2],
}

impl LimineFile {
    pub fn path_str(&self) -> &'static str {
        // SAFETY: The loader NUL-terminates module paths.
        unsafe {
            let mut len = 0;
            while *self.path.add(len) != 0 {
                len += 1;
            }
            core::str::from_utf8_unchecked(core::slice::from_raw_parts(self.path, len))
        }
    }

    pub fn data(&self) -> &'static [u8] {
        // SAFETY: The loader maps the module at `address` for `size`.
        unsafe { core::slice::from_raw_parts(self.address as *const u8, self.size as usize) }
    }
}

/// Module response.
#[repr(C)]
pub struct ModuleResponse {
    revision: u64,
    module_count: u64,
    modules: *const *const LimineFile,
}

impl ModuleResponse {
    pub fn modules(&self) -> impl Iterator<Item = &'static LimineFile> + '_ {
        // SAFETY: The loader provides module_count valid pointers.
        (0..self.module_count as usize)
            .map(move |i| unsafe { &**self.modules.add(i) })
    }
}

unsafe impl Sync for ModuleResponse {}

request!(
    /// Modules request.
    ModuleRequest, ModuleResponse,
    [0x3e7e_2797_02be_32af, 0xca1c_4f3b_d128_0cee]
);

// ---------------------------------------------------------------------------
// MP (SMP)
// ---------------------------------------------------------------------------

/// Per-CPU info from the loader.
#[repr(C)]
pub struct MpCpu {
    /// ACPI processor id.
    pub processor_id: u32,
    /// Local APIC id.
    pub lapic_id: u32,
    reserved: u64,
    /// Writing a function pointer here launches the CPU into it with a
    /// pointer to this structure in the first argument register.
    pub goto_address: AtomicU64,
    /// Free slot for the kernel.
    pub extra_argument: AtomicU64,
}

/// MP response.
#[repr(C)]
pub struct MpResponse {
    revision: u64,
    flags: u32,
    /// The BSP's LAPIC id.
    pub bsp_lapic_id: u32,
    cpu_count: u64,
    cpus: *const *const MpCpu,
}

impl MpResponse {
    pub fn cpu_count(&self) -> usize {
        self.cpu_count as usize
    }

    pub fn cpus(&self) -> impl Iterator<Item = &'static MpCpu> + '_ {
        // SAFETY: The loader provides cpu_count valid pointers.
        (0..self.cpu_count as usize).map(move |i| unsafe { &**self.cpus.add(i) })
    }
}

unsafe impl Sync for MpResponse {}

/// MP request (carries an extra flags word).
#[repr(C)]
pub struct MpRequest {
    id: [u64; 4],
    revision: u64,
    response: *mut MpResponse,
    flags: u64,
}

impl MpRequest {
    pub const fn new() -> Self {
        Self {
            id: [
                COMMON_MAGIC[0],
                COMMON_MAGIC[1],
                0x95a6_7b81_9a1b_857e,
                0xa0b6_1b72_3b6a_73e0,
            ],
            revision: 0,
            response: core::ptr::null_mut(),
            flags: 0,
        }
    }

    /// The loader's response, if SMP information was provided.
    pub fn response(&self) -> Option<&'static MpResponse> {
        // SAFETY: See the request! macro.
        unsafe { (self.response as *const MpResponse).as_ref() }
    }
}

unsafe impl Sync for MpRequest {}

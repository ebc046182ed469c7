//! Memory syscalls: mmap, munmap, sysinfo.

use salern_abi::{Errno, MmapFlags, MmapProt};
use salern_core::addr::{PAGE_SHIFT, PhysAddr, VirtAddr};
use salern_mm::freelist::FrameStats;

use crate::arch::x86_64::context::CpuContext;
use crate::arch::x86_64::mmu::PteFlags;
use crate::mm::pmm;
use crate::mm::vmm::VmmFlags;
use crate::proc;
use crate::syscall::{SyscallResult, userptr};

fn prot_to_pte(prot: MmapProt) -> PteFlags {
    let mut pte = PteFlags::USER;
    if prot.contains(MmapProt::WRITE) {
        pte |= PteFlags::WRITE;
    }
    if !prot.contains(MmapProt::EXEC) {
        pte |= PteFlags::NOEXEC;
    }
    pte
}

/// `mmap(hint, len, prot << 32 | flags, fd << 32 | page_offset)`.
///
/// Four-register syscall ABI: prot/flags and fd/offset share words.
pub fn sys_mmap(
    _ctx: &mut CpuContext,
    hint: u64,
    len: u64,
    prot_flags: u64,
    fd_off: u64,
) -> SyscallResult {
    let result = (|| {
        let proc = proc::current().ok_or(Errno::Esrch)?;
        let prot = MmapProt::from_bits_truncate((prot_flags >> 32) as u32);
        let flags = MmapFlags::from_bits_truncate(prot_flags as u32);
        let fd = (fd_off >> 32) as i32;
        let page_off = fd_off as u32 as u64;

        if len == 0 {
            return Err(Errno::Einval);
        }
        if flags.contains(MmapFlags::FIXED) && hint == 0 {
            // A fixed mapping at null is never meaningful.
            return Err(Errno::Einval);
        }

        let mut vmm_flags = VmmFlags::empty();
        if flags.contains(MmapFlags::FIXED) {
            vmm_flags |= VmmFlags::EXACT | VmmFlags::REPLACE;
        }
        if hint == 0 {
            vmm_flags |= VmmFlags::NOHINT;
        }
        if flags.contains(MmapFlags::SHARED) {
            vmm_flags |= VmmFlags::SHARED;
        }

        let space = proc.space();
        let base = if flags.contains(MmapFlags::ANONYMOUS) {
            vmm_flags |= VmmFlags::ANONYMOUS;
            space.map(
                VirtAddr::new(hint),
                PhysAddr::zero(),
                len as usize,
                vmm_flags,
                prot_to_pte(prot),
                None,
                0,
            )?
        } else {
            let file = proc.fds.lock().get(fd)?;
            vmm_flags |= VmmFlags::FILE;
            space.map(
                VirtAddr::new(hint),
                PhysAddr::zero(),
                len as usize,
                vmm_flags,
                prot_to_pte(prot),
                Some(file.vnode.clone()),
                page_off << PAGE_SHIFT,
            )?
        };
        Ok(base.as_u64())
    })();
    SyscallResult::from_result(result)
}

pub fn sys_munmap(
    _ctx: &mut CpuContext,
    addr: u64,
    len: u64,
    _a3: u64,
    _a4: u64,
) -> SyscallResult {
    let result = (|| {
        let proc = proc::current().ok_or(Errno::Esrch)?;
        proc.space().unmap(VirtAddr::new(addr), len as usize)?;
        Ok(0)
    })();
    SyscallResult::from_result(result)
}

/// The structure `sysinfo` writes to userspace.
#[derive(Clone, Copy)]
#[repr(C)]
struct SysInfo {
    uptime_ns: u64,
    total_ram: u64,
    free_ram: u64,
    used_ram: u64,
    procs: u32,
    _pad: u32,
}

pub fn sys_sysinfo(
    _ctx: &mut CpuContext,
    ptr: u64,
    _a2: u64,
    _a3: u64,
    _a4: u64,
) -> SyscallResult {
    let result = (|| {
        let mut stats = FrameStats::default();
        pmm::get_stats(&mut stats);
        let info = SysInfo {
            uptime_ns: crate::time::now_ns(),
            total_ram: stats.total,
            free_ram: stats.free,
            used_ram: stats.used,
            procs: 0,
            _pad: 0,
        };
        userptr::write_struct(ptr, &info)?;
        Ok(0)
    })();
    SyscallResult::from_result(result)
}

//! User-pointer access.
//!
//! Syscalls run with the calling process's page table active, so user
//! memory is directly addressable — after validation. Every access
//! first walks the range, faulting lazy pages in through the normal VMM
//! path and rejecting anything that does not resolve to a user mapping
//! with the required permission. A hostile pointer therefore surfaces
//! as `EFAULT`, never as a kernel fault.

use alloc::string::String;
use alloc::vec::Vec;

use salern_abi::{Errno, PATH_MAX};
use salern_core::addr::{KSPACE_START, PAGE_SIZE, VirtAddr};

use crate::arch::x86_64::mmu::PteFlags;
use crate::proc;

/// Validates (and faults in) `[addr, addr+len)` for user access.
pub fn check(addr: u64, len: usize, write: bool) -> Result<(), Errno> {
    if len == 0 {
        return Ok(());
    }
    let end = addr.checked_add(len as u64).ok_or(Errno::Efault)?;
    if addr == 0 || end > KSPACE_START {
        return Err(Errno::Efault);
    }
    let proc = proc::current().ok_or(Errno::Efault)?;
    let space = proc.space();

    let mut page = VirtAddr::new(addr).page_base();
    while page.as_u64() < end {
        let ok = match space.table().translate(page) {
            Some((_, flags)) => {
                flags.contains(PteFlags::USER)
                    && (!write || flags.contains(PteFlags::WRITE) || flags.is_cow())
            }
            None => false,
        };
        if !ok && !space.handle_fault(page, write) {
            return Err(Errno::Efault);
        }
        if ok && write {
            // Write access to a COW page: break the share now, while we
            // are in a context that can allocate.
            if let Some((_, flags)) = space.table().translate(page) {
                if flags.is_cow() && !space.handle_fault(page, true) {
                    return Err(Errno::Efault);
                }
            }
        }
        page = page + PAGE_SIZE as u64;
    }
    Ok(())
}

/// Copies `len` bytes from user memory.
pub fn copy_in(addr: u64, len: usize) -> Result<Vec<u8>, Errno> {
    check(addr, len, false)?;
    let mut buf = alloc::vec![0u8; len];
    // SAFETY: Range validated user memory under the active page table.
    unsafe {
        core::ptr::copy_nonoverlapping(addr as *const u8, buf.as_mut_ptr(), len);
    }
    Ok(buf)
}

/// Copies bytes out to user memory.
pub fn copy_out(addr: u64, data: &[u8]) -> Result<(), Errno> {
    check(addr, data.len(), true)?;
    // SAFETY: Range validated writable user memory.
    unsafe {
        core::ptr::copy_nonoverlapping(data.as_ptr(), addr as *mut u8, data.len());
    }
    Ok(())
}

/// Reads a `#[repr(C)]` value from user memory.
pub fn read_struct<T: Copy>(addr: u64) -> Result<T, Errno> {
    check(addr, size_of::<T>(), false)?;
    // SAFETY: Range validated; read_unaligned tolerates any alignment.
    Ok(unsafe { core::ptr::read_unaligned(addr as *const T) })
}

/// Writes a `#[repr(C)]` value to user memory.
pub fn write_struct<T: Copy>(addr: u64, value: &T) -> Result<(), Errno> {
    check(addr, size_of::<T>(), true)?;
    // SAFETY: Range validated writable.
    unsafe { core::ptr::write_unaligned(addr as *mut T, *value) };
    Ok(())
}

/// Reads a NUL-terminated user string, bounded by [`PATH_MAX`].
pub fn read_cstr(addr: u64) -> Result<String, Errno> {
    let mut bytes = Vec::new();
    let mut cursor = addr;
    loop {
        if bytes.len() >= PATH_MAX {
            return Err(Errno::Enametoolong);
        }
        check(cursor, 1, false)?;
        // SAFETY: Single validated byte.
        let byte = unsafe { *(cursor as *const u8) };
        if byte == 0 {
            break;
        }
        bytes.push(byte);
        cursor += 1;
    }
    String::from_utf8(bytes).map_err(|_| Errno::Einval)
}

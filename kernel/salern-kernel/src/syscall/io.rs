//! Byte I/O syscalls: read, write, readv, writev, kprint.

use alloc::vec::Vec;

use salern_abi::sockaddr::IoVec;
use salern_abi::{Errno, OpenFlags};
use salern_core::ioviter::IovIter;
use salern_fs::VnodeType;

use crate::arch::x86_64::context::CpuContext;
use crate::file::FileRef;
use crate::proc;
use crate::syscall::{SyscallResult, userptr};

/// Whether this vnode type ignores file offsets.
fn is_stream(file: &FileRef) -> bool {
    matches!(
        file.vnode.vtype,
        VnodeType::CharDevice | VnodeType::Fifo | VnodeType::Socket
    )
}

fn do_read(file: &FileRef, buf: &mut [u8]) -> Result<usize, Errno> {
    if !file.readable() {
        return Err(Errno::Ebadf);
    }
    if is_stream(file) {
        return file.vnode.ops().read(&file.vnode, buf, 0);
    }
    let mut offset = file.offset.lock();
    let n = file.vnode.ops().read(&file.vnode, buf, *offset)?;
    *offset += n as u64;
    Ok(n)
}

fn do_write(file: &FileRef, buf: &[u8]) -> Result<usize, Errno> {
    if !file.writable() {
        return Err(Errno::Ebadf);
    }
    if is_stream(file) {
        return file.vnode.ops().write(&file.vnode, buf, 0);
    }
    let mut offset = file.offset.lock();
    if file.flags.lock().contains(OpenFlags::APPEND) {
        *offset = file.vnode.ops().size(&file.vnode);
    }
    let n = file.vnode.ops().write(&file.vnode, buf, *offset)?;
    *offset += n as u64;
    Ok(n)
}

pub fn sys_read(
    _ctx: &mut CpuContext,
    fd: u64,
    buf: u64,
    len: u64,
    _a4: u64,
) -> SyscallResult {
    let result = (|| {
        let proc = proc::current().ok_or(Errno::Esrch)?;
        let file = proc.fds.lock().get(fd as i32)?;
        let mut kbuf = alloc::vec![0u8; len as usize];
        let n = do_read(&file, &mut kbuf)?;
        userptr::copy_out(buf, &kbuf[..n])?;
        Ok(n as u64)
    })();
    SyscallResult::from_result(result)
}

pub fn sys_write(
    _ctx: &mut CpuContext,
    fd: u64,
    buf: u64,
    len: u64,
    _a4: u64,
) -> SyscallResult {
    let result = (|| {
        let proc = proc::current().ok_or(Errno::Esrch)?;
        let file = proc.fds.lock().get(fd as i32)?;
        let kbuf = userptr::copy_in(buf, len as usize)?;
        let n = do_write(&file, &kbuf)?;
        Ok(n as u64)
    })();
    SyscallResult::from_result(result)
}

fn read_iovs(iov_ptr: u64, iov_count: u64) -> Result<Vec<IoVec>, Errno> {
    if iov_count > 1024 {
        return Err(Errno::Einval);
    }
    let raw = userptr::copy_in(iov_ptr, iov_count as usize * size_of::<IoVec>())?;
    let mut iovs = Vec::with_capacity(iov_count as usize);
    for chunk in raw.chunks_exact(size_of::<IoVec>()) {
        // SAFETY: IoVec is a plain #[repr(C)] pair of u64s.
        iovs.push(unsafe { core::ptr::read_unaligned(chunk.as_ptr().cast::<IoVec>()) });
    }
    Ok(iovs)
}

pub fn sys_readv(
    _ctx: &mut CpuContext,
    fd: u64,
    iov_ptr: u64,
    iov_count: u64,
    _a4: u64,
) -> SyscallResult {
    let result = (|| {
        let proc = proc::current().ok_or(Errno::Esrch)?;
        let file = proc.fds.lock().get(fd as i32)?;
        let iovs = read_iovs(iov_ptr, iov_count)?;
        let mut iter = IovIter::new(&iovs);
        let mut kbuf = alloc::vec![0u8; iter.total_len()];
        let n = do_read(&file, &mut kbuf)?;
        let mut done = 0;
        while done < n {
            let Some((addr, len)) = iter.next_window(n - done) else {
                break;
            };
            userptr::copy_out(addr, &kbuf[done..done + len])?;
            done += len;
        }
        Ok(done as u64)
    })();
    SyscallResult::from_result(result)
}

pub fn sys_writev(
    _ctx: &mut CpuContext,
    fd: u64,
    iov_ptr: u64,
    iov_count: u64,
    _a4: u64,
) -> SyscallResult {
    let result = (|| {
        let proc = proc::current().ok_or(Errno::Esrch)?;
        let file = proc.fds.lock().get(fd as i32)?;
        let iovs = read_iovs(iov_ptr, iov_count)?;
        let mut iter = IovIter::new(&iovs);
        let mut kbuf = Vec::with_capacity(iter.total_len());
        while let Some((addr, len)) = iter.next_window(usize::MAX) {
            kbuf.extend_from_slice(&userptr::copy_in(addr, len)?);
        }
        let n = do_write(&file, &kbuf)?;
        Ok(n as u64)
    })();
    SyscallResult::from_result(result)
}

pub fn sys_kprint(
    _ctx: &mut CpuContext,
    buf: u64,
    len: u64,
    _a3: u64,
    _a4: u64,
) -> SyscallResult {
    let result = (|| {
        let kbuf = userptr::copy_in(buf, (len as usize).min(1024))?;
        let text = core::str::from_utf8(&kbuf).map_err(|_| Errno::Einval)?;
        crate::klog!(
            salern_core::log::LogLevel::User,
            "{}",
            text.trim_end_matches('\n')
        );
        Ok(kbuf.len() as u64)
    })();
    SyscallResult::from_result(result)
}

//! Filesystem syscalls.

use salern_abi::{
    AT_FDCWD, AT_REMOVEDIR, AT_SYMLINK_NOFOLLOW, Errno, OpenFlags, Whence, fcntl,
};
use salern_fs::{FileAttr, UnlinkFlags, VnodeType};

use crate::arch::x86_64::context::CpuContext;
use crate::file::File;
use crate::fs;
use crate::proc;
use crate::syscall::{SyscallResult, userptr};

pub fn sys_openat(
    _ctx: &mut CpuContext,
    dirfd: u64,
    path_ptr: u64,
    flags: u64,
    mode: u64,
) -> SyscallResult {
    let result = (|| {
        let proc = proc::current().ok_or(Errno::Esrch)?;
        let path = userptr::read_cstr(path_ptr)?;
        let flags = OpenFlags::from_bits_truncate(flags as u32);
        let dirfd = dirfd as i32;

        let vnode = if flags.contains(OpenFlags::CREAT) {
            let (parent, name) = fs::parent_at(&proc, dirfd, &path)?;
            match parent.ops().lookup(&parent, name) {
                Ok(existing) => {
                    if flags.contains(OpenFlags::EXCL) {
                        return Err(Errno::Eexist);
                    }
                    existing
                }
                Err(Errno::Enoent) => parent.ops().create(
                    &parent,
                    name,
                    FileAttr {
                        mode: mode as u32 & 0o7777,
                    },
                )?,
                Err(e) => return Err(e),
            }
        } else {
            fs::resolve_at(&proc, dirfd, &path, true)?
        };

        if flags.contains(OpenFlags::DIRECTORY) && vnode.vtype != VnodeType::Directory {
            return Err(Errno::Enotdir);
        }
        if vnode.vtype == VnodeType::Directory
            && flags.intersects(OpenFlags::WRONLY | OpenFlags::RDWR)
        {
            return Err(Errno::Eisdir);
        }
        if flags.contains(OpenFlags::TRUNC) && vnode.vtype == VnodeType::Regular {
            vnode.ops().truncate(&vnode, 0)?;
        }

        let cloexec = flags.contains(OpenFlags::CLOEXEC);
        let file = File::new(vnode, flags);
        let fd = proc.fds.lock().insert(file, cloexec, 0)?;
        Ok(fd as u64)
    })();
    SyscallResult::from_result(result)
}

pub fn sys_close(_ctx: &mut CpuContext, fd: u64, _a2: u64, _a3: u64, _a4: u64) -> SyscallResult {
    let result = (|| {
        let proc = proc::current().ok_or(Errno::Esrch)?;
        proc.fds.lock().close(fd as i32)?;
        Ok(0)
    })();
    SyscallResult::from_result(result)
}

pub fn sys_dup3(
    _ctx: &mut CpuContext,
    old: u64,
    new: u64,
    flags: u64,
    _a4: u64,
) -> SyscallResult {
    let result = (|| {
        let proc = proc::current().ok_or(Errno::Esrch)?;
        let cloexec = OpenFlags::from_bits_truncate(flags as u32).contains(OpenFlags::CLOEXEC);
        let fd = proc.fds.lock().dup3(old as i32, new as i32, cloexec)?;
        Ok(fd as u64)
    })();
    SyscallResult::from_result(result)
}

pub fn sys_fcntl(
    _ctx: &mut CpuContext,
    fd: u64,
    cmd: u64,
    arg: u64,
    _a4: u64,
) -> SyscallResult {
    let result = (|| {
        let proc = proc::current().ok_or(Errno::Esrch)?;
        let mut fds = proc.fds.lock();
        match cmd as u32 {
            fcntl::F_DUPFD | fcntl::F_DUPFD_CLOEXEC => {
                let file = fds.get(fd as i32)?;
                let cloexec = cmd as u32 == fcntl::F_DUPFD_CLOEXEC;
                let new = fds.insert(file, cloexec, arg as usize)?;
                Ok(new as u64)
            }
            fcntl::F_GETFD => {
                let entry = fds.entry(fd as i32)?;
                Ok(u64::from(entry.cloexec) * u64::from(fcntl::FD_CLOEXEC))
            }
            fcntl::F_SETFD => {
                let entry = fds.entry_mut(fd as i32)?;
                entry.cloexec = arg as u32 & fcntl::FD_CLOEXEC != 0;
                Ok(0)
            }
            fcntl::F_GETFL => {
                let file = fds.get(fd as i32)?;
                let flags = *file.flags.lock();
                Ok(u64::from(flags.bits()))
            }
            fcntl::F_SETFL => {
                let file = fds.get(fd as i32)?;
                // Only the status flags may change.
                let settable = OpenFlags::APPEND | OpenFlags::NONBLOCK;
                let mut flags = file.flags.lock();
                *flags = (*flags - settable)
                    | (OpenFlags::from_bits_truncate(arg as u32) & settable);
                Ok(0)
            }
            _ => Err(Errno::Einval),
        }
    })();
    SyscallResult::from_result(result)
}

pub fn sys_ioctl(
    _ctx: &mut CpuContext,
    fd: u64,
    op: u64,
    arg: u64,
    _a4: u64,
) -> SyscallResult {
    let result = (|| {
        let proc = proc::current().ok_or(Errno::Esrch)?;
        let file = proc.fds.lock().get(fd as i32)?;
        file.vnode.ops().ioctl(&file.vnode, op, arg as usize)
    })();
    SyscallResult::from_result(result)
}

pub fn sys_seek(
    _ctx: &mut CpuContext,
    fd: u64,
    offset: u64,
    whence: u64,
    _a4: u64,
) -> SyscallResult {
    let result = (|| {
        let proc = proc::current().ok_or(Errno::Esrch)?;
        let file = proc.fds.lock().get(fd as i32)?;
        if matches!(
            file.vnode.vtype,
            VnodeType::Fifo | VnodeType::Socket | VnodeType::CharDevice
        ) {
            return Err(Errno::Espipe);
        }
        let whence = Whence::from_raw(whence as i32).ok_or(Errno::Einval)?;
        let mut pos = file.offset.lock();
        let base = match whence {
            Whence::Set => 0,
            Whence::Cur => *pos as i64,
            Whence::End => file.vnode.ops().size(&file.vnode) as i64,
        };
        let target = base.checked_add(offset as i64).ok_or(Errno::Eoverflow)?;
        if target < 0 {
            return Err(Errno::Einval);
        }
        *pos = target as u64;
        Ok(*pos)
    })();
    SyscallResult::from_result(result)
}

pub fn sys_truncate(
    _ctx: &mut CpuContext,
    fd: u64,
    len: u64,
    _a3: u64,
    _a4: u64,
) -> SyscallResult {
    let result = (|| {
        let proc = proc::current().ok_or(Errno::Esrch)?;
        let file = proc.fds.lock().get(fd as i32)?;
        if !file.writable() {
            return Err(Errno::Ebadf);
        }
        file.vnode.ops().truncate(&file.vnode, len)?;
        Ok(0)
    })();
    SyscallResult::from_result(result)
}

pub fn sys_isatty(_ctx: &mut CpuContext, fd: u64, _a2: u64, _a3: u64, _a4: u64) -> SyscallResult {
    let result = (|| {
        let proc = proc::current().ok_or(Errno::Esrch)?;
        let file = proc.fds.lock().get(fd as i32)?;
        if file.vnode.ops().isatty(&file.vnode) {
            Ok(1)
        } else {
            Err(Errno::Enotty)
        }
    })();
    SyscallResult::from_result(result)
}

pub fn sys_pipe(
    _ctx: &mut CpuContext,
    fds_ptr: u64,
    _a2: u64,
    _a3: u64,
    _a4: u64,
) -> SyscallResult {
    let result = (|| {
        let proc = proc::current().ok_or(Errno::Esrch)?;
        let (read_vn, write_vn) = crate::fs::pipefs::new();
        let mut fds = proc.fds.lock();
        let rfd = fds.insert(File::new(read_vn, OpenFlags::RDONLY), false, 0)?;
        let wfd = match fds.insert(File::new(write_vn, OpenFlags::WRONLY), false, 0) {
            Ok(fd) => fd,
            Err(e) => {
                let _ = fds.close(rfd);
                return Err(e);
            }
        };
        drop(fds);
        let pair = [rfd, wfd];
        userptr::copy_out(fds_ptr, pair_bytes(&pair))?;
        Ok(0)
    })();
    SyscallResult::from_result(result)
}

/// Reinterprets a `[i32; 2]` as bytes for the user copy.
fn pair_bytes(pair: &[i32; 2]) -> &[u8] {
    // SAFETY: i32 has no padding; the slice covers exactly the array.
    unsafe { core::slice::from_raw_parts(pair.as_ptr().cast(), 8) }
}

pub fn sys_fstatat(
    _ctx: &mut CpuContext,
    dirfd: u64,
    path_ptr: u64,
    stat_ptr: u64,
    flags: u64,
) -> SyscallResult {
    let result = (|| {
        let proc = proc::current().ok_or(Errno::Esrch)?;
        let follow = flags as u32 & AT_SYMLINK_NOFOLLOW == 0;
        let vnode = if path_ptr == 0 {
            // fstat shape: stat the fd itself.
            proc.fds.lock().get(dirfd as i32)?.vnode.clone()
        } else {
            let path = userptr::read_cstr(path_ptr)?;
            if path.is_empty() {
                proc.fds.lock().get(dirfd as i32)?.vnode.clone()
            } else {
                fs::resolve_at(&proc, dirfd as i32, &path, follow)?
            }
        };
        let mut st = vnode.ops().stat(&vnode)?;
        st.size = vnode.ops().size(&vnode).max(st.size);
        userptr::write_struct(stat_ptr, &st)?;
        Ok(0)
    })();
    SyscallResult::from_result(result)
}

pub fn sys_faccessat(
    _ctx: &mut CpuContext,
    dirfd: u64,
    path_ptr: u64,
    _mode: u64,
    flags: u64,
) -> SyscallResult {
    let result = (|| {
        let proc = proc::current().ok_or(Errno::Esrch)?;
        let path = userptr::read_cstr(path_ptr)?;
        let follow = flags as u32 & AT_SYMLINK_NOFOLLOW == 0;
        // Existence is the whole check: everything runs as uid 0.
        fs::resolve_at(&proc, dirfd as i32, &path, follow)?;
        Ok(0)
    })();
    SyscallResult::from_result(result)
}

pub fn sys_mkdirat(
    _ctx: &mut CpuContext,
    dirfd: u64,
    path_ptr: u64,
    mode: u64,
    _a4: u64,
) -> SyscallResult {
    let result = (|| {
        let proc = proc::current().ok_or(Errno::Esrch)?;
        let path = userptr::read_cstr(path_ptr)?;
        let (parent, name) = fs::parent_at(&proc, dirfd as i32, &path)?;
        parent.ops().mkdir(
            &parent,
            name,
            FileAttr {
                mode: mode as u32 & 0o7777,
            },
        )?;
        Ok(0)
    })();
    SyscallResult::from_result(result)
}

pub fn sys_unlinkat(
    _ctx: &mut CpuContext,
    dirfd: u64,
    path_ptr: u64,
    flags: u64,
    _a4: u64,
) -> SyscallResult {
    let result = (|| {
        let proc = proc::current().ok_or(Errno::Esrch)?;
        let path = userptr::read_cstr(path_ptr)?;
        let (parent, name) = fs::parent_at(&proc, dirfd as i32, &path)?;
        let uflags = if flags as u32 & AT_REMOVEDIR != 0 {
            UnlinkFlags::REMOVEDIR
        } else {
            UnlinkFlags::empty()
        };
        parent.ops().unlink(&parent, name, uflags)?;
        Ok(0)
    })();
    SyscallResult::from_result(result)
}

pub fn sys_readlinkat(
    _ctx: &mut CpuContext,
    dirfd: u64,
    path_ptr: u64,
    buf: u64,
    len: u64,
) -> SyscallResult {
    let result = (|| {
        let proc = proc::current().ok_or(Errno::Esrch)?;
        let path = userptr::read_cstr(path_ptr)?;
        let vnode = fs::resolve_at(&proc, dirfd as i32, &path, false)?;
        let target = vnode.ops().readlink(&vnode)?;
        let n = target.len().min(len as usize);
        userptr::copy_out(buf, &target.as_bytes()[..n])?;
        Ok(n as u64)
    })();
    SyscallResult::from_result(result)
}

pub fn sys_symlinkat(
    _ctx: &mut CpuContext,
    target_ptr: u64,
    dirfd: u64,
    path_ptr: u64,
    _a4: u64,
) -> SyscallResult {
    let result = (|| {
        let proc = proc::current().ok_or(Errno::Esrch)?;
        let target = userptr::read_cstr(target_ptr)?;
        let path = userptr::read_cstr(path_ptr)?;
        let (parent, name) = fs::parent_at(&proc, dirfd as i32, &path)?;
        parent.ops().symlink(&parent, name, &target)?;
        Ok(0)
    })();
    SyscallResult::from_result(result)
}

pub fn sys_chdir(
    _ctx: &mut CpuContext,
    path_ptr: u64,
    _a2: u64,
    _a3: u64,
    _a4: u64,
) -> SyscallResult {
    let result = (|| {
        let proc = proc::current().ok_or(Errno::Esrch)?;
        let path = userptr::read_cstr(path_ptr)?;
        let vnode = fs::resolve_at(&proc, AT_FDCWD, &path, true)?;
        if vnode.vtype != VnodeType::Directory {
            return Err(Errno::Enotdir);
        }
        let new_path = {
            let cur = proc.cwd_path.lock();
            fs::join_paths(&cur, &path)
        };
        *proc.cwd.lock() = vnode;
        *proc.cwd_path.lock() = new_path;
        Ok(0)
    })();
    SyscallResult::from_result(result)
}

pub fn sys_getcwd(
    _ctx: &mut CpuContext,
    buf: u64,
    len: u64,
    _a3: u64,
    _a4: u64,
) -> SyscallResult {
    let result = (|| {
        let proc = proc::current().ok_or(Errno::Esrch)?;
        let path = proc.cwd_path.lock().clone();
        if path.len() + 1 > len as usize {
            return Err(Errno::Einval);
        }
        userptr::copy_out(buf, path.as_bytes())?;
        userptr::copy_out(buf + path.len() as u64, &[0])?;
        Ok(path.len() as u64 + 1)
    })();
    SyscallResult::from_result(result)
}

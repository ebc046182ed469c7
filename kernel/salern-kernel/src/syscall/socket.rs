//! Socket syscalls.

use alloc::sync::Arc;
use alloc::vec::Vec;

use salern_abi::sockaddr::{AF_UNIX, IoVec, MsgHdr, SOCK_STREAM, SockaddrUn};
use salern_abi::{Errno, OpenFlags};
use salern_core::ioviter::IovIter;

use crate::arch::x86_64::context::CpuContext;
use crate::file::File;
use crate::fs::sockfs;
use crate::ipc::socket::{SocketRef, UnixHandle, UnixSocket};
use crate::proc;
use crate::syscall::{SyscallResult, userptr};

fn socket_fd(fd: u64) -> Result<SocketRef, Errno> {
    let proc = proc::current().ok_or(Errno::Esrch)?;
    let file = proc.fds.lock().get(fd as i32)?;
    sockfs::socket_of(&file.vnode)
}

pub fn sys_socket(
    _ctx: &mut CpuContext,
    family: u64,
    stype: u64,
    _proto: u64,
    _a4: u64,
) -> SyscallResult {
    let result = (|| {
        if family as u32 != AF_UNIX {
            return Err(Errno::Eafnosupport);
        }
        if stype as u32 != SOCK_STREAM {
            return Err(Errno::Eprotonosupport);
        }
        let proc = proc::current().ok_or(Errno::Esrch)?;
        let socket: SocketRef = Arc::new(UnixHandle(UnixSocket::new()));
        let vnode = sockfs::wrap(socket);
        let fd = proc
            .fds
            .lock()
            .insert(File::new(vnode, OpenFlags::RDWR), false, 0)?;
        Ok(fd as u64)
    })();
    SyscallResult::from_result(result)
}

fn read_sockaddr(addr_ptr: u64, addr_len: u64) -> Result<SockaddrUn, Errno> {
    if addr_len < 2 || addr_len as usize > size_of::<SockaddrUn>() {
        return Err(Errno::Einval);
    }
    let raw = userptr::copy_in(addr_ptr, addr_len as usize)?;
    let family = u16::from_le_bytes([raw[0], raw[1]]);
    if u32::from(family) != AF_UNIX {
        return Err(Errno::Eafnosupport);
    }
    Ok(SockaddrUn::from_path(&raw[2..]))
}

pub fn sys_bind(
    _ctx: &mut CpuContext,
    fd: u64,
    addr_ptr: u64,
    addr_len: u64,
    _a4: u64,
) -> SyscallResult {
    let result = (|| {
        let socket = socket_fd(fd)?;
        let addr = read_sockaddr(addr_ptr, addr_len)?;
        socket.bind(&addr)?;
        Ok(0)
    })();
    SyscallResult::from_result(result)
}

pub fn sys_listen(
    _ctx: &mut CpuContext,
    fd: u64,
    backlog: u64,
    _a3: u64,
    _a4: u64,
) -> SyscallResult {
    let result = (|| {
        let socket = socket_fd(fd)?;
        socket.listen(backlog as usize)?;
        Ok(0)
    })();
    SyscallResult::from_result(result)
}

pub fn sys_accept(
    _ctx: &mut CpuContext,
    fd: u64,
    addr_ptr: u64,
    addr_len_ptr: u64,
    _a4: u64,
) -> SyscallResult {
    let result = (|| {
        let proc = proc::current().ok_or(Errno::Esrch)?;
        let socket = socket_fd(fd)?;
        let conn = socket.accept()?;
        if addr_ptr != 0 && addr_len_ptr != 0 {
            let path = conn.peer_path().unwrap_or_default();
            let sa = SockaddrUn::from_path(path.as_bytes());
            let len = (2 + path.len() + 1) as u32;
            userptr::copy_out(addr_ptr, &sa.family.to_le_bytes())?;
            userptr::copy_out(addr_ptr + 2, sa.path_bytes())?;
            userptr::write_struct(addr_len_ptr, &len)?;
        }
        let vnode = sockfs::wrap(conn);
        let new_fd = proc
            .fds
            .lock()
            .insert(File::new(vnode, OpenFlags::RDWR), false, 0)?;
        Ok(new_fd as u64)
    })();
    SyscallResult::from_result(result)
}

pub fn sys_connect(
    _ctx: &mut CpuContext,
    fd: u64,
    addr_ptr: u64,
    addr_len: u64,
    _a4: u64,
) -> SyscallResult {
    let result = (|| {
        let socket = socket_fd(fd)?;
        let addr = read_sockaddr(addr_ptr, addr_len)?;
        socket.connect(&addr)?;
        Ok(0)
    })();
    SyscallResult::from_result(result)
}

fn gather_iovs(msg: &MsgHdr) -> Result<Vec<IoVec>, Errno> {
    if msg.iovlen > 1024 {
        return Err(Errno::Einval);
    }
    let raw = userptr::copy_in(msg.iov, msg.iovlen as usize * size_of::<IoVec>())?;
    let mut iovs = Vec::with_capacity(msg.iovlen as usize);
    for chunk in raw.chunks_exact(size_of::<IoVec>()) {
        // SAFETY: IoVec is a plain #[repr(C)] pair of u64s.
        iovs.push(unsafe { core::ptr::read_unaligned(chunk.as_ptr().cast::<IoVec>()) });
    }
    Ok(iovs)
}

pub fn sys_sendmsg(
    _ctx: &mut CpuContext,
    fd: u64,
    msg_ptr: u64,
    _flags: u64,
    _a4: u64,
) -> SyscallResult {
    let result = (|| {
        let socket = socket_fd(fd)?;
        let msg: MsgHdr = userptr::read_struct(msg_ptr)?;
        let iovs = gather_iovs(&msg)?;
        let mut iter = IovIter::new(&iovs);
        let mut data = Vec::with_capacity(iter.total_len());
        while let Some((addr, len)) = iter.next_window(usize::MAX) {
            data.extend_from_slice(&userptr::copy_in(addr, len)?);
        }
        let n = socket.send(&data, true)?;
        Ok(n as u64)
    })();
    SyscallResult::from_result(result)
}

pub fn sys_recvmsg(
    _ctx: &mut CpuContext,
    fd: u64,
    msg_ptr: u64,
    _flags: u64,
    _a4: u64,
) -> SyscallResult {
    let result = (|| {
        let socket = socket_fd(fd)?;
        let msg: MsgHdr = userptr::read_struct(msg_ptr)?;
        let iovs = gather_iovs(&msg)?;
        let mut iter = IovIter::new(&iovs);
        let mut data = alloc::vec![0u8; iter.total_len()];
        let n = socket.recv(&mut data, true)?;
        let mut done = 0;
        while done < n {
            let Some((addr, len)) = iter.next_window(n - done) else {
                break;
            };
            userptr::copy_out(addr, &data[done..done + len])?;
            done += len;
        }
        Ok(done as u64)
    })();
    SyscallResult::from_result(result)
}

pub fn sys_getpeername(
    _ctx: &mut CpuContext,
    fd: u64,
    addr_ptr: u64,
    addr_len_ptr: u64,
    _a4: u64,
) -> SyscallResult {
    let result = (|| {
        let socket = socket_fd(fd)?;
        let path = socket.peer_path()?;
        let sa = SockaddrUn::from_path(path.as_bytes());
        let len = (2 + path.len() + 1) as u32;
        userptr::copy_out(addr_ptr, &sa.family.to_le_bytes())?;
        userptr::copy_out(addr_ptr + 2, sa.path_bytes())?;
        userptr::write_struct(addr_len_ptr, &len)?;
        Ok(0)
    })();
    SyscallResult::from_result(result)
}

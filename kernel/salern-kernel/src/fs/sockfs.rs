//! Socket vnodes.
//!
//! Wraps a socket object so it can live in a descriptor table; every
//! vnode op dispatches to the socket's ops table.

use alloc::boxed::Box;

use salern_abi::{Errno, PollEvents};
use salern_fs::{PollHead, Vnode, VnodeBackend, VnodeRef, VnodeType};

use crate::ipc::socket::SocketRef;

struct SockNode {
    socket: SocketRef,
}

impl VnodeBackend for SockNode {
    fn read(&self, _vn: &VnodeRef, buf: &mut [u8], _off: u64) -> Result<usize, Errno> {
        self.socket.recv(buf, true)
    }

    fn write(&self, _vn: &VnodeRef, buf: &[u8], _off: u64) -> Result<usize, Errno> {
        self.socket.send(buf, true)
    }

    fn poll(&self, _vn: &VnodeRef, events: PollEvents) -> PollEvents {
        self.socket.poll(events)
    }

    fn poll_head(&self, _vn: &VnodeRef) -> Option<&PollHead> {
        Some(self.socket.poll_head())
    }

    fn private(&self) -> Option<&(dyn core::any::Any + Sync + Send)> {
        Some(&self.socket)
    }

    fn close(&self) {
        self.socket.destroy();
    }
}

/// Wraps a socket into a vnode.
#[must_use]
pub fn wrap(socket: SocketRef) -> VnodeRef {
    Vnode::new(VnodeType::Socket, Box::new(SockNode { socket }))
}

/// Recovers the socket behind a sockfs vnode.
pub fn socket_of(vn: &VnodeRef) -> Result<SocketRef, Errno> {
    if vn.vtype != VnodeType::Socket {
        return Err(Errno::Enotsock);
    }
    vn.ops()
        .private()
        .and_then(|any| any.downcast_ref::<SocketRef>())
        .cloned()
        .ok_or(Errno::Enotsock)
}

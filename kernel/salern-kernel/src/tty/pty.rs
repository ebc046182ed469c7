//! Pseudo-terminals.
//!
//! A PTY is a master/slave pair with one ring buffer per direction.
//! The slave side is a full [`Tty`] whose backend writes into the
//! master-readable output ring; master writes feed the slave's line
//! discipline like keystrokes.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};

use salern_abi::termios::Winsize;
use salern_abi::{Errno, PollEvents};
use salern_core::sync::SpinLock;
use salern_fs::{PollHead, Vnode, VnodeBackend, VnodeRef, VnodeType};

use crate::config::TTY_MAX;
use crate::sync::ringbuffer::{NOATOMIC, RingBuffer};
use crate::tty::{Tty, TtyBackend, TtyNode};

static NEXT_PTY: AtomicUsize = AtomicUsize::new(0);

/// Slave-output plumbing shared between the backend and the master.
struct PtyShared {
    /// Bytes the slave wrote, readable on the master.
    output: RingBuffer,
    poll: PollHead,
    winsize: SpinLock<Winsize>,
}

struct PtyBackend {
    shared: Arc<PtyShared>,
}

impl TtyBackend for PtyBackend {
    fn write(&self, bytes: &[u8]) {
        // Slave output must never block the writer on a lazy master;
        // drop on overflow like a real serial line would.
        let _ = self.shared.output.write(bytes, NOATOMIC, false, None);
        self.shared.poll.notify();
    }

    fn winsize(&self) -> Winsize {
        *self.shared.winsize.lock()
    }
}

/// Master-side vnode: reads slave output, writes slave input.
struct PtyMaster {
    shared: Arc<PtyShared>,
    slave: Arc<Tty>,
}

impl VnodeBackend for PtyMaster {
    fn read(&self, _vn: &VnodeRef, buf: &mut [u8], _off: u64) -> Result<usize, Errno> {
        self.shared.output.read(buf, NOATOMIC, true, None)
    }

    fn write(&self, _vn: &VnodeRef, buf: &[u8], _off: u64) -> Result<usize, Errno> {
        for &byte in buf {
            self.slave.input_byte(byte);
        }
        Ok(buf.len())
    }

    fn poll(&self, _vn: &VnodeRef, events: PollEvents) -> PollEvents {
        let mut ready = PollEvents::empty();
        if events.contains(PollEvents::IN) && !self.shared.output.is_empty() {
            ready |= PollEvents::IN;
        }
        if events.contains(PollEvents::OUT) {
            ready |= PollEvents::OUT;
        }
        ready
    }

    fn poll_head(&self, _vn: &VnodeRef) -> Option<&PollHead> {
        Some(&self.shared.poll)
    }

    fn close(&self) {
        // Slave readers see EOF when the master goes away.
        self.shared.output.set_eof();
    }
}

/// Creates a PTY pair; returns `(master, slave)` vnodes.
///
/// The slave is also registered as `/dev/pts/<n>`.
pub fn new() -> Result<(VnodeRef, VnodeRef), Errno> {
    let shared = Arc::new(PtyShared {
        output: RingBuffer::new(),
        poll: PollHead::new(),
        winsize: SpinLock::new(Winsize {
            row: 25,
            col: 80,
            xpixel: 0,
            ypixel: 0,
        }),
    });
    let index = TTY_MAX + NEXT_PTY.fetch_add(1, Ordering::Relaxed);
    let slave_tty = Tty::new(
        index,
        Arc::new(PtyBackend {
            shared: shared.clone(),
        }),
    );
    let slave = Vnode::new(
        VnodeType::CharDevice,
        Box::new(TtyNode {
            tty: slave_tty.clone(),
        }),
    );
    let master = Vnode::new(
        VnodeType::CharDevice,
        Box::new(PtyMaster {
            shared,
            slave: slave_tty,
        }),
    );

    let name = alloc::format!("{}", index - TTY_MAX);
    if let Ok(pts) = crate::fs::devfs::register_dir("pts") {
        let _ = crate::fs::devfs::register(
            Some(&pts),
            &name,
            Arc::new(SlaveAlias {
                slave: slave.clone(),
            }),
            VnodeType::CharDevice,
        );
    }
    Ok((master, slave))
}

/// devfs alias forwarding to the slave vnode.
struct SlaveAlias {
    slave: VnodeRef,
}

impl crate::fs::devfs::DevOps for SlaveAlias {
    fn read(&self, buf: &mut [u8], off: u64) -> Result<usize, Errno> {
        self.slave.ops().read(&self.slave, buf, off)
    }

    fn write(&self, buf: &[u8], off: u64) -> Result<usize, Errno> {
        self.slave.ops().write(&self.slave, buf, off)
    }

    fn ioctl(&self, op: u64, arg: usize) -> Result<u64, Errno> {
        self.slave.ops().ioctl(&self.slave, op, arg)
    }

    fn isatty(&self) -> bool {
        true
    }
}

//! Blocking ring buffer.
//!
//! The backbone of every kernel byte stream: pipes, TTYs, and UNIX
//! sockets all move their bytes through one of these. On top of the
//! plain FIFO it adds reader/writer waitlists, an EOF flag, atomic
//! transfer sizes, and a hangup hook that lets the owning layer (the TTY
//! line discipline, the pipe peer check) adjust or abort an operation.

use alloc::boxed::Box;
use alloc::vec;

use salern_abi::Errno;
use salern_core::addr::PAGE_SIZE;
use salern_core::sync::SpinLock;

use crate::sync::Waitlist;

/// Default capacity: a quarter page.
pub const RB_DEFAULT_SIZE: usize = PAGE_SIZE / 4;

/// Operations with `atomic_size == NOATOMIC` may make partial progress
/// on every wakeup.
pub const NOATOMIC: usize = 1;

/// Which direction an operation moves bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RbOp {
    /// Draining the buffer.
    Read,
    /// Filling the buffer.
    Write,
}

/// Mutable knobs a hangup hook may turn.
pub struct HangupCtl {
    /// Direction of the operation being checked.
    pub op: RbOp,
    /// Bytes the caller still wants to move; the hook may shrink this
    /// (e.g. canonical mode stopping at a newline).
    pub want: usize,
    /// Bytes already moved in this call.
    pub transferred: usize,
    /// Set to finish the call immediately with the bytes moved so far.
    pub force_return: bool,
}

/// Read-only view of the FIFO given to hangup hooks.
pub struct RingView<'a> {
    core: &'a RbCore,
}

impl RingView<'_> {
    /// Unread byte count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.core.len()
    }

    /// Returns whether the FIFO is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.core.len() == 0
    }

    /// The k-th unread byte, if present.
    #[must_use]
    pub fn peek(&self, k: usize) -> Option<u8> {
        self.core.peek(k)
    }
}

/// Hangup hook: consulted before every transfer attempt.
///
/// An `Err` aborts the operation with that errno (e.g. `EPIPE` when the
/// read side of a pipe is gone).
pub type HangupHook = fn(ctl: &mut HangupCtl, rb: &RingView<'_>, arg: usize) -> Result<(), Errno>;

/// The FIFO core: monotonic indices over a wrap-around window.
struct RbCore {
    data: Box<[u8]>,
    read_index: usize,
    write_index: usize,
}

impl RbCore {
    fn len(&self) -> usize {
        self.write_index.wrapping_sub(self.read_index)
    }

    fn space(&self) -> usize {
        self.data.len() - self.len()
    }

    fn peek(&self, k: usize) -> Option<u8> {
        if k >= self.len() {
            return None;
        }
        Some(self.data[self.read_index.wrapping_add(k) % self.data.len()])
    }

    fn push_slice(&mut self, buf: &[u8]) -> usize {
        let n = buf.len().min(self.space());
        let cap = self.data.len();
        for &byte in &buf[..n] {
            self.data[self.write_index % cap] = byte;
            self.write_index = self.write_index.wrapping_add(1);
        }
        n
    }

    fn pop_slice(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.len());
        let cap = self.data.len();
        for slot in &mut buf[..n] {
            *slot = self.data[self.read_index % cap];
            self.read_index = self.read_index.wrapping_add(1);
        }
        n
    }
}

/// A blocking byte FIFO with EOF and hangup semantics.
pub struct RingBuffer {
    core: SpinLock<RbCore>,
    readers: Waitlist,
    writers: Waitlist,
    eof: SpinLock<bool>,
    hangup: Option<HangupHook>,
    /// Used when a call passes no hangup argument of its own.
    fallback_hu_arg: usize,
}

impl RingBuffer {
    /// Creates a buffer with the default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(RB_DEFAULT_SIZE)
    }

    /// Creates a buffer with the given capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            core: SpinLock::new(RbCore {
                data: vec![0; capacity].into_boxed_slice(),
                read_index: 0,
                write_index: 0,
            }),
            readers: Waitlist::new(),
            writers: Waitlist::new(),
            eof: SpinLock::new(false),
            hangup: None,
            fallback_hu_arg: 0,
        }
    }

    /// Installs a hangup hook with its fallback argument.
    #[must_use]
    pub fn with_hangup(mut self, hook: HangupHook, fallback_arg: usize) -> Self {
        self.hangup = Some(hook);
        self.fallback_hu_arg = fallback_arg;
        self
    }

    /// Unread byte count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.core.lock().len()
    }

    /// Returns whether no unread bytes remain.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Free space in bytes.
    #[must_use]
    pub fn space(&self) -> usize {
        self.core.lock().space()
    }

    /// Marks end-of-stream and wakes both sides.
    pub fn set_eof(&self) {
        *self.eof.lock() = true;
        self.readers.notify_all();
        self.writers.notify_all();
    }

    /// Returns whether end-of-stream was signalled.
    #[must_use]
    pub fn is_eof(&self) -> bool {
        *self.eof.lock()
    }

    /// Wakes both waitlists (peer state changed, e.g. hangup).
    pub fn kick(&self) {
        self.readers.notify_all();
        self.writers.notify_all();
    }

    /// Writes `buf`, honoring atomicity and blocking rules.
    ///
    /// Blocks while less than `min(atomic_size, remaining)` space is
    /// free. Returns the bytes written; with `blocking = false` it
    /// returns `EAGAIN` if it could not move a single chunk.
    pub fn write(
        &self,
        buf: &[u8],
        atomic_size: usize,
        blocking: bool,
        hu_arg: Option<usize>,
    ) -> Result<usize, Errno> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut total = 0;
        loop {
            let mut core = self.core.lock();

            let mut want = buf.len() - total;
            if let Some(hook) = self.hangup {
                let mut ctl = HangupCtl {
                    op: RbOp::Write,
                    want,
                    transferred: total,
                    force_return: false,
                };
                let view = RingView { core: &core };
                hook(&mut ctl, &view, hu_arg.unwrap_or(self.fallback_hu_arg))?;
                want = ctl.want;
                if ctl.force_return || want == 0 {
                    return Ok(total);
                }
            }

            if *self.eof.lock() {
                // Writing past EOF is a protocol error for every user.
                return Err(Errno::Epipe);
            }

            let need = atomic_size.min(want);
            let avail = core.space();
            if avail >= need {
                let n = core.push_slice(&buf[total..total + want.min(avail)]);
                total += n;
                drop(core);
                self.readers.notify_all();
                if total == buf.len() {
                    return Ok(total);
                }
                if !blocking {
                    return Ok(total);
                }
                continue;
            }

            if !blocking {
                return if total > 0 { Ok(total) } else { Err(Errno::Eagain) };
            }
            self.writers.wait_guard(core);
        }
    }

    /// Reads into `dst`, honoring atomicity and blocking rules.
    ///
    /// Returns 0 at EOF on an empty buffer. With `blocking = false` an
    /// empty buffer yields `EAGAIN`.
    pub fn read(
        &self,
        dst: &mut [u8],
        atomic_size: usize,
        blocking: bool,
        hu_arg: Option<usize>,
    ) -> Result<usize, Errno> {
        if dst.is_empty() {
            return Ok(0);
        }
        let mut total = 0;
        loop {
            let mut core = self.core.lock();

            let mut want = dst.len() - total;
            if let Some(hook) = self.hangup {
                let mut ctl = HangupCtl {
                    op: RbOp::Read,
                    want,
                    transferred: total,
                    force_return: false,
                };
                let view = RingView { core: &core };
                hook(&mut ctl, &view, hu_arg.unwrap_or(self.fallback_hu_arg))?;
                want = ctl.want;
                if ctl.force_return || want == 0 {
                    return Ok(total);
                }
            }

            let need = atomic_size.min(want);
            if core.len() >= need {
                let n = core.pop_slice(&mut dst[total..total + want]);
                total += n;
                drop(core);
                self.writers.notify_all();
                return Ok(total);
            }

            if core.len() == 0 && *self.eof.lock() {
                return Ok(total);
            }

            if !blocking {
                return if total > 0 { Ok(total) } else { Err(Errno::Eagain) };
            }
            self.readers.wait_guard(core);
        }
    }
}

impl Default for RingBuffer {
    fn default() -> Self {
        Self::new()
    }
}

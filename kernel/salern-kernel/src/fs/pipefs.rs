//! Pipes.
//!
//! `new()` returns two vnodes sharing one ring buffer. The reader sees
//! EOF once every writer closed; a write with no readers left raises
//! `SIGPIPE` and fails with `EPIPE`.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};

use salern_abi::signal::SIGPIPE;
use salern_abi::{Errno, PollEvents};
use salern_fs::{PollHead, Vnode, VnodeBackend, VnodeRef, VnodeType};

use crate::sync::ringbuffer::{HangupCtl, NOATOMIC, RbOp, RingBuffer, RingView};

/// Shared pipe state.
struct PipeInner {
    rb: RingBuffer,
    readers: AtomicUsize,
    writers: AtomicUsize,
    poll: PollHead,
}

/// Hangup hook: a writer blocked on a full buffer must fail with
/// `EPIPE` the moment the last reader closes, not sleep forever.
fn pipe_hangup(ctl: &mut HangupCtl, _rb: &RingView<'_>, arg: usize) -> Result<(), Errno> {
    if arg == 0 {
        return Ok(());
    }
    // SAFETY: The argument is the Arc'd PipeInner of the calling end,
    // alive for the duration of the call.
    let inner = unsafe { &*(arg as *const PipeInner) };
    if ctl.op == RbOp::Write && inner.readers.load(Ordering::Acquire) == 0 {
        return Err(Errno::Epipe);
    }
    Ok(())
}

/// Creates a connected pipe; returns `(read_end, write_end)`.
#[must_use]
pub fn new() -> (VnodeRef, VnodeRef) {
    let inner = Arc::new(PipeInner {
        rb: RingBuffer::new().with_hangup(pipe_hangup, 0),
        readers: AtomicUsize::new(1),
        writers: AtomicUsize::new(1),
        poll: PollHead::new(),
    });
    let read_end = Vnode::new(
        VnodeType::Fifo,
        Box::new(PipeRead {
            inner: inner.clone(),
        }),
    );
    let write_end = Vnode::new(VnodeType::Fifo, Box::new(PipeWrite { inner }));
    (read_end, write_end)
}

struct PipeRead {
    inner: Arc<PipeInner>,
}

impl VnodeBackend for PipeRead {
    fn read(&self, _vn: &VnodeRef, buf: &mut [u8], _off: u64) -> Result<usize, Errno> {
        let n = self.inner.rb.read(buf, NOATOMIC, true, None)?;
        self.inner.poll.notify();
        Ok(n)
    }

    fn poll(&self, _vn: &VnodeRef, events: PollEvents) -> PollEvents {
        let mut ready = PollEvents::empty();
        if events.contains(PollEvents::IN)
            && (!self.inner.rb.is_empty() || self.inner.writers.load(Ordering::Acquire) == 0)
        {
            ready |= PollEvents::IN;
        }
        if self.inner.writers.load(Ordering::Acquire) == 0 {
            ready |= PollEvents::HUP;
        }
        ready
    }

    fn poll_head(&self, _vn: &VnodeRef) -> Option<&PollHead> {
        Some(&self.inner.poll)
    }

    fn close(&self) {
        if self.inner.readers.fetch_sub(1, Ordering::AcqRel) == 1 {
            // Writers must notice the hangup.
            self.inner.rb.kick();
            self.inner.poll.notify();
        }
    }
}

struct PipeWrite {
    inner: Arc<PipeInner>,
}

impl VnodeBackend for PipeWrite {
    fn write(&self, _vn: &VnodeRef, buf: &[u8], _off: u64) -> Result<usize, Errno> {
        let hu_arg = Arc::as_ptr(&self.inner) as usize;
        match self.inner.rb.write(buf, NOATOMIC, true, Some(hu_arg)) {
            Ok(n) => {
                self.inner.poll.notify();
                Ok(n)
            }
            Err(Errno::Epipe) => {
                // Nobody will ever read this: SIGPIPE + EPIPE.
                if let Some(proc) = crate::proc::current() {
                    let _ = crate::proc::signal::send_to_proc(proc.pid, SIGPIPE, None);
                }
                Err(Errno::Epipe)
            }
            Err(e) => Err(e),
        }
    }

    fn poll(&self, _vn: &VnodeRef, events: PollEvents) -> PollEvents {
        let mut ready = PollEvents::empty();
        if events.contains(PollEvents::OUT) && self.inner.rb.space() > 0 {
            ready |= PollEvents::OUT;
        }
        if self.inner.readers.load(Ordering::Acquire) == 0 {
            ready |= PollEvents::ERR;
        }
        ready
    }

    fn poll_head(&self, _vn: &VnodeRef) -> Option<&PollHead> {
        Some(&self.inner.poll)
    }

    fn close(&self) {
        if self.inner.writers.fetch_sub(1, Ordering::AcqRel) == 1 {
            // Readers drain what is buffered, then see EOF.
            self.inner.rb.set_eof();
            self.inner.poll.notify();
        }
    }
}

//! Terminals.
//!
//! A [`Tty`] owns its termios, a canonical-mode line buffer, the ring
//! buffer completed input travels through, and an output backend (the
//! framebuffer terminal for consoles, the master-side ring for PTYs).

pub mod console;
pub mod pty;

use alloc::boxed::Box;
use alloc::sync::Arc;

use salern_abi::termios::{
    LocalFlags, TCGETS, TCSETS, TIOCGPGRP, TIOCGWINSZ, TIOCSCTTY, TIOCSPGRP, Termios, VEOF,
    VERASE, VINTR, VSUSP, Winsize,
};
use salern_abi::{Errno, PollEvents};
use salern_core::collections::RingBuf;
use salern_core::sync::SpinLock;
use salern_fs::{PollHead, Vnode, VnodeBackend, VnodeRef, VnodeType};

use crate::proc::signal;
use crate::sync::ringbuffer::{NOATOMIC, RingBuffer};

/// Where a TTY's output bytes go.
pub trait TtyBackend: Send + Sync {
    /// Writes processed output.
    fn write(&self, bytes: &[u8]);
    /// The terminal geometry.
    fn winsize(&self) -> Winsize;
    /// Foreground gained (console switching).
    fn enable(&self) {}
    /// Foreground lost.
    fn disable(&self) {}
}

/// Canonical-mode editing state.
struct LineState {
    line: RingBuf<256>,
}

/// A terminal.
pub struct Tty {
    /// Index among the consoles (or a PTY slot id).
    pub index: usize,
    termios: SpinLock<Termios>,
    /// Completed input, as userspace will read it.
    input: RingBuffer,
    ldisc: SpinLock<LineState>,
    backend: Arc<dyn TtyBackend>,
    /// Foreground process group for signal generation.
    fg_pgid: SpinLock<u32>,
    poll: PollHead,
}

impl Tty {
    /// Creates a terminal over an output backend.
    #[must_use]
    pub fn new(index: usize, backend: Arc<dyn TtyBackend>) -> Arc<Self> {
        Arc::new(Self {
            index,
            termios: SpinLock::new(Termios::default()),
            input: RingBuffer::new(),
            ldisc: SpinLock::new(LineState {
                line: RingBuf::new(),
            }),
            backend,
            fg_pgid: SpinLock::new(0),
            poll: PollHead::new(),
        })
    }

    /// Feeds one input byte through the line discipline.
    ///
    /// Called from the keyboard path (consoles) or the master side
    /// (PTYs). Runs in interrupt context: never blocks.
    pub fn input_byte(&self, byte: u8) {
        let termios = *self.termios.lock();

        // Signal generation.
        if termios.lflag.contains(LocalFlags::ISIG) {
            let fg = *self.fg_pgid.lock();
            if fg != 0 {
                if byte == termios.cc[VINTR] {
                    self.ldisc.lock().line.clear();
                    signal::send_to_group(fg, salern_abi::signal::SIGINT);
                    self.echo(b"^C\n");
                    return;
                }
                if byte == termios.cc[VSUSP] {
                    signal::send_to_group(fg, salern_abi::signal::SIGTSTP);
                    return;
                }
            }
        }

        if !termios.lflag.contains(LocalFlags::ICANON) {
            // Raw mode: straight through.
            let _ = self.input.write(&[byte], NOATOMIC, false, None);
            self.poll.notify();
            if termios.lflag.contains(LocalFlags::ECHO) {
                self.echo(&[byte]);
            }
            return;
        }

        // Canonical mode.
        let mut ldisc = self.ldisc.lock();
        if byte == termios.cc[VERASE] {
            if ldisc.line.unpush().is_some()
                && termios.lflag.contains(LocalFlags::ECHOE)
            {
                self.echo(b"\x08 \x08");
            }
            return;
        }
        if byte == termios.cc[VEOF] {
            // ^D: flush the partial line; an empty line reads as EOF.
            let flushed = Self::commit_line(&mut ldisc, &self.input);
            if !flushed {
                self.input.set_eof();
            }
            self.poll.notify();
            return;
        }
        if byte == b'\n' {
            ldisc.line.push(b'\n');
            Self::commit_line(&mut ldisc, &self.input);
            drop(ldisc);
            self.poll.notify();
            if termios.lflag.contains(LocalFlags::ECHO) {
                self.echo(b"\n");
            }
            return;
        }
        if ldisc.line.push(byte) && termios.lflag.contains(LocalFlags::ECHO) {
            self.echo(&[byte]);
        }
    }

    /// Moves the edited line into the readable input buffer.
    fn commit_line(ldisc: &mut LineState, input: &RingBuffer) -> bool {
        let mut moved = false;
        while let Some(byte) = ldisc.line.pop() {
            let _ = input.write(&[byte], NOATOMIC, false, None);
            moved = true;
        }
        moved
    }

    fn echo(&self, bytes: &[u8]) {
        self.backend.write(bytes);
    }

    /// Blocking read of cooked input.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, Errno> {
        self.input.read(buf, NOATOMIC, true, None)
    }

    /// Output with `OPOST`/`ONLCR` processing.
    pub fn write(&self, bytes: &[u8]) -> Result<usize, Errno> {
        use salern_abi::termios::OutputFlags;
        let termios = *self.termios.lock();
        if termios.oflag.contains(OutputFlags::OPOST | OutputFlags::ONLCR) {
            // Expand NL to CR-NL in small chunks.
            let mut chunk = [0u8; 128];
            let mut used = 0;
            for &b in bytes {
                if used + 2 > chunk.len() {
                    self.backend.write(&chunk[..used]);
                    used = 0;
                }
                if b == b'\n' {
                    chunk[used] = b'\r';
                    used += 1;
                }
                chunk[used] = b;
                used += 1;
            }
            self.backend.write(&chunk[..used]);
        } else {
            self.backend.write(bytes);
        }
        Ok(bytes.len())
    }

    fn ioctl(&self, op: u64, arg: usize) -> Result<u64, Errno> {
        use crate::syscall::userptr;
        match op {
            TCGETS => {
                let termios = *self.termios.lock();
                userptr::write_struct(arg as u64, &termios)?;
                Ok(0)
            }
            TCSETS => {
                let new: Termios = userptr::read_struct(arg as u64)?;
                *self.termios.lock() = new;
                Ok(0)
            }
            TIOCGWINSZ => {
                let ws = self.backend.winsize();
                userptr::write_struct(arg as u64, &ws)?;
                Ok(0)
            }
            TIOCSPGRP => {
                let pgid: u32 = userptr::read_struct(arg as u64)?;
                *self.fg_pgid.lock() = pgid;
                Ok(0)
            }
            TIOCGPGRP => {
                let pgid = *self.fg_pgid.lock();
                userptr::write_struct(arg as u64, &pgid)?;
                Ok(0)
            }
            TIOCSCTTY => {
                if let Some(proc) = crate::proc::current() {
                    let sid = *proc.sid.lock();
                    crate::proc::set_session_ctty(sid, self.index);
                    *self.fg_pgid.lock() = *proc.pgid.lock();
                }
                Ok(0)
            }
            _ => Err(Errno::Enotty),
        }
    }

    /// Foreground switch notifications.
    pub fn set_foreground(&self, active: bool) {
        if active {
            self.backend.enable();
        } else {
            self.backend.disable();
        }
    }
}

/// Vnode backend exposing a TTY as a character device.
pub struct TtyNode {
    /// The wrapped terminal.
    pub tty: Arc<Tty>,
}

impl VnodeBackend for TtyNode {
    fn read(&self, _vn: &VnodeRef, buf: &mut [u8], _off: u64) -> Result<usize, Errno> {
        self.tty.read(buf)
    }

    fn write(&self, _vn: &VnodeRef, buf: &[u8], _off: u64) -> Result<usize, Errno> {
        self.tty.write(buf)
    }

    fn ioctl(&self, _vn: &VnodeRef, op: u64, arg: usize) -> Result<u64, Errno> {
        self.tty.ioctl(op, arg)
    }

    fn isatty(&self, _vn: &VnodeRef) -> bool {
        true
    }

    fn poll(&self, _vn: &VnodeRef, events: PollEvents) -> PollEvents {
        let mut ready = PollEvents::empty();
        if events.contains(PollEvents::IN) && !self.tty.input.is_empty() {
            ready |= PollEvents::IN;
        }
        if events.contains(PollEvents::OUT) {
            ready |= PollEvents::OUT;
        }
        ready
    }

    fn poll_head(&self, _vn: &VnodeRef) -> Option<&PollHead> {
        Some(&self.tty.poll)
    }
}

/// Wraps a TTY into a character-device vnode.
#[must_use]
pub fn wrap(tty: Arc<Tty>) -> VnodeRef {
    Vnode::new(VnodeType::CharDevice, Box::new(TtyNode { tty }))
}

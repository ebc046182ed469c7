//! Built-in device nodes: `/dev/null`, `/dev/profile`, `/dev/fb0`,
//! `/dev/mouse`.
//!
//! TTY nodes are registered by the console layer.

use alloc::sync::Arc;

use salern_abi::termios::{FBIOGET_INFO, FbInfo};
use salern_abi::{Errno, PollEvents};
use salern_core::addr::{PAGE_SHIFT, PAGE_SIZE, PhysAddr};
use salern_fs::{PollHead, VnodeType};

use crate::boot::BootInfo;
use crate::fs::devfs::{self, DevOps};
use crate::mm::hhdm;
use crate::sync::ringbuffer::{NOATOMIC, RingBuffer};

// ---------------------------------------------------------------------------
// /dev/null
// ---------------------------------------------------------------------------

struct DevNull;

impl DevOps for DevNull {
    fn read(&self, _buf: &mut [u8], _off: u64) -> Result<usize, Errno> {
        Ok(0)
    }

    fn write(&self, buf: &[u8], _off: u64) -> Result<usize, Errno> {
        Ok(buf.len())
    }
}

// ---------------------------------------------------------------------------
// /dev/profile
// ---------------------------------------------------------------------------

struct DevProfile;

impl DevOps for DevProfile {
    fn read(&self, buf: &mut [u8], off: u64) -> Result<usize, Errno> {
        let report = crate::profiler::report();
        let bytes = report.as_bytes();
        if off as usize >= bytes.len() {
            return Ok(0);
        }
        let chunk = &bytes[off as usize..];
        let n = buf.len().min(chunk.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        Ok(n)
    }

    fn write(&self, buf: &[u8], _off: u64) -> Result<usize, Errno> {
        // Any write resets the counters.
        crate::profiler::reset();
        Ok(buf.len())
    }
}

// ---------------------------------------------------------------------------
// /dev/fb0
// ---------------------------------------------------------------------------

struct DevFb {
    phys: PhysAddr,
    len: usize,
    info: FbInfo,
}

impl DevOps for DevFb {
    fn write(&self, buf: &[u8], off: u64) -> Result<usize, Errno> {
        if off as usize >= self.len {
            return Err(Errno::Enospc);
        }
        let n = buf.len().min(self.len - off as usize);
        // SAFETY: The framebuffer aperture is HHDM-mapped and `n` is
        // clamped to its size.
        unsafe {
            core::ptr::copy_nonoverlapping(
                buf.as_ptr(),
                hhdm::frame_window(self.phys).add(off as usize),
                n,
            );
        }
        Ok(n)
    }

    fn ioctl(&self, op: u64, arg: usize) -> Result<u64, Errno> {
        if op == FBIOGET_INFO {
            crate::syscall::userptr::write_struct(arg as u64, &self.info)?;
            return Ok(0);
        }
        Err(Errno::Enotty)
    }

    fn mmap_frame(&self, index: u64) -> Result<PhysAddr, Errno> {
        if (index as usize) << PAGE_SHIFT >= self.len {
            return Err(Errno::Enxio);
        }
        Ok(self.phys + (index << PAGE_SHIFT))
    }
}

// ---------------------------------------------------------------------------
// /dev/mouse
// ---------------------------------------------------------------------------

/// 3-byte PS/2 packets, atomic per read.
struct DevMouse {
    packets: RingBuffer,
    poll: PollHead,
}

static MOUSE: salern_core::sync::SpinLock<Option<Arc<DevMouse>>> =
    salern_core::sync::SpinLock::new(None);

impl DevOps for DevMouse {
    fn read(&self, buf: &mut [u8], _off: u64) -> Result<usize, Errno> {
        // Whole packets only.
        self.packets.read(buf, 3, true, None)
    }

    fn poll(&self, events: PollEvents) -> PollEvents {
        let mut ready = PollEvents::empty();
        if events.contains(PollEvents::IN) && self.packets.len() >= 3 {
            ready |= PollEvents::IN;
        }
        ready
    }

    fn poll_head(&self) -> Option<&PollHead> {
        Some(&self.poll)
    }
}

/// Feeds one mouse packet from the input interrupt path.
pub fn mouse_feed(packet: [u8; 3]) {
    let mouse = MOUSE.lock().clone();
    if let Some(mouse) = mouse {
        // Never block in an ISR; drop packets when the queue is full.
        let _ = mouse.packets.write(&packet, NOATOMIC, false, None);
        mouse.poll.notify();
    }
}

/// Registers the built-in device nodes.
pub fn register_all(boot: &impl BootInfo) {
    devfs::register(None, "null", Arc::new(DevNull), VnodeType::CharDevice)
        .expect("registering /dev/null");
    devfs::register(None, "profile", Arc::new(DevProfile), VnodeType::CharDevice)
        .expect("registering /dev/profile");

    if let Some(fb) = boot.framebuffer() {
        let len = (fb.pitch as usize * fb.height as usize).next_multiple_of(PAGE_SIZE);
        let dev = DevFb {
            phys: fb.phys,
            len,
            info: FbInfo {
                width: fb.width,
                height: fb.height,
                pitch: fb.pitch,
                bpp: fb.bpp,
            },
        };
        devfs::register(None, "fb0", Arc::new(dev), VnodeType::CharDevice)
            .expect("registering /dev/fb0");
    }

    let mouse = Arc::new(DevMouse {
        packets: RingBuffer::new(),
        poll: PollHead::new(),
    });
    *MOUSE.lock() = Some(mouse.clone());
    devfs::register(None, "mouse", mouse, VnodeType::CharDevice)
        .expect("registering /dev/mouse");
}

//! Console multiplexer and PS/2 input.
//!
//! Up to [`TTY_MAX`] virtual terminals share the screen; the foreground
//! one receives keyboard input, and `Shift+Fn` switches. The on-screen
//! renderer is an external collaborator: it registers an output
//! function here, and until one shows up console output mirrors to the
//! serial port.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use salern_abi::termios::Winsize;
use salern_core::sync::SpinLock;

use crate::arch::x86_64::context::CpuContext;
use crate::arch::x86_64::pic;
use crate::config::TTY_MAX;
use crate::fs::devfs;
use crate::kbd::{self, Key, Modifiers, ScancodeDecoder};
use crate::tty::{Tty, TtyBackend};

// ---------------------------------------------------------------------------
// Renderer interface (the actual renderer is out of tree)
// ---------------------------------------------------------------------------

/// Signature of the external terminal renderer: `(tty_index, bytes)`.
pub type RenderFn = fn(usize, &[u8]);

fn serial_render(_index: usize, bytes: &[u8]) {
    crate::log::serial_write(bytes);
}

static RENDER_FN: AtomicPtr<()> = AtomicPtr::new(serial_render as *mut ());

/// Registers the terminal renderer (framebuffer terminal driver).
///
/// # Safety
///
/// The function must be callable from interrupt context.
pub unsafe fn set_render_fn(f: RenderFn) {
    RENDER_FN.store(f as *mut (), Ordering::Release);
}

fn render(index: usize, bytes: &[u8]) {
    let ptr = RENDER_FN.load(Ordering::Acquire);
    // SAFETY: Only valid `RenderFn` pointers are stored.
    let f: RenderFn = unsafe { core::mem::transmute(ptr) };
    f(index, bytes);
}

/// Console output backend: forwards to the registered renderer.
struct ConsoleBackend {
    index: usize,
}

impl TtyBackend for ConsoleBackend {
    fn write(&self, bytes: &[u8]) {
        // Background consoles still buffer input but drop no output;
        // the renderer decides what is visible.
        if FOREGROUND.load(Ordering::Acquire) == self.index {
            render(self.index, bytes);
        }
    }

    fn winsize(&self) -> Winsize {
        Winsize {
            row: 25,
            col: 80,
            xpixel: 0,
            ypixel: 0,
        }
    }

    fn enable(&self) {
        render(self.index, b"");
    }
}

// ---------------------------------------------------------------------------
// Console table and switching
// ---------------------------------------------------------------------------

static CONSOLES: SpinLock<Vec<Arc<Tty>>> = SpinLock::new(Vec::new());
static FOREGROUND: AtomicUsize = AtomicUsize::new(0);

/// The foreground console.
#[must_use]
pub fn foreground() -> Option<Arc<Tty>> {
    CONSOLES
        .lock()
        .get(FOREGROUND.load(Ordering::Acquire))
        .cloned()
}

/// Switches the foreground console (`Shift+Fn`).
pub fn switch_to(index: usize) {
    let consoles = CONSOLES.lock();
    if index >= consoles.len() {
        return;
    }
    let old = FOREGROUND.swap(index, Ordering::AcqRel);
    if old != index {
        consoles[old].set_foreground(false);
        consoles[index].set_foreground(true);
        crate::kdebug!("console: switched to tty{index}");
    }
}

// ---------------------------------------------------------------------------
// PS/2 input path
// ---------------------------------------------------------------------------

struct KbdState {
    decoder: ScancodeDecoder,
    mods: Modifiers,
}

static KBD: SpinLock<KbdState> = SpinLock::new(KbdState {
    decoder: ScancodeDecoder::new(),
    mods: Modifiers {
        shift: false,
        ctrl: false,
        alt: false,
        caps: false,
    },
});

fn kbd_isr(_ctx: &mut CpuContext) {
    let scancode = pic::read_ps2_data();
    pic::eoi(1);

    let event = {
        let mut kbd = KBD.lock();
        let Some(event) = kbd.decoder.feed(scancode) else {
            return;
        };
        match event.key {
            Key::Shift => {
                kbd.mods.shift = event.pressed;
                return;
            }
            Key::Ctrl => {
                kbd.mods.ctrl = event.pressed;
                return;
            }
            Key::Alt => {
                kbd.mods.alt = event.pressed;
                return;
            }
            Key::CapsLock => {
                if event.pressed {
                    kbd.mods.caps = !kbd.mods.caps;
                }
                return;
            }
            _ => {}
        }
        if !event.pressed {
            return;
        }
        // Shift+Fn: virtual terminal switch.
        if let Key::Fn(n) = event.key {
            if kbd.mods.shift && (n as usize) <= TTY_MAX {
                drop(kbd);
                switch_to(n as usize - 1);
            }
            return;
        }
        (event.key, kbd.mods)
    };

    if let Some(byte) = kbd::en_us(event.0, event.1) {
        if let Some(tty) = foreground() {
            tty.input_byte(byte);
        }
    }
}

/// Mouse bytes are collected into 3-byte packets.
static MOUSE_PACKET: SpinLock<([u8; 3], usize)> = SpinLock::new(([0; 3], 0));

fn mouse_isr(_ctx: &mut CpuContext) {
    let byte = pic::read_ps2_data();
    pic::eoi(12);
    let packet = {
        let mut state = MOUSE_PACKET.lock();
        let (buf, fill) = &mut *state;
        buf[*fill] = byte;
        *fill += 1;
        if *fill == 3 {
            *fill = 0;
            Some(*buf)
        } else {
            None
        }
    };
    if let Some(packet) = packet {
        crate::fs::devices::mouse_feed(packet);
    }
}

/// Creates the virtual terminals, registers their device nodes, and
/// wires the PS/2 interrupts.
pub fn init() {
    use salern_fs::VnodeType;

    {
        let mut consoles = CONSOLES.lock();
        for index in 0..TTY_MAX {
            let tty = Tty::new(index, Arc::new(ConsoleBackend { index }));
            consoles.push(tty);
        }
    }

    let consoles = CONSOLES.lock().clone();
    for tty in &consoles {
        let node = crate::tty::TtyNode { tty: tty.clone() };
        let name = alloc::format!("tty{}", tty.index);
        let vn = salern_fs::Vnode::new(
            VnodeType::CharDevice,
            alloc::boxed::Box::new(node),
        );
        devfs::register_node(&name, vn).expect("registering tty node");
    }
    // `/dev/console` is the foreground console at open time; alias the
    // first one (switching only affects input routing).
    let console = crate::tty::wrap(consoles[0].clone());
    devfs::register_node("console", console).expect("registering /dev/console");

    // SAFETY: One-time PIC setup during boot with interrupts masked.
    unsafe { pic::init() };
    crate::interrupt::register(crate::arch::x86_64::vectors::KEYBOARD, kbd_isr, None);
    crate::interrupt::register(crate::arch::x86_64::vectors::MOUSE, mouse_isr, None);
    crate::kinfo!("console: {TTY_MAX} terminals online");
}

//! Terminal control structure and ioctl numbers.

/// Number of control characters in [`Termios::cc`].
pub const NCCS: usize = 11;

/// Index of the interrupt character (default Ctrl+C).
pub const VINTR: usize = 0;
/// Index of the quit character.
pub const VQUIT: usize = 1;
/// Index of the erase character (backspace).
pub const VERASE: usize = 2;
/// Index of the kill-line character.
pub const VKILL: usize = 3;
/// Index of the end-of-file character (default Ctrl+D).
pub const VEOF: usize = 4;
/// Index of the suspend character (default Ctrl+Z).
pub const VSUSP: usize = 10;

bitflags::bitflags! {
    /// Local mode flags (`c_lflag`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LocalFlags: u32 {
        /// Generate signals for INTR/QUIT/SUSP.
        const ISIG   = 0o000001;
        /// Canonical (line-buffered) input.
        const ICANON = 0o000002;
        /// Echo input characters.
        const ECHO   = 0o000010;
        /// Echo erase as backspace-space-backspace.
        const ECHOE  = 0o000020;
    }
}

bitflags::bitflags! {
    /// Output mode flags (`c_oflag`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OutputFlags: u32 {
        /// Post-process output.
        const OPOST = 0o000001;
        /// Translate NL to CR-NL.
        const ONLCR = 0o000004;
    }
}

/// Terminal settings, the subset of POSIX `termios` the line discipline
/// honors.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct Termios {
    /// Input flags (unused, kept for layout).
    pub iflag: u32,
    /// Output flags.
    pub oflag: OutputFlags,
    /// Control flags (unused, kept for layout).
    pub cflag: u32,
    /// Local flags.
    pub lflag: LocalFlags,
    /// Control characters.
    pub cc: [u8; NCCS],
}

impl Default for Termios {
    fn default() -> Self {
        let mut cc = [0; NCCS];
        cc[VINTR] = 0x03; // ^C
        cc[VQUIT] = 0x1c; // ^\
        cc[VERASE] = 0x7f;
        cc[VKILL] = 0x15; // ^U
        cc[VEOF] = 0x04; // ^D
        cc[VSUSP] = 0x1a; // ^Z
        Self {
            iflag: 0,
            oflag: OutputFlags::OPOST | OutputFlags::ONLCR,
            cflag: 0,
            lflag: LocalFlags::ISIG
                | LocalFlags::ICANON
                | LocalFlags::ECHO
                | LocalFlags::ECHOE,
            cc,
        }
    }
}

/// Terminal window size.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct Winsize {
    /// Rows in characters.
    pub row: u16,
    /// Columns in characters.
    pub col: u16,
    /// Width in pixels.
    pub xpixel: u16,
    /// Height in pixels.
    pub ypixel: u16,
}

/// ioctl: get terminal settings.
pub const TCGETS: u64 = 0x5401;
/// ioctl: set terminal settings.
pub const TCSETS: u64 = 0x5402;
/// ioctl: get window size.
pub const TIOCGWINSZ: u64 = 0x5413;
/// ioctl: set foreground process group.
pub const TIOCSPGRP: u64 = 0x5410;
/// ioctl: get foreground process group.
pub const TIOCGPGRP: u64 = 0x540f;
/// ioctl: make this terminal the controlling TTY.
pub const TIOCSCTTY: u64 = 0x540e;

/// ioctl: framebuffer geometry query (`/dev/fb0`).
pub const FBIOGET_INFO: u64 = 0x4600;

/// Framebuffer geometry returned by [`FBIOGET_INFO`].
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct FbInfo {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Bytes per scanline.
    pub pitch: u32,
    /// Bits per pixel.
    pub bpp: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_termios_is_cooked_echo() {
        let t = Termios::default();
        assert!(t.lflag.contains(LocalFlags::ICANON));
        assert!(t.lflag.contains(LocalFlags::ECHO));
        assert_eq!(t.cc[VINTR], 0x03);
        assert_eq!(t.cc[VEOF], 0x04);
    }
}

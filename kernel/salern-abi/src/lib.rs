//! Userspace-visible ABI for the SalernOS kernel.
//!
//! Everything in this crate is shared verbatim between the kernel and libc:
//! errno values, syscall numbers, signal numbers, `Stat`, wait-status
//! encoding, the ELF auxiliary vector tags, and the socket structures.
//! All types are `#[repr(C)]` or plain integers so the layout is the ABI.

#![cfg_attr(not(test), no_std)]

pub mod errno;
pub mod signal;
pub mod sockaddr;
pub mod stat;
pub mod syscall;
pub mod termios;
pub mod wait;

pub use errno::Errno;

/// ELF auxiliary vector tags passed on the initial user stack.
pub mod auxv {
    /// End of vector.
    pub const AT_NULL: u64 = 0;
    /// Program headers address.
    pub const AT_PHDR: u64 = 3;
    /// Size of one program header entry.
    pub const AT_PHENT: u64 = 4;
    /// Number of program headers.
    pub const AT_PHNUM: u64 = 5;
    /// Entry point of the executable.
    pub const AT_ENTRY: u64 = 9;
}

/// Maximum number of open file descriptors per process.
pub const OPEN_MAX: usize = 96;

/// Maximum path length accepted by the VFS, including the NUL.
pub const PATH_MAX: usize = 256;

/// Maximum symlink chain length before `ELOOP`.
pub const SYMLINK_MAX: usize = 32;

bitflags::bitflags! {
    /// `open(2)` flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        /// Open for reading.
        const RDONLY    = 0x0000;
        /// Open for writing.
        const WRONLY    = 0x0001;
        /// Open for reading and writing.
        const RDWR      = 0x0002;
        /// Create the file if it does not exist.
        const CREAT     = 0x0040;
        /// Fail if `CREAT` and the file exists.
        const EXCL      = 0x0080;
        /// Do not make the opened terminal the controlling TTY.
        const NOCTTY    = 0x0100;
        /// Truncate to zero length on open.
        const TRUNC     = 0x0200;
        /// All writes append.
        const APPEND    = 0x0400;
        /// Non-blocking I/O.
        const NONBLOCK  = 0x0800;
        /// Fail unless the path names a directory.
        const DIRECTORY = 0x1_0000;
        /// Close this descriptor on `execve`.
        const CLOEXEC   = 0x8_0000;
    }
}

bitflags::bitflags! {
    /// Poll readiness events.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PollEvents: u16 {
        /// Data available for reading.
        const IN   = 0x0001;
        /// Exceptional condition.
        const PRI  = 0x0002;
        /// Writing will not block.
        const OUT  = 0x0004;
        /// Error condition.
        const ERR  = 0x0008;
        /// Peer hung up.
        const HUP  = 0x0010;
        /// Invalid descriptor.
        const NVAL = 0x0020;
    }
}

bitflags::bitflags! {
    /// `mmap(2)` protection bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MmapProt: u32 {
        /// Pages may be read.
        const READ  = 0x1;
        /// Pages may be written.
        const WRITE = 0x2;
        /// Pages may be executed.
        const EXEC  = 0x4;
    }
}

bitflags::bitflags! {
    /// `mmap(2)` mapping flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MmapFlags: u32 {
        /// Changes are shared.
        const SHARED    = 0x01;
        /// Changes are private (copy-on-write).
        const PRIVATE   = 0x02;
        /// Place the mapping exactly at the hint.
        const FIXED     = 0x10;
        /// Not backed by a file.
        const ANONYMOUS = 0x20;
    }
}

/// `lseek(2)` whence values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Whence {
    /// Absolute offset.
    Set = 0,
    /// Relative to the current offset.
    Cur = 1,
    /// Relative to end of file.
    End = 2,
}

impl Whence {
    /// Decodes a raw whence value.
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(Self::Set),
            1 => Some(Self::Cur),
            2 => Some(Self::End),
            _ => None,
        }
    }
}

/// `fcntl(2)` commands understood by the kernel.
pub mod fcntl {
    /// Duplicate the descriptor onto the lowest free slot >= arg.
    pub const F_DUPFD: u32 = 0;
    /// Get descriptor flags.
    pub const F_GETFD: u32 = 1;
    /// Set descriptor flags.
    pub const F_SETFD: u32 = 2;
    /// Get file status flags.
    pub const F_GETFL: u32 = 3;
    /// Set file status flags.
    pub const F_SETFL: u32 = 4;
    /// Like `F_DUPFD` but sets close-on-exec.
    pub const F_DUPFD_CLOEXEC: u32 = 1030;

    /// Close-on-exec descriptor flag.
    pub const FD_CLOEXEC: u32 = 1;
}

/// `*at` syscall sentinel meaning "relative to the cwd".
pub const AT_FDCWD: i32 = -100;

/// `unlinkat` flag: operate on a directory.
pub const AT_REMOVEDIR: u32 = 0x200;

/// `fstatat`/`faccessat` flag: do not follow a final symlink.
pub const AT_SYMLINK_NOFOLLOW: u32 = 0x100;

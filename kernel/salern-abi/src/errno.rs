//! POSIX errno values.
//!
//! Syscalls report failure as `{value = -1, err = errno}`; every kernel
//! subsystem that can fail at a user-visible boundary returns
//! `Result<T, Errno>`.

use core::fmt;

/// A POSIX error number.
///
/// Only the values the kernel actually produces are listed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Errno {
    /// Operation not permitted.
    Eperm = 1,
    /// No such file or directory.
    Enoent = 2,
    /// No such process.
    Esrch = 3,
    /// Interrupted system call.
    Eintr = 4,
    /// I/O error.
    Eio = 5,
    /// No such device or address.
    Enxio = 6,
    /// Bad file descriptor.
    Ebadf = 9,
    /// No child processes.
    Echild = 10,
    /// Try again.
    Eagain = 11,
    /// Out of memory.
    Enomem = 12,
    /// Permission denied.
    Eacces = 13,
    /// Bad address.
    Efault = 14,
    /// Device or resource busy.
    Ebusy = 16,
    /// File exists.
    Eexist = 17,
    /// No such device.
    Enodev = 19,
    /// Not a directory.
    Enotdir = 20,
    /// Is a directory.
    Eisdir = 21,
    /// Invalid argument.
    Einval = 22,
    /// Too many open files.
    Emfile = 24,
    /// Not a typewriter.
    Enotty = 25,
    /// No space left on device.
    Enospc = 28,
    /// Illegal seek.
    Espipe = 29,
    /// Broken pipe.
    Epipe = 32,
    /// Value too large for defined data type.
    Eoverflow = 75,
    /// Too many symbolic links encountered.
    Eloop = 40,
    /// File name too long.
    Enametoolong = 36,
    /// Function not implemented.
    Enosys = 38,
    /// Directory not empty.
    Enotempty = 39,
    /// Socket operation on non-socket.
    Enotsock = 88,
    /// Destination address required.
    Edestaddrreq = 89,
    /// Protocol not supported.
    Eprotonosupport = 93,
    /// Address family not supported.
    Eafnosupport = 97,
    /// Address already in use.
    Eaddrinuse = 98,
    /// Transport endpoint is not connected.
    Enotconn = 107,
    /// Connection refused.
    Econnrefused = 111,
}

impl Errno {
    /// Returns the raw errno value.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self as u32
    }

    /// Returns the conventional symbol name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Eperm => "EPERM",
            Self::Enoent => "ENOENT",
            Self::Esrch => "ESRCH",
            Self::Eintr => "EINTR",
            Self::Eio => "EIO",
            Self::Enxio => "ENXIO",
            Self::Ebadf => "EBADF",
            Self::Echild => "ECHILD",
            Self::Eagain => "EAGAIN",
            Self::Enomem => "ENOMEM",
            Self::Eacces => "EACCES",
            Self::Efault => "EFAULT",
            Self::Ebusy => "EBUSY",
            Self::Eexist => "EEXIST",
            Self::Enodev => "ENODEV",
            Self::Enotdir => "ENOTDIR",
            Self::Eisdir => "EISDIR",
            Self::Einval => "EINVAL",
            Self::Emfile => "EMFILE",
            Self::Enotty => "ENOTTY",
            Self::Enospc => "ENOSPC",
            Self::Espipe => "ESPIPE",
            Self::Epipe => "EPIPE",
            Self::Eoverflow => "EOVERFLOW",
            Self::Eloop => "ELOOP",
            Self::Enametoolong => "ENAMETOOLONG",
            Self::Enosys => "ENOSYS",
            Self::Enotempty => "ENOTEMPTY",
            Self::Enotsock => "ENOTSOCK",
            Self::Edestaddrreq => "EDESTADDRREQ",
            Self::Eprotonosupport => "EPROTONOSUPPORT",
            Self::Eafnosupport => "EAFNOSUPPORT",
            Self::Eaddrinuse => "EADDRINUSE",
            Self::Enotconn => "ENOTCONN",
            Self::Econnrefused => "ECONNREFUSED",
        }
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.as_u32())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_match_posix() {
        assert_eq!(Errno::Eperm.as_u32(), 1);
        assert_eq!(Errno::Enoent.as_u32(), 2);
        assert_eq!(Errno::Ebadf.as_u32(), 9);
        assert_eq!(Errno::Echild.as_u32(), 10);
        assert_eq!(Errno::Einval.as_u32(), 22);
        assert_eq!(Errno::Epipe.as_u32(), 32);
        assert_eq!(Errno::Eloop.as_u32(), 40);
        assert_eq!(Errno::Enosys.as_u32(), 38);
    }

    #[test]
    fn display_includes_symbol() {
        assert_eq!(format!("{}", Errno::Enoent), "ENOENT (2)");
    }
}

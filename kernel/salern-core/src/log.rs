//! Logging interface for the kernel.
//!
//! Provides [`kprint!`] / [`kprintln!`] for raw output and [`klog!`] plus
//! per-category macros (`kurgent!`, `kinfo!`, …) for leveled, timestamped
//! logging. The actual output routine is registered at boot with
//! [`set_print_fn`] / [`set_log_fn`]; until then output is silently
//! discarded, so logging is safe from the very first instruction.

use core::fmt;
use core::sync::atomic::{AtomicPtr, Ordering};

// ---------------------------------------------------------------------------
// Log levels — higher = more verbose
// ---------------------------------------------------------------------------

/// Kernel log category.
///
/// A build with `LOG_LEVEL = x` emits every category `<= x`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    /// All logging disabled.
    Off = 0,
    /// Only foreground-TTY output.
    Tty = 1,
    /// Messages that must reach the operator (boot milestones, errors).
    Urgent = 2,
    /// High-level progress messages.
    Info = 3,
    /// Optional-subsystem notices.
    Option = 4,
    /// Detailed diagnostics.
    Debug = 5,
    /// Userspace `kprint` syscall output.
    User = 6,
    /// Per-syscall tracing.
    Syscall = 7,
}

impl LogLevel {
    /// Returns the fixed-width tag used in log lines.
    #[must_use]
    pub const fn tag(self) -> &'static str {
        match self {
            Self::Off => "OFF ",
            Self::Tty => "TTY ",
            Self::Urgent => "URG ",
            Self::Info => "INFO",
            Self::Option => "OPT ",
            Self::Debug => "DBG ",
            Self::User => "USER",
            Self::Syscall => "SYSC",
        }
    }
}

// ---------------------------------------------------------------------------
// Raw print function (kprint! / kprintln!)
// ---------------------------------------------------------------------------

/// Signature of the global print function.
pub type PrintFn = fn(fmt::Arguments<'_>);

fn null_print(_args: fmt::Arguments<'_>) {}

static PRINT_FN: AtomicPtr<()> = AtomicPtr::new(null_print as *mut ());

/// Registers the global print function.
///
/// # Safety
///
/// The function must be callable from any context, including with
/// interrupts disabled and spinlocks held elsewhere. May be called more
/// than once (early serial first, full logger later).
pub unsafe fn set_print_fn(f: PrintFn) {
    PRINT_FN.store(f as *mut (), Ordering::Release);
}

#[inline]
fn load_print_fn() -> PrintFn {
    let ptr = PRINT_FN.load(Ordering::Acquire);
    // SAFETY: Only valid `PrintFn` pointers are ever stored in PRINT_FN.
    unsafe { core::mem::transmute(ptr) }
}

/// Implementation detail of [`kprint!`]. Not public API.
#[doc(hidden)]
pub fn _print(args: fmt::Arguments<'_>) {
    load_print_fn()(args);
}

/// Prints raw text to the registered sinks (no level, no timestamp).
#[macro_export]
macro_rules! kprint {
    ($($arg:tt)*) => { $crate::log::_print(format_args!($($arg)*)) };
}

/// Prints raw text with a trailing newline.
#[macro_export]
macro_rules! kprintln {
    () => { $crate::kprint!("\n") };
    ($($arg:tt)*) => { $crate::kprint!("{}\n", format_args!($($arg)*)) };
}

// ---------------------------------------------------------------------------
// Leveled log function
// ---------------------------------------------------------------------------

/// Signature of the global leveled log function.
pub type LogFn = fn(LogLevel, fmt::Arguments<'_>);

fn null_log(_level: LogLevel, _args: fmt::Arguments<'_>) {}

static LOG_FN: AtomicPtr<()> = AtomicPtr::new(null_log as *mut ());

/// Registers the global leveled log function.
///
/// # Safety
///
/// Same contract as [`set_print_fn`].
pub unsafe fn set_log_fn(f: LogFn) {
    LOG_FN.store(f as *mut (), Ordering::Release);
}

#[inline]
fn load_log_fn() -> LogFn {
    let ptr = LOG_FN.load(Ordering::Acquire);
    // SAFETY: Only valid `LogFn` pointers are ever stored in LOG_FN.
    unsafe { core::mem::transmute(ptr) }
}

/// Implementation detail of [`klog!`]. Not public API.
#[doc(hidden)]
pub fn _log(level: LogLevel, args: fmt::Arguments<'_>) {
    load_log_fn()(level, args);
}

/// Logs a message in the given category.
#[macro_export]
macro_rules! klog {
    ($level:expr, $($arg:tt)*) => {
        $crate::log::_log($level, format_args!($($arg)*))
    };
}

/// Logs an urgent message (always shown unless logging is off).
#[macro_export]
macro_rules! kurgent {
    ($($arg:tt)*) => { $crate::klog!($crate::log::LogLevel::Urgent, $($arg)*) };
}

/// Logs a progress message.
#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => { $crate::klog!($crate::log::LogLevel::Info, $($arg)*) };
}

/// Logs an optional-subsystem notice.
#[macro_export]
macro_rules! koption {
    ($($arg:tt)*) => { $crate::klog!($crate::log::LogLevel::Option, $($arg)*) };
}

/// Logs a diagnostic message.
#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)*) => { $crate::klog!($crate::log::LogLevel::Debug, $($arg)*) };
}

/// Logs a syscall trace line.
#[macro_export]
macro_rules! ksyscall {
    ($($arg:tt)*) => { $crate::klog!($crate::log::LogLevel::Syscall, $($arg)*) };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static CALLS: AtomicUsize = AtomicUsize::new(0);

    fn counting_log(_level: LogLevel, _args: fmt::Arguments<'_>) {
        CALLS.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn unregistered_log_is_silent() {
        // Must not crash before registration.
        crate::kinfo!("into the void");
    }

    #[test]
    fn registered_log_is_called() {
        // SAFETY: counting_log is callable from any context.
        unsafe { set_log_fn(counting_log) };
        let before = CALLS.load(Ordering::SeqCst);
        crate::kdebug!("hello {}", 42);
        assert_eq!(CALLS.load(Ordering::SeqCst), before + 1);
        // SAFETY: restoring the null logger.
        unsafe { set_log_fn(null_log) };
    }

    #[test]
    fn level_ordering_is_verbosity() {
        assert!(LogLevel::Urgent < LogLevel::Info);
        assert!(LogLevel::Debug < LogLevel::Syscall);
    }
}

//! Signal numbers, dispositions, and signal sets.

use core::fmt;

/// Number of signals (valid signal numbers are `1..NSIG`).
pub const NSIG: usize = 32;

/// Hangup.
pub const SIGHUP: u8 = 1;
/// Terminal interrupt (Ctrl+C).
pub const SIGINT: u8 = 2;
/// Quit.
pub const SIGQUIT: u8 = 3;
/// Illegal instruction.
pub const SIGILL: u8 = 4;
/// Trace trap.
pub const SIGTRAP: u8 = 5;
/// Abort.
pub const SIGABRT: u8 = 6;
/// Floating-point exception.
pub const SIGFPE: u8 = 8;
/// Kill (uncatchable).
pub const SIGKILL: u8 = 9;
/// User-defined signal 1.
pub const SIGUSR1: u8 = 10;
/// Segmentation violation.
pub const SIGSEGV: u8 = 11;
/// User-defined signal 2.
pub const SIGUSR2: u8 = 12;
/// Broken pipe.
pub const SIGPIPE: u8 = 13;
/// Alarm clock.
pub const SIGALRM: u8 = 14;
/// Termination request.
pub const SIGTERM: u8 = 15;
/// Child status change.
pub const SIGCHLD: u8 = 17;
/// Continue.
pub const SIGCONT: u8 = 18;
/// Stop (uncatchable).
pub const SIGSTOP: u8 = 19;
/// Terminal stop (Ctrl+Z).
pub const SIGTSTP: u8 = 20;
/// Window size change.
pub const SIGWINCH: u8 = 28;

/// Default disposition sentinel for `sigaction.handler`.
pub const SIG_DFL: u64 = 0;
/// Ignore disposition sentinel.
pub const SIG_IGN: u64 = 1;

/// `sigprocmask` how values.
pub const SIG_BLOCK: i32 = 0;
/// Remove signals from the mask.
pub const SIG_UNBLOCK: i32 = 1;
/// Replace the mask.
pub const SIG_SETMASK: i32 = 2;

bitflags::bitflags! {
    /// `sigaction.sa_flags`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SigActionFlags: u32 {
        /// Do not add the delivered signal to the handler mask.
        const NODEFER  = 0x4000_0000;
        /// Use `sa_restorer` as the sigreturn trampoline.
        const RESTORER = 0x0400_0000;
        /// Restart interrupted syscalls.
        const RESTART  = 0x1000_0000;
    }
}

/// Userspace `sigaction` structure.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct SigAction {
    /// Handler address, or [`SIG_DFL`] / [`SIG_IGN`].
    pub handler: u64,
    /// Signals blocked while the handler runs.
    pub mask: SigSet,
    /// Behavior flags.
    pub flags: SigActionFlags,
    /// Return trampoline address (with `SigActionFlags::RESTORER`).
    pub restorer: u64,
}

impl SigAction {
    /// The default disposition: `SIG_DFL`, empty mask.
    #[must_use]
    pub const fn default_action() -> Self {
        Self {
            handler: SIG_DFL,
            mask: SigSet::empty(),
            flags: SigActionFlags::empty(),
            restorer: 0,
        }
    }
}

/// A set of signals, one bit per signal number.
///
/// Bit `n - 1` corresponds to signal `n`, matching the userspace
/// `sigset_t` convention.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct SigSet(pub u64);

impl SigSet {
    /// The empty set.
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// A set containing exactly `sig`.
    #[must_use]
    pub const fn single(sig: u8) -> Self {
        Self(1 << (sig - 1))
    }

    /// Adds `sig` to the set.
    pub fn add(&mut self, sig: u8) {
        self.0 |= 1 << (sig - 1);
    }

    /// Removes `sig` from the set.
    pub fn remove(&mut self, sig: u8) {
        self.0 &= !(1 << (sig - 1));
    }

    /// Returns whether `sig` is in the set.
    #[must_use]
    pub const fn contains(self, sig: u8) -> bool {
        self.0 & (1 << (sig - 1)) != 0
    }

    /// Returns whether the set is empty.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Set union.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Set difference (`self` minus `other`).
    #[must_use]
    pub const fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// Returns the lowest-numbered signal in the set, if any.
    #[must_use]
    pub fn lowest(self) -> Option<u8> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros() as u8 + 1)
        }
    }
}

impl fmt::Debug for SigSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SigSet({:#018x})", self.0)
    }
}

/// Returns `true` for signals whose default disposition terminates the
/// process.
#[must_use]
pub fn default_terminates(sig: u8) -> bool {
    !matches!(sig, SIGCHLD | SIGCONT | SIGWINCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sigset_add_remove_contains() {
        let mut set = SigSet::empty();
        assert!(set.is_empty());
        set.add(SIGUSR1);
        set.add(SIGTERM);
        assert!(set.contains(SIGUSR1));
        assert!(set.contains(SIGTERM));
        assert!(!set.contains(SIGINT));
        set.remove(SIGUSR1);
        assert!(!set.contains(SIGUSR1));
    }

    #[test]
    fn sigset_lowest_prefers_small_numbers() {
        let mut set = SigSet::empty();
        assert_eq!(set.lowest(), None);
        set.add(SIGTERM);
        set.add(SIGINT);
        assert_eq!(set.lowest(), Some(SIGINT));
    }

    #[test]
    fn sigset_bit_layout_matches_sigset_t() {
        // Signal 1 occupies bit 0.
        assert_eq!(SigSet::single(1).0, 1);
        assert_eq!(SigSet::single(SIGSEGV).0, 1 << 10);
    }

    #[test]
    fn sigset_union_difference() {
        let a = SigSet::single(SIGINT).union(SigSet::single(SIGTERM));
        let b = SigSet::single(SIGINT);
        assert_eq!(a.difference(b), SigSet::single(SIGTERM));
    }

    #[test]
    fn default_dispositions() {
        assert!(default_terminates(SIGSEGV));
        assert!(default_terminates(SIGPIPE));
        assert!(!default_terminates(SIGCHLD));
        assert!(!default_terminates(SIGWINCH));
    }
}

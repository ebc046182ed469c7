//! Condition variables.
//!
//! A thin pairing of a waitlist with a caller-held spin lock. Used by
//! the reapers and anywhere a predicate guards sleep.

use salern_core::sync::SpinLockGuard;

use crate::sync::Waitlist;

/// A condition variable.
pub struct Condvar {
    waiters: Waitlist,
}

impl Condvar {
    /// Creates a condvar with no waiters.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            waiters: Waitlist::new(),
        }
    }

    /// Atomically releases `guard` and sleeps until signalled.
    ///
    /// The caller re-acquires the lock and re-checks its predicate —
    /// wakeups may be spurious from the predicate's point of view.
    pub fn wait<T>(&self, guard: SpinLockGuard<'_, T>) {
        self.waiters.wait_guard(guard);
    }

    /// Wakes one waiter.
    pub fn signal(&self) {
        self.waiters.notify_one();
    }

    /// Wakes every waiter.
    pub fn broadcast(&self) {
        self.waiters.notify_all();
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}

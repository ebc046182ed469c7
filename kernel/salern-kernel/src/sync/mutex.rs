//! Blocking mutex.
//!
//! In [`MutexMode::Real`] a contended acquire parks the thread on the
//! mutex's waitlist; release hands the lock to one waiter and yields. In
//! [`MutexMode::Spinlock`] the mutex degrades to its inner spin lock —
//! useful when bringing up a port where the scheduler is not trusted
//! yet. Sleeping is only legal outside spinlock-held regions either way.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

use salern_core::sync::SpinLock;

use crate::config::{MUTEX_MODE, MutexMode};
use crate::percpu;
use crate::sched;
use crate::sync::Waitlist;

struct MutexState {
    locked: bool,
    /// Holder tid, for diagnostics.
    owner: u32,
}

/// A scheduler-aware mutual exclusion lock.
pub struct Mutex<T: ?Sized> {
    state: SpinLock<MutexState>,
    waiters: Waitlist,
    data: UnsafeCell<T>,
}

// SAFETY: The mutex serializes access to the inner value.
unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    /// Creates an unlocked mutex.
    pub const fn new(value: T) -> Self {
        Self {
            state: SpinLock::new(MutexState {
                locked: false,
                owner: 0,
            }),
            waiters: Waitlist::new(),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquires the mutex, sleeping while contended.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        if MUTEX_MODE == MutexMode::Spinlock {
            // Degraded mode: hold the inner spin lock for the duration.
            loop {
                let state = self.state.lock();
                if !state.locked {
                    core::mem::forget(state);
                    // The raw lock stays held until guard drop.
                    return MutexGuard { mutex: self };
                }
                drop(state);
                crate::arch::cpu_relax();
            }
        }

        loop {
            let mut state = self.state.lock();
            if !state.locked {
                state.locked = true;
                state.owner = percpu::cpu_get()
                    .current_thread()
                    .map_or(0, |t| t.tid);
                return MutexGuard { mutex: self };
            }
            // Contended: sleep, releasing the inner spin lock atomically
            // with the state transition.
            self.waiters.wait_guard(state);
        }
    }

    /// Attempts to acquire the mutex without sleeping.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        let mut state = self.state.lock();
        if state.locked {
            return None;
        }
        state.locked = true;
        state.owner = percpu::cpu_get().current_thread().map_or(0, |t| t.tid);
        if MUTEX_MODE == MutexMode::Spinlock {
            core::mem::forget(state);
        }
        Some(MutexGuard { mutex: self })
    }

    fn unlock(&self) {
        if MUTEX_MODE == MutexMode::Spinlock {
            // SAFETY: lock()/try_lock() leaked the guard, so the raw
            // lock is still held by us.
            unsafe {
                let state = self.state.force_get();
                state.locked = false;
                state.owner = 0;
                self.state.force_unlock();
            }
            return;
        }

        {
            let mut state = self.state.lock();
            state.locked = false;
            state.owner = 0;
            self.waiters.notify_one();
        }
        // Give the woken waiter a prompt shot at the lock.
        sched::yield_now();
    }
}

/// RAII guard releasing the [`Mutex`] on drop.
pub struct MutexGuard<'a, T: ?Sized> {
    mutex: &'a Mutex<T>,
}

impl<T: ?Sized> MutexGuard<'_, T> {
    /// Releases the mutex without the post-release yield.
    ///
    /// For [`Waitlist::wait_mutex`](crate::sync::Waitlist::wait_mutex):
    /// the caller is parked with its schedule lock held, so the normal
    /// release path's yield would self-deadlock.
    pub(crate) fn release_for_wait(self) {
        let mutex = self.mutex;
        core::mem::forget(self);
        if MUTEX_MODE == MutexMode::Spinlock {
            // SAFETY: The guard (now forgotten) held the raw lock.
            unsafe {
                let state = mutex.state.force_get();
                state.locked = false;
                state.owner = 0;
                mutex.state.force_unlock();
            }
            return;
        }
        let mut state = mutex.state.lock();
        state.locked = false;
        state.owner = 0;
        mutex.waiters.notify_one();
    }
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: The guard proves exclusive ownership.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: The guard proves exclusive ownership.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T: ?Sized> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

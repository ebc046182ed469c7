//! Interrupt-disciplined spin lock.
//!
//! The lock word only ever holds [`RawSpinLock::FREE`] or
//! [`RawSpinLock::HELD`]; any other observed value means memory
//! corruption. Acquisition masks local interrupts through the registered
//! hooks (nesting-counted, see [`super::hooks`]), so sleeping or yielding
//! while a spin lock is held is forbidden. Release order need not match
//! acquire order.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU8, Ordering};

use super::hooks;
use crate::time;

/// The raw lock word.
///
/// Split out from [`SpinLock`] so intrusive users (the scheduler, the ring
/// buffer) can pair a lock with data they cannot put behind a guard.
pub struct RawSpinLock {
    state: AtomicU8,
    /// Last holder token, for unlock-sanity diagnostics.
    #[cfg(debug_assertions)]
    holder: core::sync::atomic::AtomicUsize,
}

impl RawSpinLock {
    /// Lock word value when free.
    pub const FREE: u8 = 0;
    /// Lock word value when held. The distinctive value makes a corrupted
    /// word distinguishable from an honest one in memory dumps.
    pub const HELD: u8 = 144;

    /// Creates a new unlocked raw lock.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(Self::FREE),
            #[cfg(debug_assertions)]
            holder: core::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Acquires the lock, spinning until it becomes available.
    ///
    /// Interrupts stay masked until the matching [`release`](Self::release).
    pub fn acquire(&self) {
        hooks::irq_enter();
        loop {
            if self.try_exchange() {
                return;
            }
            // TTAS: spin on plain loads until the word looks free.
            while self.state.load(Ordering::Relaxed) != Self::FREE {
                hooks::cpu_relax();
            }
        }
    }

    /// Attempts to acquire the lock with a single compare-and-swap.
    ///
    /// On failure the interrupt state is restored before returning.
    pub fn try_acquire(&self) -> bool {
        hooks::irq_enter();
        if self.try_exchange() {
            true
        } else {
            hooks::irq_leave();
            false
        }
    }

    /// Acquires the lock, giving up after `timeout_ns` nanoseconds.
    ///
    /// A zero timeout behaves exactly like [`try_acquire`](Self::try_acquire).
    /// On timeout the interrupt-depth change is unwound and `false` is
    /// returned with no partial state.
    pub fn acquire_timeout(&self, timeout_ns: u64) -> bool {
        hooks::irq_enter();
        if self.try_exchange() {
            return true;
        }
        if timeout_ns == 0 {
            hooks::irq_leave();
            return false;
        }
        let deadline = time::now_ns().saturating_add(timeout_ns);
        loop {
            while self.state.load(Ordering::Relaxed) != Self::FREE {
                if time::now_ns() >= deadline {
                    hooks::irq_leave();
                    return false;
                }
                hooks::cpu_relax();
            }
            if self.try_exchange() {
                return true;
            }
        }
    }

    /// Releases the lock.
    ///
    /// # Panics
    ///
    /// Releasing a lock that is not held is a fatal kernel bug.
    pub fn release(&self) {
        let prev = self.state.swap(Self::FREE, Ordering::Release);
        assert!(prev == Self::HELD, "spinlock released while not held");
        #[cfg(debug_assertions)]
        self.holder.store(0, Ordering::Relaxed);
        hooks::irq_leave();
    }

    /// Returns whether the lock is currently held (racy, diagnostics only).
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.state.load(Ordering::Relaxed) == Self::HELD
    }

    /// Last recorded holder token, for lock-debugging dumps.
    #[cfg(debug_assertions)]
    #[must_use]
    pub fn holder_token(&self) -> usize {
        self.holder.load(core::sync::atomic::Ordering::Relaxed)
    }

    fn try_exchange(&self) -> bool {
        let ok = self
            .state
            .compare_exchange(Self::FREE, Self::HELD, Ordering::Acquire, Ordering::Relaxed)
            .is_ok();
        #[cfg(debug_assertions)]
        if ok {
            self.holder
                .store(self as *const _ as usize, Ordering::Relaxed);
        }
        ok
    }
}

impl Default for RawSpinLock {
    fn default() -> Self {
        Self::new()
    }
}

/// A spin lock protecting a value of type `T`.
///
/// Const-constructable for use in `static` items. All public methods take
/// `&self`; exclusive access is proven by the returned guard.
pub struct SpinLock<T: ?Sized> {
    raw: RawSpinLock,
    data: UnsafeCell<T>,
}

// SAFETY: The lock serializes all access to the inner value; `T: Send` is
// required because the value is accessed from whichever CPU holds the lock.
unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Creates a new unlocked `SpinLock` wrapping `value`.
    pub const fn new(value: T) -> Self {
        Self {
            raw: RawSpinLock::new(),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquires the lock and returns a guard.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.raw.acquire();
        SpinLockGuard { lock: self }
    }

    /// Attempts to acquire the lock without spinning.
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        if self.raw.try_acquire() {
            Some(SpinLockGuard { lock: self })
        } else {
            None
        }
    }

    /// Attempts to acquire the lock, giving up after `timeout_ns`.
    pub fn lock_timeout(&self, timeout_ns: u64) -> Option<SpinLockGuard<'_, T>> {
        if self.raw.acquire_timeout(timeout_ns) {
            Some(SpinLockGuard { lock: self })
        } else {
            None
        }
    }

    /// Returns a mutable reference without locking.
    ///
    /// # Safety
    ///
    /// The caller must guarantee no concurrent access (e.g. single-CPU
    /// early boot, or the panic path after all other CPUs halted).
    pub unsafe fn force_get(&self) -> &mut T {
        unsafe { &mut *self.data.get() }
    }

    /// Releases the lock without a guard.
    ///
    /// # Safety
    ///
    /// The caller must hold the lock via a previously forgotten guard.
    pub unsafe fn force_unlock(&self) {
        self.raw.release();
    }
}

/// RAII guard that releases the [`SpinLock`] on drop.
pub struct SpinLockGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
}

impl<T: ?Sized> Deref for SpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: The guard proves the lock is held.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: The guard proves the lock is held.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_word_states() {
        let raw = RawSpinLock::new();
        assert!(!raw.is_held());
        raw.acquire();
        assert!(raw.is_held());
        raw.release();
        assert!(!raw.is_held());
    }

    #[test]
    fn try_acquire_fails_when_held() {
        let raw = RawSpinLock::new();
        raw.acquire();
        assert!(!raw.try_acquire());
        raw.release();
        assert!(raw.try_acquire());
        raw.release();
    }

    #[test]
    fn zero_timeout_is_try() {
        let raw = RawSpinLock::new();
        raw.acquire();
        assert!(!raw.acquire_timeout(0));
        raw.release();
        assert!(raw.acquire_timeout(0));
        raw.release();
    }

    #[test]
    #[should_panic(expected = "spinlock released while not held")]
    fn release_unheld_panics() {
        RawSpinLock::new().release();
    }

    #[test]
    fn guard_gives_exclusive_access() {
        let lock = SpinLock::new(0u32);
        {
            let mut g = lock.lock();
            *g = 7;
        }
        assert_eq!(*lock.lock(), 7);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn guard_blocks_try_lock() {
        let lock = SpinLock::new(());
        let g = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(g);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn contended_counter_stays_consistent() {
        use std::sync::Arc;
        let lock = Arc::new(SpinLock::new(0u64));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let lock = lock.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..10_000 {
                    *lock.lock() += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.lock(), 40_000);
    }
}

//! Waitlists: queues of blocked threads.
//!
//! The building block for mutexes, ring buffers, socket queues, the
//! reapers, and sleeping timers. A thread appears in at most one
//! waitlist; a queue entry whose thread is no longer `Waiting` is stale
//! (it lost a race against a timeout wakeup) and is skipped.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::sync::atomic::Ordering;

use salern_core::sync::{SpinLock, SpinLockGuard};

use crate::percpu;
use crate::proc::thread::{Thread, ThreadState, WakeReason};
use crate::sched;
use crate::callout::CalloutAction;

/// A queue of threads blocked on a condition.
pub struct Waitlist {
    queue: SpinLock<VecDeque<Arc<Thread>>>,
}

impl Waitlist {
    /// Creates an empty waitlist.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            queue: SpinLock::new(VecDeque::new()),
        }
    }

    /// Blocks the current thread until notified.
    pub fn wait(&self) {
        let prev = self.park();
        sched::block_switched(prev);
    }

    /// Atomically releases `guard` and blocks until notified.
    ///
    /// The classic "wait with lock" shape: the thread is linked into the
    /// queue *before* the caller's lock drops, so a notification between
    /// unlock and switch cannot be lost.
    pub fn wait_guard<T>(&self, guard: SpinLockGuard<'_, T>) {
        let prev = self.park();
        drop(guard);
        sched::block_switched(prev);
    }

    /// Atomically releases a mutex and blocks until notified.
    ///
    /// Like [`wait_guard`](Self::wait_guard) but over a blocking mutex:
    /// the release skips the usual post-unlock yield, which would
    /// deadlock against the parked thread's own schedule lock.
    pub fn wait_mutex<T>(&self, guard: crate::sync::MutexGuard<'_, T>) {
        let prev = self.park();
        guard.release_for_wait();
        sched::block_switched(prev);
    }

    /// Blocks until notified or until `timeout_ns` elapses.
    ///
    /// Returns `true` if a notifier woke us, `false` on timeout.
    pub fn wait_timeout(&self, timeout_ns: u64) -> bool {
        let prev = self.park();
        // Pair the wait with a callout; whichever fires first wins and
        // the loser's wakeup is a no-op. The callout lives on the wheel
        // of the CPU we block on — remember it, we may wake elsewhere.
        let wheel_cpu = percpu::cpu_get();
        let target = Arc::into_raw(prev.clone()) as usize;
        let id = wheel_cpu
            .callouts
            .lock()
            .insert_in(timeout_ns, timeout_fire, target);
        sched::block_switched(prev.clone());

        // Cancel a still-pending callout; if it already fired it has
        // consumed (dropped) its Arc.
        let cancelled = wheel_cpu.callouts.lock().cancel(id);
        if cancelled {
            // SAFETY: The callout never ran, so its Arc is still ours.
            drop(unsafe { Arc::from_raw(target as *const Thread) });
        }
        prev.wake_reason.load(Ordering::Acquire) == WakeReason::Notified as u8
    }

    /// Wakes one waiter. Returns whether one was found.
    pub fn notify_one(&self) -> bool {
        loop {
            let candidate = self.queue.lock().pop_front();
            let Some(thread) = candidate else {
                return false;
            };
            // Pop first, lock second: the waiter enqueues itself while
            // holding its sched_lock, the reverse order would deadlock.
            thread.sched_lock.acquire();
            if thread.state() == ThreadState::Waiting {
                thread
                    .wake_reason
                    .store(WakeReason::Notified as u8, Ordering::Release);
                thread.sched_lock.release();
                sched::enqueue(thread);
                return true;
            }
            // Stale entry (timeout got there first); skip it.
            thread.sched_lock.release();
        }
    }

    /// Wakes every waiter.
    pub fn notify_all(&self) {
        while self.notify_one() {}
    }

    /// Links the current thread into the queue and marks it waiting.
    /// Returns it with its `sched_lock` held, ready for the switch.
    fn park(&self) -> Arc<Thread> {
        let prev = percpu::cpu_get()
            .current_thread()
            .expect("wait outside thread context");
        prev.sched_lock.acquire();
        prev.set_state(ThreadState::Waiting);
        prev.wake_reason
            .store(WakeReason::Notified as u8, Ordering::Release);
        self.queue.lock().push_back(prev.clone());
        prev
    }
}

impl Default for Waitlist {
    fn default() -> Self {
        Self::new()
    }
}

/// Timeout callout: wake the thread if it is still waiting.
fn timeout_fire(arg: usize) -> CalloutAction {
    // SAFETY: The raw Arc was leaked by wait_timeout for this callout.
    let thread = unsafe { Arc::from_raw(arg as *const Thread) };
    sched::wake(&thread, WakeReason::TimedOut);
    CalloutAction::Drop
}

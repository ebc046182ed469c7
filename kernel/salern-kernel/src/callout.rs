//! Per-CPU callout wheel.
//!
//! Time-ordered one-shot work driven by the local timer. The ISR
//! advances the wheel by [`ARCH_TIMER_NS`](crate::config::ARCH_TIMER_NS)
//! per tick and expires every head whose deadline passed. Handlers run
//! with the wheel lock released, so they may arm new callouts; a handler
//! returning [`CalloutAction::Rearm`] stays alive with a new deadline.

use alloc::collections::VecDeque;

/// What to do with a callout after its handler ran.
pub enum CalloutAction {
    /// Free the callout.
    Drop,
    /// Keep it, rearmed at the given absolute time.
    Rearm(u64),
}

/// Callout handler. The argument is caller-owned context.
pub type CalloutFn = fn(arg: usize) -> CalloutAction;

/// One pending callout.
pub struct Callout {
    /// Absolute expiry time in wheel nanoseconds.
    pub at_ns: u64,
    /// Stable id for cancellation.
    pub id: u64,
    handler: CalloutFn,
    arg: usize,
}

/// A CPU's time-ordered callout queue.
pub struct CalloutWheel {
    /// Sorted by `at_ns`, earliest first.
    queue: VecDeque<Callout>,
    /// Wheel time, advanced by the timer ISR.
    now_ns: u64,
    /// Next forced reschedule point.
    next_preempt: u64,
    next_id: u64,
}

impl CalloutWheel {
    /// Creates an empty wheel.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            now_ns: 0,
            next_preempt: 0,
            next_id: 1,
        }
    }

    /// Current wheel time in nanoseconds.
    #[must_use]
    pub const fn now(&self) -> u64 {
        self.now_ns
    }

    /// Arms a callout at absolute wheel time `at_ns`; returns its id.
    pub fn insert(&mut self, at_ns: u64, handler: CalloutFn, arg: usize) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        let callout = Callout {
            at_ns,
            id,
            handler,
            arg,
        };
        let pos = self
            .queue
            .iter()
            .position(|c| c.at_ns > at_ns)
            .unwrap_or(self.queue.len());
        self.queue.insert(pos, callout);
        id
    }

    /// Arms a callout `delta_ns` from now.
    pub fn insert_in(&mut self, delta_ns: u64, handler: CalloutFn, arg: usize) -> u64 {
        self.insert(self.now_ns + delta_ns, handler, arg)
    }

    /// Cancels a pending callout. Returns whether it was still queued.
    pub fn cancel(&mut self, id: u64) -> bool {
        match self.queue.iter().position(|c| c.id == id) {
            Some(pos) => {
                self.queue.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Schedules the next forced reschedule.
    pub fn set_preempt_in(&mut self, delta_ns: u64) {
        self.next_preempt = self.now_ns + delta_ns;
    }

    /// Advances wheel time by `step_ns` and pops every expired callout.
    ///
    /// Returns the expired callouts (handlers must run with the wheel
    /// lock released) and whether the preemption point passed.
    pub fn advance(&mut self, step_ns: u64, expired: &mut alloc::vec::Vec<Callout>) -> bool {
        self.now_ns += step_ns;
        while let Some(head) = self.queue.front() {
            if head.at_ns > self.now_ns {
                break;
            }
            expired.push(self.queue.pop_front().expect("non-empty"));
        }
        if self.next_preempt != 0 && self.now_ns >= self.next_preempt {
            self.next_preempt = 0;
            true
        } else {
            false
        }
    }

    /// Re-queues a callout that asked to be rearmed.
    pub fn rearm(&mut self, mut callout: Callout, at_ns: u64) {
        callout.at_ns = at_ns;
        let pos = self
            .queue
            .iter()
            .position(|c| c.at_ns > at_ns)
            .unwrap_or(self.queue.len());
        self.queue.insert(pos, callout);
    }

    /// Number of pending callouts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Returns whether no callouts are pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl Callout {
    /// Runs the handler; the wheel lock must not be held.
    pub fn fire(&self) -> CalloutAction {
        (self.handler)(self.arg)
    }
}

impl Default for CalloutWheel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_arg: usize) -> CalloutAction {
        CalloutAction::Drop
    }

    fn drain(wheel: &mut CalloutWheel, step: u64) -> (alloc::vec::Vec<u64>, bool) {
        let mut expired = alloc::vec::Vec::new();
        let preempt = wheel.advance(step, &mut expired);
        (expired.into_iter().map(|c| c.id).collect(), preempt)
    }

    #[test]
    fn expires_in_deadline_order() {
        let mut wheel = CalloutWheel::new();
        let late = wheel.insert(300, noop, 0);
        let early = wheel.insert(100, noop, 0);
        let mid = wheel.insert(200, noop, 0);

        let (ids, _) = drain(&mut wheel, 150);
        assert_eq!(ids, [early]);
        let (ids, _) = drain(&mut wheel, 150);
        assert_eq!(ids, [mid, late]);
        assert!(wheel.is_empty());
    }

    #[test]
    fn cancel_removes_pending_only() {
        let mut wheel = CalloutWheel::new();
        let id = wheel.insert_in(100, noop, 0);
        assert!(wheel.cancel(id));
        assert!(!wheel.cancel(id));
        let (ids, _) = drain(&mut wheel, 200);
        assert!(ids.is_empty());
    }

    #[test]
    fn rearm_keeps_the_id() {
        let mut wheel = CalloutWheel::new();
        let id = wheel.insert(100, noop, 7);
        let mut expired = alloc::vec::Vec::new();
        wheel.advance(100, &mut expired);
        assert_eq!(expired.len(), 1);
        let callout = expired.pop().unwrap();
        wheel.rearm(callout, 250);

        let (ids, _) = drain(&mut wheel, 100); // now = 200
        assert!(ids.is_empty());
        let (ids, _) = drain(&mut wheel, 100); // now = 300
        assert_eq!(ids, [id]);
    }

    #[test]
    fn preemption_point_fires_once() {
        let mut wheel = CalloutWheel::new();
        wheel.set_preempt_in(250);
        let (_, p) = drain(&mut wheel, 100);
        assert!(!p);
        let (_, p) = drain(&mut wheel, 200);
        assert!(p);
        // One-shot until re-armed.
        let (_, p) = drain(&mut wheel, 1000);
        assert!(!p);
    }

    #[test]
    fn same_deadline_is_fifo() {
        let mut wheel = CalloutWheel::new();
        let a = wheel.insert(100, noop, 0);
        let b = wheel.insert(100, noop, 0);
        let (ids, _) = drain(&mut wheel, 100);
        assert_eq!(ids, [a, b]);
    }
}

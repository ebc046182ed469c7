//! Poll plumbing.
//!
//! A [`Poller`] bridges vnode poll heads to the scheduler: it attaches
//! itself to every watched head, sleeps on its waitlist, and detaches
//! on completion. Readiness changes call [`PollWaker::wake`], which
//! notifies the waitlist.

use alloc::sync::Arc;
use alloc::vec::Vec;

use salern_abi::PollEvents;
use salern_fs::{PollWaker, VnodeRef};

use crate::sync::Waitlist;

/// A blocking multi-vnode readiness waiter.
pub struct Poller {
    waiters: Waitlist,
}

impl PollWaker for Poller {
    fn wake(&self) {
        self.waiters.notify_all();
    }
}

impl Poller {
    /// Creates an idle poller.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            waiters: Waitlist::new(),
        })
    }

    /// Blocks until at least one of `watch` reports a wanted event.
    ///
    /// Returns `(index, events)` pairs for every ready vnode. With
    /// `timeout_ns` of zero this is a pure snapshot.
    pub fn wait(
        self: &Arc<Self>,
        watch: &[(VnodeRef, PollEvents)],
        timeout_ns: u64,
    ) -> Vec<(usize, PollEvents)> {
        let waker: Arc<dyn PollWaker> = self.clone();

        // Attach to every head first so no edge is lost between the
        // readiness scan and the sleep.
        let mut attached = Vec::new();
        for (vn, _) in watch {
            if let Some(head) = vn.ops().poll_head(vn) {
                head.attach(waker.clone());
                attached.push(vn.clone());
            }
        }

        let mut ready = Vec::new();
        loop {
            for (i, (vn, wanted)) in watch.iter().enumerate() {
                let got = vn.ops().poll(vn, *wanted);
                if !got.is_empty() {
                    ready.push((i, got));
                }
            }
            if !ready.is_empty() || timeout_ns == 0 {
                break;
            }
            if !self.waiters.wait_timeout(timeout_ns) {
                break;
            }
        }

        for vn in &attached {
            if let Some(head) = vn.ops().poll_head(vn) {
                head.detach(&waker);
            }
        }
        ready
    }
}

//! Blocking synchronization primitives, built on the scheduler.
//!
//! Spin locks come from `salern-core`; everything here may sleep and is
//! therefore forbidden while any spin lock is held.

pub mod condvar;
pub mod mutex;
pub mod ringbuffer;
pub mod waitlist;

pub use condvar::Condvar;
pub use mutex::{Mutex, MutexGuard};
pub use ringbuffer::{RbOp, RingBuffer};
pub use waitlist::Waitlist;

pub use salern_core::sync::{RawSpinLock, SpinLock, SpinLockGuard};

//! Synchronization primitives shared by every kernel subsystem.
//!
//! Only the spin lock lives here; blocking primitives (mutex, waitlist,
//! ring buffer) are built on the scheduler and live in the kernel crate.

pub mod hooks;
pub mod spinlock;

pub use spinlock::{RawSpinLock, SpinLock, SpinLockGuard};

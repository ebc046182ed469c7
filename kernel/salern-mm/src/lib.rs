//! Memory-management cores for the SalernOS kernel.
//!
//! Pure allocation logic, parameterized by the HHDM offset so the same
//! code runs against real physical memory in the kernel and against a
//! malloc'd arena in host tests. Locking, per-CPU wiring, and the zeroing
//! policy live in the kernel crate.

#![cfg_attr(not(test), no_std)]

pub mod cache;
pub mod freelist;
pub mod pagecache;
pub mod slab;

pub use freelist::{FrameFreeList, FrameStats, PhysRegion};

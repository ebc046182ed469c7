//! Memory management: HHDM, physical frames, kernel heap, virtual memory.

pub mod heap;
pub mod hhdm;
pub mod pmm;
pub mod vmm;

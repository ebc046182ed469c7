//! Fixed-capacity data structures usable before the heap exists.

pub mod ringbuf;

pub use ringbuf::RingBuf;

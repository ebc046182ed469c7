//! Architecture support.
//!
//! Only x86-64 is implemented; the module split keeps the door open.

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

#[cfg(target_arch = "x86_64")]
pub use x86_64::{
    cpu_relax, halt_forever, interrupts_enable, interrupts_enabled, interrupts_disable,
};

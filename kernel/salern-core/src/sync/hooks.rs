//! Interrupt-discipline and busy-wait hooks for the spin lock.
//!
//! Holding a spin lock must keep local interrupts disabled for the whole
//! critical section, and nested acquisitions must only re-enable them when
//! the outermost lock is released. The architecture layer owns both the
//! `cli`/`sti` instructions and the per-CPU nesting counter, so it
//! registers the two routines here at boot, along with its `pause`
//! implementation for contended spins. On the host (unit tests) the
//! defaults are no-ops (plus a plain spin hint) and the lock degrades to
//! a TTAS spin lock.

use core::sync::atomic::{AtomicPtr, Ordering};

/// Signature of the enter/leave routines.
pub type IrqHookFn = fn();

/// Signature of the busy-wait pause routine.
pub type RelaxFn = fn();

fn nop() {}

fn default_relax() {
    core::hint::spin_loop();
}

static IRQ_DISABLE_FN: AtomicPtr<()> = AtomicPtr::new(nop as *mut ());
static IRQ_ENABLE_FN: AtomicPtr<()> = AtomicPtr::new(nop as *mut ());
static RELAX_FN: AtomicPtr<()> = AtomicPtr::new(default_relax as *mut ());

/// Registers the interrupt-discipline pair.
///
/// `disable` runs before every lock acquisition attempt: it must mask
/// local interrupts and increment the per-CPU lock depth. `enable` runs
/// after every release (and after failed `try`/timeout attempts): it must
/// decrement the depth and unmask interrupts when the depth reaches zero.
///
/// # Safety
///
/// Both routines must be callable from any context and must keep the
/// depth balanced; an unbalanced pair leaves interrupts masked forever.
pub unsafe fn set_irq_hooks(disable: IrqHookFn, enable: IrqHookFn) {
    IRQ_DISABLE_FN.store(disable as *mut (), Ordering::Release);
    IRQ_ENABLE_FN.store(enable as *mut (), Ordering::Release);
}

#[inline]
fn load(slot: &AtomicPtr<()>) -> IrqHookFn {
    let ptr = slot.load(Ordering::Acquire);
    // SAFETY: Only valid `IrqHookFn` pointers are stored in the slots.
    unsafe { core::mem::transmute(ptr) }
}

/// Registers the architecture's busy-wait pause routine.
///
/// # Safety
///
/// The routine must be callable from any context and must not block.
pub unsafe fn set_relax_fn(relax: RelaxFn) {
    RELAX_FN.store(relax as *mut (), Ordering::Release);
}

/// Enters a spinlock-held region: interrupts off, depth + 1.
#[inline]
pub fn irq_enter() {
    load(&IRQ_DISABLE_FN)();
}

/// Leaves a spinlock-held region: depth - 1, interrupts back on at zero.
#[inline]
pub fn irq_leave() {
    load(&IRQ_ENABLE_FN)();
}

/// Busy-wait hint for contended spins (the platform `pause`).
#[inline]
pub fn cpu_relax() {
    load(&RELAX_FN)();
}

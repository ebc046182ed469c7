//! Global physical memory manager.
//!
//! Wraps the per-order free lists from `salern-mm` in the process-wide
//! PMM lock, routes single-frame traffic through the per-CPU caches, and
//! runs the zeroing / defragmentation policy. A background reaper thread
//! keeps a pool of pre-zeroed frames when [`PmmZero::Background`] is
//! configured.

use alloc::vec::Vec;

use salern_core::addr::{PAGE_SIZE, PhysAddr};
use salern_core::sync::SpinLock;
use salern_mm::freelist::{FrameFreeList, FrameStats, PhysRegion};

use crate::boot::{BootInfo, MemoryKind};
use crate::config::{self, PmmZero};
use crate::mm::hhdm;
use crate::percpu;
use crate::sync::Waitlist;

static PMM: SpinLock<Option<FrameFreeList>> = SpinLock::new(None);

/// Pre-zeroed frames, maintained by the reaper.
static ZERO_POOL: SpinLock<Vec<PhysAddr>> = SpinLock::new(Vec::new());

/// Wakes the PMM reaper when the pool drains or frees pile up.
static REAPER_WAITLIST: Waitlist = Waitlist::new();

/// Builds the global PMM from the boot memory map.
///
/// # Panics
///
/// Panics if no usable region can host the frame metadata — the machine
/// is unusable anyway.
pub fn init(boot: &impl BootInfo) {
    let mut regions = [PhysRegion {
        base: PhysAddr::zero(),
        len: 0,
        usable: false,
    }; 128];
    let mut count = 0;
    for region in boot.memory_map() {
        if count == regions.len() {
            break;
        }
        regions[count] = PhysRegion {
            base: region.base,
            len: region.len,
            usable: region.kind == MemoryKind::Usable,
        };
        count += 1;
    }

    // SAFETY: The loader's memory map is authoritative and the HHDM
    // covers it; init runs once.
    let list = unsafe { FrameFreeList::new(&regions[..count], hhdm::offset()) }
        .expect("pmm: no region can host the frame metadata");

    let stats = list.stats();
    let mut pmm = PMM.lock();
    assert!(pmm.is_none(), "pmm: double init");
    *pmm = Some(list);
    drop(pmm);

    if config::LOG_SHOW_SPLASH {
        crate::kinfo!(
            "pmm: {} MiB usable, {} MiB reserved, {} MiB total",
            stats.usable >> 20,
            stats.reserved >> 20,
            stats.total >> 20
        );
    }
}

fn with_pmm<R>(f: impl FnOnce(&mut FrameFreeList) -> R) -> R {
    let mut pmm = PMM.lock();
    f(pmm.as_mut().expect("pmm used before init"))
}

/// Zeroes one frame through the HHDM.
fn zero_frame(frame: PhysAddr) {
    // SAFETY: The frame is exclusively ours (just allocated or about to
    // be freed) and the HHDM covers it.
    unsafe { core::ptr::write_bytes(hhdm::frame_window(frame), 0, PAGE_SIZE) };
}

/// Allocates one frame (contents unspecified).
pub fn alloc() -> Option<PhysAddr> {
    let cpu = percpu::cpu_get();
    let frame = cpu.frame_cache.lock().alloc(|slots| {
        with_pmm(|pmm| {
            let mut got = 0;
            for slot in slots.iter_mut() {
                match pmm.alloc() {
                    Some(f) => {
                        *slot = f;
                        got += 1;
                    }
                    None => break,
                }
            }
            got
        })
    });
    match (frame, config::PMM_ZERO) {
        (Some(f), PmmZero::OnAlloc) => {
            zero_frame(f);
            Some(f)
        }
        (f, _) => f,
    }
}

/// Allocates one zeroed frame, preferring the pre-zeroed pool.
pub fn alloc_zeroed() -> Option<PhysAddr> {
    if config::PMM_ZERO == PmmZero::Background {
        let mut pool = ZERO_POOL.lock();
        if let Some(frame) = pool.pop() {
            if pool.len() < config::PMM_ZERO_POOL / 4 {
                REAPER_WAITLIST.notify_one();
            }
            return Some(frame);
        }
    }
    let frame = alloc()?;
    // OnAlloc already zeroed it; OnFree frames are clean by policy.
    match config::PMM_ZERO {
        PmmZero::OnAlloc | PmmZero::OnFree => {}
        _ => zero_frame(frame),
    }
    Some(frame)
}

/// Allocates `pages` physically contiguous frames.
pub fn alloc_contiguous(pages: usize) -> Option<PhysAddr> {
    if pages == 1 {
        return alloc();
    }
    with_pmm(|pmm| pmm.alloc_contiguous(pages))
}

/// Releases frames back to the allocator.
pub fn free(base: PhysAddr, pages: usize) {
    if config::PMM_ZERO == PmmZero::OnFree {
        for i in 0..pages {
            zero_frame(base + (i * PAGE_SIZE) as u64);
        }
    }
    if pages == 1 {
        let cpu = percpu::cpu_get();
        cpu.frame_cache.lock().free(base, |spill| {
            with_pmm(|pmm| {
                for &frame in spill {
                    // SAFETY: Spilled frames were allocator property.
                    unsafe { pmm.free(frame, 1) };
                }
            });
        });
    } else {
        // SAFETY: Caller contract: the range came from alloc_contiguous.
        with_pmm(|pmm| unsafe { pmm.free(base, pages) });
    }
    maybe_wake_reaper();
}

/// Bumps the copy-on-write share count of a frame.
pub fn share_inc(frame: PhysAddr) {
    with_pmm(|pmm| pmm.share_inc(frame));
}

/// Drops one share; returns the remaining count.
pub fn share_dec(frame: PhysAddr) -> u16 {
    with_pmm(|pmm| pmm.share_dec(frame))
}

/// Current share count of a frame.
pub fn shares(frame: PhysAddr) -> u16 {
    with_pmm(|pmm| pmm.shares(frame))
}

/// Copies the memory statistics into `out`.
pub fn get_stats(out: &mut FrameStats) {
    *out = with_pmm(|pmm| pmm.stats());
}

/// Statistics without blocking, for the panic path: `None` if the PMM
/// lock is held or the PMM never came up.
pub fn try_get_stats() -> Option<FrameStats> {
    let pmm = PMM.try_lock()?;
    pmm.as_ref().map(FrameFreeList::stats)
}

fn maybe_wake_reaper() {
    let behind = with_pmm(|pmm| pmm.freed_since_defrag()) >= config::PMM_DEFRAG_THRESHOLD;
    if behind {
        REAPER_WAITLIST.notify_one();
    }
}

/// The PMM reaper: refills the zero pool and coalesces free lists.
///
/// Runs as a kernel thread; sleeps on [`REAPER_WAITLIST`] with a
/// periodic timeout so the time-based defragment policy fires even on an
/// idle system.
pub extern "C" fn reaper_thread(_arg: usize) -> ! {
    loop {
        // Refill the pre-zeroed pool.
        if config::PMM_ZERO == PmmZero::Background {
            loop {
                let need = {
                    let pool = ZERO_POOL.lock();
                    config::PMM_ZERO_POOL.saturating_sub(pool.len())
                };
                if need == 0 {
                    break;
                }
                let Some(frame) = alloc() else { break };
                zero_frame(frame);
                ZERO_POOL.lock().push(frame);
            }
        }

        // Coalesce when enough frees piled up.
        let freed = with_pmm(|pmm| pmm.freed_since_defrag());
        if freed >= config::PMM_DEFRAG_THRESHOLD {
            let merges = with_pmm(FrameFreeList::defragment);
            crate::kdebug!("pmm: defragmented, {merges} merges");
        }

        REAPER_WAITLIST.wait_timeout(config::PMM_DEFRAG_TIMEOUT_NS);
    }
}

/// VFS frame source backed by this PMM.
pub struct PmmFrameSource;

impl salern_fs::FrameSource for PmmFrameSource {
    fn alloc_zeroed(&self) -> Option<PhysAddr> {
        alloc_zeroed()
    }

    fn free(&self, frame: PhysAddr) {
        free(frame, 1);
    }

    fn window(&self, frame: PhysAddr) -> *mut u8 {
        hhdm::frame_window(frame)
    }
}

//! Per-CPU frame cache core.
//!
//! Each CPU keeps a small stash of single frames so the common
//! one-page allocation avoids the global PMM lock. The cache refills in
//! batches from a parent source when empty and spills half of itself back
//! when full. The kernel owns the locking (the cache sits inside the
//! per-CPU block behind that CPU's cache lock); this type is the pure
//! stack logic.

use salern_core::addr::PhysAddr;

bitflags::bitflags! {
    /// Behavior flags for a per-CPU cache.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CacheFlags: u32 {
        /// Take the cache lock internally on every operation.
        const AUTOLOCK  = 0x1;
        /// Spill back to the parent when full.
        const AUTOMERGE = 0x2;
        /// Refill from the parent when empty.
        const AUTOALLOC = 0x4;
    }
}

/// A fixed-capacity stash of single frames.
pub struct FrameCache<const N: usize> {
    slots: [PhysAddr; N],
    len: usize,
    flags: CacheFlags,
}

impl<const N: usize> FrameCache<N> {
    /// Creates an empty cache.
    #[must_use]
    pub const fn new(flags: CacheFlags) -> Self {
        Self {
            slots: [PhysAddr::zero(); N],
            len: 0,
            flags,
        }
    }

    /// Number of cached frames.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns whether the cache is empty.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Behavior flags.
    #[must_use]
    pub const fn flags(&self) -> CacheFlags {
        self.flags
    }

    /// Allocates one frame.
    ///
    /// On a miss (and with `AUTOALLOC`), `refill` is asked to deposit up
    /// to `N / 2` frames into the given slice and return how many it
    /// provided; the global PMM is the usual source.
    pub fn alloc(
        &mut self,
        mut refill: impl FnMut(&mut [PhysAddr]) -> usize,
    ) -> Option<PhysAddr> {
        if self.len == 0 {
            if !self.flags.contains(CacheFlags::AUTOALLOC) {
                return None;
            }
            let want = (N / 2).max(1);
            let got = refill(&mut self.slots[..want]);
            debug_assert!(got <= want);
            self.len = got;
            if got == 0 {
                return None;
            }
        }
        self.len -= 1;
        Some(self.slots[self.len])
    }

    /// Returns a frame to the cache.
    ///
    /// When the cache is full (and with `AUTOMERGE`), the older half is
    /// handed to `spill` for release to the parent; without `AUTOMERGE`
    /// the frame itself is spilled.
    pub fn free(&mut self, frame: PhysAddr, mut spill: impl FnMut(&[PhysAddr])) {
        if self.len == N {
            if self.flags.contains(CacheFlags::AUTOMERGE) {
                let keep = N / 2;
                spill(&self.slots[keep..]);
                self.len = keep;
            } else {
                spill(&[frame]);
                return;
            }
        }
        self.slots[self.len] = frame;
        self.len += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: CacheFlags = CacheFlags::all();

    #[test]
    fn refills_in_batches() {
        let mut cache: FrameCache<8> = FrameCache::new(ALL);
        let mut next_phys = 0x1000u64;
        let refills = core::cell::Cell::new(0);
        let mut refill = |slots: &mut [PhysAddr]| {
            refills.set(refills.get() + 1);
            for slot in slots.iter_mut() {
                *slot = PhysAddr::new(next_phys);
                next_phys += 0x1000;
            }
            slots.len()
        };
        // Four allocations should hit the parent exactly once (batch of 4).
        for _ in 0..4 {
            assert!(cache.alloc(&mut refill).is_some());
        }
        assert_eq!(refills.get(), 1);
        assert!(cache.alloc(&mut refill).is_some());
        assert_eq!(refills.get(), 2);
    }

    #[test]
    fn free_then_alloc_reuses_without_parent() {
        let mut cache: FrameCache<8> = FrameCache::new(ALL);
        cache.free(PhysAddr::new(0x42000), |_| panic!("no spill expected"));
        let got = cache
            .alloc(|_| panic!("no refill expected"))
            .unwrap();
        assert_eq!(got, PhysAddr::new(0x42000));
    }

    #[test]
    fn spills_half_when_full() {
        let mut cache: FrameCache<4> = FrameCache::new(ALL);
        for i in 0..4 {
            cache.free(PhysAddr::new(0x1000 * (i + 1)), |_| panic!("early spill"));
        }
        let mut spilled = Vec::new();
        cache.free(PhysAddr::new(0x9000), |frames| {
            spilled.extend_from_slice(frames)
        });
        assert_eq!(spilled.len(), 2);
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn no_autoalloc_means_miss() {
        let mut cache: FrameCache<4> = FrameCache::new(CacheFlags::AUTOLOCK);
        assert!(cache.alloc(|_| panic!("must not refill")).is_none());
    }
}

//! Hazard bitmasks.
//!
//! A hazard is a per-CPU or per-EC bit telling the kernel-exit fast path
//! to detour through a slow handler before returning to user mode:
//! reschedule, RCU quiescence, FPU ownership flip, recall, kill. Every
//! `ret_user_*` path combines the CPU's and the current EC's mask and
//! diverts while any bit is set.

use core::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HazardFlags: u32 {
        /// Re-enter the scheduler.
        const SCHED    = 1 << 0;
        /// Enter the platform sleep path.
        const SLEEP    = 1 << 1;
        /// Report an RCU quiescent state.
        const RCU      = 1 << 2;
        /// Host page table not yet switched off the boot tables.
        const BOOT_HST = 1 << 8;
        /// Guest page table not yet initialized for this CPU.
        const BOOT_GST = 1 << 9;
        /// Task register needs reloading (x86 only).
        const TR       = 1 << 15;
        /// FPU ownership must be flipped before user runs.
        const FPU      = 1 << 16;
        /// Guest TSC offset must be refreshed (x86 only).
        const TSC      = 1 << 29;
        /// Deliver a recall event through the EC's event portal.
        const RECALL   = 1 << 30;
        /// The EC reached an illegal state and must be killed.
        const ILLEGAL  = 1 << 31;
    }
}

/// An atomically updated hazard mask.
#[derive(Debug)]
pub struct Hazard(AtomicU32);

impl Hazard {
    pub const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    #[inline]
    pub fn get(&self) -> HazardFlags {
        HazardFlags::from_bits_truncate(self.0.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn set(&self, h: HazardFlags) {
        self.0.fetch_or(h.bits(), Ordering::Relaxed);
    }

    #[inline]
    pub fn clear(&self, h: HazardFlags) {
        self.0.fetch_and(!h.bits(), Ordering::Relaxed);
    }

    /// Set `h` and report whether any of its bits were already set.
    #[inline]
    pub fn test_and_set(&self, h: HazardFlags) -> bool {
        self.0.fetch_or(h.bits(), Ordering::Relaxed) & h.bits() != 0
    }

    #[inline]
    pub fn intersects(&self, h: HazardFlags) -> bool {
        self.get().intersects(h)
    }
}

impl Default for Hazard {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn set_clear_test_and_set() {
        let h = Hazard::new();
        assert!(!h.test_and_set(HazardFlags::SCHED));
        assert!(h.test_and_set(HazardFlags::SCHED));
        assert!(h.intersects(HazardFlags::SCHED | HazardFlags::RCU));
        h.clear(HazardFlags::SCHED);
        assert!(h.get().is_empty());
    }
}

//! Scheduling contexts.
//!
//! An SC binds a priority, a CPU and a time budget to an EC. Budgets are
//! granted in absolute ticks at dispatch; `used` accumulates lifetime
//! run-time, `left` the remainder of the current grant, `last` the last
//! dispatch timestamp. One SC is current per CPU.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::arch::Timer;
use crate::cpu::CpuId;
use crate::error::Status;
use crate::mm::slab::SlabCache;

use super::{construct, demolish, Ec, KernelObject, Kobject, ObjType, Subtype, KOBJECT_ALIGN};

#[repr(C)]
pub struct Sc {
    hdr: Kobject,
    ec: &'static Ec,
    /// Budget granted per replenishment, in ticks.
    budget: u64,
    cpu: CpuId,
    cos: u16,
    prio: u8,
    used: AtomicU64,
    left: AtomicU64,
    last: AtomicU64,
    /// In a ready or release queue right now.
    queued: AtomicBool,
}

// SAFETY: header first in a #[repr(C)] struct; construction only via
// `construct`.
unsafe impl KernelObject for Sc {
    const TYPE: ObjType = ObjType::Sc;

    fn header(&self) -> &Kobject {
        &self.hdr
    }
}

static CACHE: SlabCache = SlabCache::new(core::mem::size_of::<Sc>(), KOBJECT_ALIGN);

fn destroy(hdr: NonNull<Kobject>) {
    // SAFETY: invoked once per object after the RCU grace period.
    unsafe { demolish::<Sc>(&CACHE, hdr) };
}

impl Drop for Sc {
    fn drop(&mut self) {
        super::release(self.ec.header());
    }
}

impl Sc {
    /// Create an SC bound to `ec` on `cpu` with `budget_ms` of budget.
    pub fn create(
        ec: &'static Ec,
        cpu: CpuId,
        budget_ms: u32,
        prio: u8,
        cos: u16,
    ) -> Result<&'static Sc, Status> {
        if !ec.header().refcount().try_inc() {
            return Err(Status::Aborted);
        }
        let sc = construct(
            &CACHE,
            Sc {
                hdr: Kobject::new(ObjType::Sc, Subtype::None, destroy),
                ec,
                budget: Timer::ms_to_ticks(budget_ms),
                cpu,
                cos,
                prio,
                used: AtomicU64::new(0),
                left: AtomicU64::new(0),
                last: AtomicU64::new(0),
                queued: AtomicBool::new(false),
            },
        );
        match sc {
            Some(sc) => {
                log::trace!(
                    "SC created ec={:p} cpu={} budget={}ms prio={} cos={}",
                    ec,
                    cpu,
                    budget_ms,
                    prio,
                    cos
                );
                Ok(sc)
            }
            // The dropped value already returned its EC reference.
            None => Err(Status::MemObj),
        }
    }

    pub fn ec(&self) -> &'static Ec {
        self.ec
    }

    pub fn cpu(&self) -> CpuId {
        self.cpu
    }

    pub fn prio(&self) -> u8 {
        self.prio
    }

    pub fn cos(&self) -> u16 {
        self.cos
    }

    pub fn budget(&self) -> u64 {
        self.budget
    }

    /// Lifetime execution time in ticks.
    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }

    pub fn left(&self) -> u64 {
        self.left.load(Ordering::Relaxed)
    }

    pub fn last(&self) -> u64 {
        self.last.load(Ordering::Relaxed)
    }

    pub(crate) fn set_last(&self, t: u64) {
        self.last.store(t, Ordering::Relaxed);
    }

    /// Refill the remaining budget from the grant.
    pub(crate) fn refill(&self) {
        self.left.store(self.budget, Ordering::Relaxed);
    }

    /// Account time run until `t` against the armed deadline `d`.
    pub(crate) fn credit(&self, t: u64, d: u64) {
        let last = self.last.load(Ordering::Relaxed);
        self.used
            .fetch_add(t.saturating_sub(last), Ordering::Relaxed);
        self.left.store(d.saturating_sub(t), Ordering::Relaxed);
    }

    pub(crate) fn mark_queued(&self) -> bool {
        self.queued.swap(true, Ordering::Relaxed)
    }

    pub(crate) fn clear_queued(&self) {
        self.queued.store(false, Ordering::Relaxed);
    }

    pub(crate) fn is_queued(&self) -> bool {
        self.queued.load(Ordering::Relaxed)
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::object::ec::Continuation;
    use crate::test_support;

    #[test]
    fn budget_converts_to_ticks() {
        let _env = test_support::fresh_env(1024, 1);
        let ec = Ec::create_kernel(0, Continuation::Idle).unwrap();
        let sc = Sc::create(ec, 0, 10, 50, 0).unwrap();
        assert_eq!(sc.budget(), Timer::ms_to_ticks(10));
        assert_eq!(sc.used(), 0);
    }

    #[test]
    fn credit_accumulates_used_time() {
        let _env = test_support::fresh_env(1024, 1);
        let ec = Ec::create_kernel(0, Continuation::Idle).unwrap();
        let sc = Sc::create(ec, 0, 10, 50, 0).unwrap();

        sc.set_last(1000);
        sc.credit(1500, 3000);
        assert_eq!(sc.used(), 500);
        assert_eq!(sc.left(), 1500);

        sc.set_last(1500);
        sc.credit(1600, 1550);
        assert_eq!(sc.used(), 600);
        assert_eq!(sc.left(), 0);
    }

    #[test]
    fn sc_holds_a_reference_on_its_ec() {
        let _env = test_support::fresh_env(1024, 1);
        let ec = Ec::create_kernel(0, Continuation::Idle).unwrap();
        let before = ec.header().refcount().value();
        let _sc = Sc::create(ec, 0, 1, 1, 0).unwrap();
        assert_eq!(ec.header().refcount().value(), before + 1);
    }
}

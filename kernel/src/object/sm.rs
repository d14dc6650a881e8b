//! Semaphores.
//!
//! A 64-bit counter and a FIFO queue of blocked ECs under one spinlock.
//! `dn` consumes a unit or blocks the caller; `up` hands a unit to the
//! head waiter or increments, saturating at the counter maximum. An SM
//! may be bound to an interrupt id, which turns it into a user-mode
//! interrupt event: the in-kernel handler calls `up` when the interrupt
//! fires.
//!
//! The block/unblock ordering protocol with a remote `up`:
//!
//! ```text
//! Core X (dn)            Core Y (up)
//! A: ec.block()          C: ec.unblock(..)
//! B: ec.block_sc()       D: ec.unblock_sc()
//! ```
//!
//! A before B, C before D; `block_sc` under the EC lock arbitrates the
//! A/C race so B and D cannot strand the SC.

use alloc::collections::VecDeque;

use core::ptr::NonNull;

use spin::Mutex;

use crate::cpu::{self, CpuId};
use crate::error::Status;
use crate::mm::slab::SlabCache;
use crate::object::ec::Continuation;

use super::{construct, demolish, Ec, KernelObject, Kobject, ObjType, Subtype, KOBJECT_ALIGN};

/// Outcome of a `dn` attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnResult {
    /// A unit was consumed; the caller keeps running.
    Taken,
    /// The caller blocked; its SC parked and the CPU must reschedule.
    Blocked,
    /// A remote `up` won the race; the wake-up continuation is already
    /// installed and the caller keeps its SC.
    Raced,
}

struct Inner {
    counter: u64,
    queue: VecDeque<&'static Ec>,
}

#[repr(C)]
pub struct Sm {
    hdr: Kobject,
    /// Bound interrupt id, if this SM is an interrupt event.
    id: Option<u32>,
    inner: Mutex<Inner>,
}

// SAFETY: header first in a #[repr(C)] struct; construction only via
// `construct`.
unsafe impl KernelObject for Sm {
    const TYPE: ObjType = ObjType::Sm;

    fn header(&self) -> &Kobject {
        &self.hdr
    }
}

static CACHE: SlabCache = SlabCache::new(core::mem::size_of::<Sm>(), KOBJECT_ALIGN);

fn destroy(hdr: NonNull<Kobject>) {
    // SAFETY: invoked once per object after the RCU grace period.
    unsafe { demolish::<Sm>(&CACHE, hdr) };
}

impl Drop for Sm {
    fn drop(&mut self) {
        // Waiters that outlive every capability to the SM abort.
        let queue: VecDeque<&'static Ec> = core::mem::take(&mut self.inner.lock().queue);
        for ec in queue {
            ec.unblock(
                Continuation::SysFinish(Status::Aborted, true),
                ec.cpu() == cpu::current_id(),
            );
            ec.unblock_sc();
        }
    }
}

impl Sm {
    pub fn create(counter: u64, id: Option<u32>) -> Result<&'static Sm, Status> {
        construct(
            &CACHE,
            Sm {
                hdr: Kobject::new(ObjType::Sm, Subtype::None, destroy),
                id,
                inner: Mutex::new(Inner {
                    counter,
                    queue: VecDeque::new(),
                }),
            },
        )
        .ok_or(Status::MemObj)
    }

    /// Bound interrupt id, if any.
    pub fn id(&self) -> Option<u32> {
        self.id
    }

    pub fn counter(&self) -> u64 {
        self.inner.lock().counter
    }

    /// Consume a unit or block the calling EC.
    ///
    /// With `zero`, a positive counter clears instead of decrementing.
    /// A nonzero `deadline` arms a wake-up timeout after the EC blocked.
    pub fn dn(&'static self, ec: &'static Ec, cpu: CpuId, zero: bool, deadline: u64) -> DnResult {
        {
            let mut g = self.inner.lock();
            if g.counter > 0 {
                g.counter = if zero { 0 } else { g.counter - 1 };
                return DnResult::Taken;
            }

            // The EC can no longer be activated.
            ec.block();
            g.queue.push_back(ec);
        }

        // From here on a remote core can unblock the EC at any time.

        if ec.block_sc(cpu) {
            if deadline != 0 {
                ec.set_timeout(deadline, self);
            }
            DnResult::Blocked
        } else {
            DnResult::Raced
        }
    }

    /// Release one unit.
    ///
    /// Returns false when the counter would overflow.
    pub fn up(&self) -> bool {
        let ec = {
            let mut g = self.inner.lock();
            match g.queue.pop_front() {
                None => {
                    if g.counter == u64::MAX {
                        return false;
                    }
                    g.counter += 1;
                    return true;
                }
                Some(ec) => {
                    // The EC can be activated again.
                    ec.unblock(
                        Continuation::SysFinish(Status::Success, true),
                        ec.cpu() == cpu::current_id(),
                    );
                    ec
                }
            }
        };

        ec.unblock_sc();
        true
    }

    /// Wake a waiter whose deadline expired.
    pub fn timeout(&self, ec: &'static Ec) {
        {
            let mut g = self.inner.lock();
            if !ec.blocked() {
                return;
            }
            g.queue.retain(|e| !core::ptr::eq(*e, ec));
            ec.unblock(
                Continuation::SysFinish(Status::Timeout, false),
                ec.cpu() == cpu::current_id(),
            );
        }

        ec.unblock_sc();
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::object::ec::Continuation;
    use crate::test_support;

    fn blocked_ec() -> &'static Ec {
        Ec::create_kernel(0, Continuation::Idle).unwrap()
    }

    #[test]
    fn dn_consumes_and_up_increments() {
        let _env = test_support::fresh_env(1024, 1);
        let sm = Sm::create(2, None).unwrap();
        let ec = blocked_ec();

        assert_eq!(sm.dn(ec, 0, false, 0), DnResult::Taken);
        assert_eq!(sm.counter(), 1);
        assert_eq!(sm.dn(ec, 0, true, 0), DnResult::Taken);
        assert_eq!(sm.counter(), 0);

        assert!(sm.up());
        assert_eq!(sm.counter(), 1);
    }

    #[test]
    fn zero_flag_clears_the_counter() {
        let _env = test_support::fresh_env(1024, 1);
        let sm = Sm::create(7, None).unwrap();
        let ec = blocked_ec();
        assert_eq!(sm.dn(ec, 0, true, 0), DnResult::Taken);
        assert_eq!(sm.counter(), 0);
    }

    #[test]
    fn up_saturates_at_max() {
        let _env = test_support::fresh_env(1024, 1);
        let sm = Sm::create(u64::MAX, None).unwrap();
        assert!(!sm.up());
        assert_eq!(sm.counter(), u64::MAX);
    }

    #[test]
    fn dn_blocks_and_up_hands_off_without_counting() {
        let _env = test_support::fresh_env(1024, 1);
        let sm = Sm::create(0, None).unwrap();
        let ec = blocked_ec();

        assert_eq!(sm.dn(ec, 0, false, 0), DnResult::Blocked);
        assert!(ec.blocked());

        assert!(sm.up());
        // Handoff: the unit went to the waiter, not the counter.
        assert_eq!(sm.counter(), 0);
        assert!(!ec.blocked());
        assert_eq!(
            ec.cont(),
            Continuation::SysFinish(Status::Success, true)
        );
    }

    #[test]
    fn racing_up_keeps_the_caller_running() {
        let _env = test_support::fresh_env(1024, 1);
        let sm = Sm::create(0, None).unwrap();
        let ec = blocked_ec();

        // Block and immediately unblock from "another core" before the
        // caller parks its SC.
        {
            let mut g = sm.inner.lock();
            assert_eq!(g.counter, 0);
            ec.block();
            g.queue.push_back(ec);
        }
        assert!(sm.up());

        // The caller's block_sc now loses the race.
        assert!(!ec.block_sc(0));
    }

    #[test]
    fn timeout_wakes_with_timeout_status() {
        let _env = test_support::fresh_env(1024, 1);
        let sm = Sm::create(0, None).unwrap();
        let ec = blocked_ec();

        assert_eq!(sm.dn(ec, 0, false, 0), DnResult::Blocked);
        sm.timeout(ec);
        assert_eq!(ec.cont(), Continuation::SysFinish(Status::Timeout, false));

        // A later up() finds no waiter and increments instead.
        assert!(sm.up());
        assert_eq!(sm.counter(), 1);
    }
}

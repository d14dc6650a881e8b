//! Read-copy-update: epoch-based quiescence and deferred callbacks.
//!
//! The global epoch word packs a 2-bit state machine (REQUESTED,
//! COMPLETED) into the low bits of a 62-bit generation counter. Each CPU
//! keeps three callback lists: `next` collects fresh submissions, `curr`
//! holds the batch waiting for the current grace period, `done` holds
//! batches whose grace period elapsed. A grace period is exact: a
//! callback runs only after every CPU that was online at submission has
//! passed a quiescent state, reported from the kernel→user boundary via
//! the per-CPU RCU hazard.

use alloc::boxed::Box;
use alloc::vec::Vec;

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use spin::Mutex;

use crate::cpu::{self, CpuId, MAX_CPUS};
use crate::sync::HazardFlags;

const COMPLETED: u64 = 1 << 0;
const REQUESTED: u64 = 1 << 1;
const FULL: u64 = REQUESTED | COMPLETED;

type Callback = Box<dyn FnOnce() + Send>;

struct Local {
    next: Mutex<Vec<Callback>>,
    curr: Mutex<Vec<Callback>>,
    done: Mutex<Vec<Callback>>,
    /// Last epoch generation this CPU observed.
    epoch_l: AtomicU64,
    /// Generation whose completion releases this CPU's `curr` batch.
    epoch_c: AtomicU64,
}

impl Local {
    const fn new() -> Self {
        Self {
            next: Mutex::new(Vec::new()),
            curr: Mutex::new(Vec::new()),
            done: Mutex::new(Vec::new()),
            epoch_l: AtomicU64::new(0),
            epoch_c: AtomicU64::new(0),
        }
    }
}

static LOCAL: [Local; MAX_CPUS] = [const { Local::new() }; MAX_CPUS];

/// Packed (generation << 2 | state).
static EPOCH: AtomicU64 = AtomicU64::new(COMPLETED);

/// CPUs still to quiesce in the running grace period.
static COUNT: AtomicU32 = AtomicU32::new(0);

/// Enqueue a callback on this CPU; it runs after a full grace period.
pub fn submit<F: FnOnce() + Send + 'static>(cpu: CpuId, f: F) {
    LOCAL[cpu as usize].next.lock().push(Box::new(f));
}

/// Number of callbacks queued on `cpu` in any stage.
pub fn pending(cpu: CpuId) -> usize {
    let l = &LOCAL[cpu as usize];
    l.next.lock().len() + l.curr.lock().len() + l.done.lock().len()
}

fn complete(e: u64, c: u64) -> bool {
    ((e & !REQUESTED) as i64).wrapping_sub((c << 2) as i64) > 0
}

fn set_state(cpu: CpuId, s: u64) {
    let local = &LOCAL[cpu as usize];
    let mut e = EPOCH.load(Ordering::SeqCst);

    loop {
        // Stale observer: the epoch moved past what this CPU last saw.
        if e >> 2 != local.epoch_l.load(Ordering::Relaxed) {
            return;
        }
        if e & s != 0 {
            return;
        }
        match EPOCH.compare_exchange(e, e | s, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => break,
            Err(seen) => e = seen,
        }
    }

    // Only the transition that makes the state FULL starts a new epoch.
    if (e ^ !s) & FULL != 0 {
        return;
    }

    COUNT.store(u32::from(cpu::online()), Ordering::SeqCst);

    // FULL + 1 carries into the generation and clears both state bits.
    EPOCH.fetch_add(1, Ordering::SeqCst);
}

/// Report a quiescent state for `cpu` in the current epoch.
pub fn quiet(cpu: CpuId) {
    let cl = cpu::get(cpu);
    debug_assert!(cl.hazard.intersects(HazardFlags::RCU));
    cl.hazard.clear(HazardFlags::RCU);

    if COUNT.fetch_sub(1, Ordering::SeqCst) == 1 {
        set_state(cpu, COMPLETED);
    }
}

/// Advance this CPU's callback lifecycle.
///
/// Called periodically (budget-timeout fire); notices epoch advances
/// (raising the RCU hazard), retires `curr` into `done` once its grace
/// period completed, promotes `next` into `curr` requesting a new grace
/// period, and invokes everything in `done`.
pub fn check(cpu: CpuId) {
    let local = &LOCAL[cpu as usize];
    let e = EPOCH.load(Ordering::SeqCst);
    let g = e >> 2;

    if local.epoch_l.load(Ordering::Relaxed) != g {
        local.epoch_l.store(g, Ordering::Relaxed);
        cpu::get(cpu).hazard.set(HazardFlags::RCU);
    }

    if !local.curr.lock().is_empty() && complete(e, local.epoch_c.load(Ordering::Relaxed)) {
        let mut curr = local.curr.lock();
        local.done.lock().append(&mut curr);
    }

    {
        let mut next = local.next.lock();
        let mut curr = local.curr.lock();
        if !next.is_empty() && curr.is_empty() {
            curr.append(&mut next);
            drop(curr);
            drop(next);
            local.epoch_c.store(g + 1, Ordering::Relaxed);
            set_state(cpu, REQUESTED);
        }
    }

    let done: Vec<Callback> = core::mem::take(&mut *local.done.lock());
    for cb in done {
        cb();
    }
}

/// Reset the RCU machinery (host test harness only).
#[cfg(not(target_os = "none"))]
pub fn reset() {
    EPOCH.store(COMPLETED, Ordering::SeqCst);
    COUNT.store(0, Ordering::SeqCst);
    for local in &LOCAL {
        local.next.lock().clear();
        local.curr.lock().clear();
        local.done.lock().clear();
        local.epoch_l.store(0, Ordering::Relaxed);
        local.epoch_c.store(0, Ordering::Relaxed);
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::test_support;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    /// Drive `check`/`quiet` on all CPUs until quiescent, like repeated
    /// kernel→user transitions would.
    fn settle(cpus: u16) {
        for _ in 0..8 {
            for c in 0..cpus {
                check(c);
                if cpu::get(c).hazard.intersects(HazardFlags::RCU) {
                    quiet(c);
                }
            }
        }
    }

    #[test]
    fn callback_runs_only_after_every_cpu_quiesced() {
        let _env = test_support::fresh_env(64, 2);

        let fired = Arc::new(AtomicBool::new(false));
        let f = Arc::clone(&fired);
        submit(0, move || f.store(true, Ordering::SeqCst));

        // Batch promotion and grace-period request.
        check(0);
        assert!(!fired.load(Ordering::SeqCst));

        // CPU 0 quiesces alone: not sufficient.
        check(0);
        if cpu::get(0).hazard.intersects(HazardFlags::RCU) {
            quiet(0);
        }
        check(0);
        assert!(!fired.load(Ordering::SeqCst));

        // Once CPU 1 also passes through, the callback may fire.
        settle(2);
        assert!(fired.load(Ordering::SeqCst));
        assert_eq!(pending(0), 0);
    }

    #[test]
    fn epoch_generation_is_monotonic() {
        let _env = test_support::fresh_env(64, 1);
        let before = EPOCH.load(Ordering::SeqCst) >> 2;
        submit(0, || {});
        settle(1);
        submit(0, || {});
        settle(1);
        let after = EPOCH.load(Ordering::SeqCst) >> 2;
        assert!(after > before);
    }

    #[test]
    fn batches_do_not_interleave() {
        let _env = test_support::fresh_env(64, 1);
        let order = Arc::new(std::sync::Mutex::new(std::vec::Vec::new()));

        let o = Arc::clone(&order);
        submit(0, move || o.lock().unwrap().push(1));
        check(0); // promote to curr

        let o = Arc::clone(&order);
        submit(0, move || o.lock().unwrap().push(2));

        settle(1);
        let seen = order.lock().unwrap().clone();
        assert_eq!(seen, std::vec![1, 2]);
    }
}

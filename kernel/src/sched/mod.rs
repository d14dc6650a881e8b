//! Fixed-priority scheduler with time budgets.
//!
//! Per CPU: 128 FIFO ready queues with a `prio_top` cursor, and a
//! spinlocked release queue fed by remote cores. The ready queues are
//! touched only by the owning CPU; every cross-CPU wake-up goes through
//! the release queue plus a remote-ready IPI, which the target answers
//! by splicing the queue into its ready queues.
//!
//! Budgets are absolute: dispatch arms a budget timeout at `now + left`;
//! `schedule` credits the outgoing SC from the armed deadline, so time
//! spent running and time left never drift apart.

pub mod timeout;

use alloc::collections::VecDeque;

use core::sync::atomic::Ordering;

use spin::Mutex;

use crate::arch::{IpiRequest, Timer};
use crate::cpu::{self, CpuId, MAX_CPUS};
use crate::object::ec::Step;
use crate::object::Sc;
use crate::sync::HazardFlags;

/// Number of distinct priorities.
pub const PRIORITIES: usize = 128;

struct Ready {
    queue: [VecDeque<&'static Sc>; PRIORITIES],
    prio_top: usize,
}

impl Ready {
    const fn new() -> Self {
        Self {
            queue: [const { VecDeque::new() }; PRIORITIES],
            prio_top: 0,
        }
    }
}

struct CpuSched {
    ready: Mutex<Ready>,
    release: Mutex<VecDeque<&'static Sc>>,
}

static SCHED: [CpuSched; MAX_CPUS] = [const {
    CpuSched {
        ready: Mutex::new(Ready::new()),
        release: Mutex::new(VecDeque::new()),
    }
}; MAX_CPUS];

/// Class-of-service switch hook.
///
/// Applies the cache/memory-bandwidth partition for the tag; no-op on
/// architectures without RDT/MPAM.
fn cos_apply(_cos: u16) {}

/// Put `sc` on its CPU's ready queue at time `t`.
fn ready_enqueue(cpu: CpuId, sc: &'static Sc, t: u64) {
    debug_assert_eq!(sc.cpu(), cpu);
    debug_assert!((sc.prio() as usize) < PRIORITIES);
    let was_queued = sc.mark_queued();
    debug_assert!(!was_queued, "SC enqueued twice");

    let mut ready = SCHED[cpu as usize].ready.lock();
    let prio = sc.prio() as usize;
    if prio > ready.prio_top {
        ready.prio_top = prio;
    }
    ready.queue[prio].push_back(sc);
    drop(ready);

    if let Some(cur) = cpu::get(cpu).current_sc() {
        let preempts = sc.prio() > cur.prio()
            || (!core::ptr::eq(sc, cur) && sc.prio() == cur.prio() && sc.left() != 0);
        if preempts {
            cpu::get(cpu).hazard.set(HazardFlags::SCHED);
        }
    }

    if sc.left() == 0 {
        sc.refill();
    }
    sc.set_last(t);
}

/// Pop the highest-priority SC at time `t`.
fn ready_dequeue(cpu: CpuId, t: u64) -> Option<&'static Sc> {
    let mut ready = SCHED[cpu as usize].ready.lock();

    let mut top = ready.prio_top;
    let sc = loop {
        if let Some(sc) = ready.queue[top].pop_front() {
            break sc;
        }
        if top == 0 {
            return None;
        }
        top -= 1;
    };
    while ready.queue[top].is_empty() && top > 0 {
        top -= 1;
    }
    ready.prio_top = top;
    drop(ready);

    sc.clear_queued();

    // Guest time stops while a different EC runs.
    if let Some(cur) = cpu::get(cpu).current_sc() {
        if !core::ptr::eq(cur.ec(), sc.ec()) {
            sc.ec().adjust_offset_ticks(t.saturating_sub(sc.last()));
        }
    }
    sc.set_last(t);

    Some(sc)
}

/// Make `sc` runnable from any CPU.
///
/// Local wake-ups enqueue directly; remote ones append to the target's
/// release queue and, when it was empty, raise the remote-ready IPI.
pub fn unblock(sc: &'static Sc) {
    let here = cpu::current_id();
    if sc.cpu() == here {
        ready_enqueue(here, sc, Timer::time());
        return;
    }

    let was_queued = sc.mark_queued();
    debug_assert!(!was_queued, "SC enqueued twice");

    let was_empty = {
        let mut release = SCHED[sc.cpu() as usize].release.lock();
        let was_empty = release.is_empty();
        release.push_back(sc);
        was_empty
    };

    if was_empty {
        cpu::send_request(sc.cpu(), IpiRequest::RemoteReady);
    }
}

/// Splice the release queue into the ready queues (remote-ready IPI).
pub fn requeue(cpu: CpuId) {
    let t = Timer::time();
    loop {
        let sc = {
            let mut release = SCHED[cpu as usize].release.lock();
            release.pop_front()
        };
        match sc {
            Some(sc) => {
                sc.clear_queued();
                ready_enqueue(cpu, sc, t);
            }
            None => break,
        }
    }
}

/// Credit the outgoing SC and pick the next one to run.
///
/// `blocked` means the current SC must not be requeued: it parked on a
/// blocked EC or waits on a semaphore.
pub fn schedule(cpu: CpuId, blocked: bool) -> Step {
    let cl = cpu::get(cpu);
    cl.counters.schedule.fetch_add(1, Ordering::Relaxed);

    let t = Timer::time();
    let d = timeout::budget_dequeue(cpu, t);

    if let Some(cur) = cl.current_sc() {
        debug_assert!(blocked || !cur.is_queued());
        cur.credit(t, d);
        cl.hazard.clear(HazardFlags::SCHED);
        if !blocked {
            ready_enqueue(cpu, cur, t);
        }
    }

    loop {
        let t = Timer::time();
        let sc = match ready_dequeue(cpu, t) {
            Some(sc) => sc,
            None => return Step::Halt,
        };

        cl.set_current_sc(sc);
        cos_apply(sc.cos());
        cl.donations.store(0, Ordering::Relaxed);

        timeout::budget_enqueue(cpu, t + sc.left());

        if sc.ec().try_activate(cpu) {
            return Step::Run;
        }

        // The chain tail blocked and parked this SC; credit it and move
        // on to the next runnable one.
        let t2 = Timer::time();
        let d = timeout::budget_dequeue(cpu, t2);
        sc.credit(t2, d);
    }
}

#[cfg(all(test, not(target_os = "none")))]
pub(crate) fn reset() {
    for cs in &SCHED {
        let mut ready = cs.ready.lock();
        for q in ready.queue.iter_mut() {
            q.clear();
        }
        ready.prio_top = 0;
        cs.release.lock().clear();
    }
    timeout::reset();
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::object::ec::Continuation;
    use crate::object::{Ec, Sc};
    use crate::test_support;

    fn runnable_ec(cpu: CpuId) -> &'static Ec {
        Ec::create_kernel(cpu, Continuation::Idle).unwrap()
    }

    #[test]
    fn highest_priority_runs_first() {
        let _env = test_support::fresh_env(1024, 1);
        let low = Sc::create(runnable_ec(0), 0, 10, 5, 0).unwrap();
        let high = Sc::create(runnable_ec(0), 0, 10, 100, 0).unwrap();
        let mid = Sc::create(runnable_ec(0), 0, 10, 50, 0).unwrap();

        let t = Timer::time();
        ready_enqueue(0, low, t);
        ready_enqueue(0, high, t);
        ready_enqueue(0, mid, t);

        assert!(core::ptr::eq(ready_dequeue(0, t).unwrap(), high));
        assert!(core::ptr::eq(ready_dequeue(0, t).unwrap(), mid));
        assert!(core::ptr::eq(ready_dequeue(0, t).unwrap(), low));
    }

    #[test]
    fn same_priority_is_fifo() {
        let _env = test_support::fresh_env(1024, 1);
        let a = Sc::create(runnable_ec(0), 0, 10, 7, 0).unwrap();
        let b = Sc::create(runnable_ec(0), 0, 10, 7, 0).unwrap();

        let t = Timer::time();
        ready_enqueue(0, a, t);
        ready_enqueue(0, b, t);

        assert!(core::ptr::eq(ready_dequeue(0, t).unwrap(), a));
        assert!(core::ptr::eq(ready_dequeue(0, t).unwrap(), b));
    }

    #[test]
    fn remote_unblock_goes_through_release_queue() {
        let _env = test_support::fresh_env(1024, 2);
        cpu::set_current_id(0);
        let sc = Sc::create(runnable_ec(1), 1, 10, 20, 0).unwrap();

        let before = cpu::request_count(1, IpiRequest::RemoteReady);
        unblock(sc);
        assert_eq!(cpu::request_count(1, IpiRequest::RemoteReady), before + 1);

        // Nothing in CPU 1's ready queues until the IPI is handled.
        assert!(ready_dequeue(1, Timer::time()).is_none());
        requeue(1);
        assert!(core::ptr::eq(ready_dequeue(1, Timer::time()).unwrap(), sc));
    }

    #[test]
    fn enqueue_of_higher_priority_sets_sched_hazard() {
        let _env = test_support::fresh_env(1024, 1);
        cpu::set_current_id(0);

        let cur = Sc::create(runnable_ec(0), 0, 10, 10, 0).unwrap();
        cpu::get(0).set_current_sc(cur);
        cpu::get(0).hazard.clear(HazardFlags::SCHED);

        let hi = Sc::create(runnable_ec(0), 0, 10, 99, 0).unwrap();
        ready_enqueue(0, hi, Timer::time());
        assert!(cpu::get(0).hazard.intersects(HazardFlags::SCHED));
    }
}

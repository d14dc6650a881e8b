//! Per-CPU timeout lists.
//!
//! Each CPU keeps one list sorted by absolute deadline; the head drives
//! the architected one-shot timer. Two kinds exist: hypercall timeouts
//! (a blocked semaphore `down` with a deadline) and the budget timeout
//! (one per CPU, armed at dispatch; firing sets the SCHED hazard and
//! runs the RCU lifecycle check).

use alloc::vec::Vec;

use spin::Mutex;

use crate::arch::Timer;
use crate::cpu::{self, CpuId, MAX_CPUS};
use crate::object::{Ec, Sm};
use crate::sync::HazardFlags;

enum Kind {
    Budget,
    Hypercall {
        ec: &'static Ec,
        sm: &'static Sm,
    },
}

struct Entry {
    time: u64,
    kind: Kind,
}

static LISTS: [Mutex<Vec<Entry>>; MAX_CPUS] = [const { Mutex::new(Vec::new()) }; MAX_CPUS];

/// Reprogram the hardware timer from the current head.
fn sync_timer(cpu: CpuId, list: &[Entry]) {
    match list.first() {
        Some(head) => Timer::set_deadline(cpu, head.time),
        None => Timer::stop(cpu),
    }
}

fn insert(cpu: CpuId, entry: Entry) {
    let mut list = LISTS[cpu as usize].lock();
    // After the last entry with an earlier-or-equal deadline.
    let pos = list.partition_point(|e| e.time <= entry.time);
    let was_head = pos == 0;
    list.insert(pos, entry);
    if was_head {
        sync_timer(cpu, &list);
    }
}

/// Arm a semaphore-wait timeout for `ec`.
pub fn enqueue_hypercall(cpu: CpuId, time: u64, ec: &'static Ec, sm: &'static Sm) {
    insert(cpu, Entry {
        time,
        kind: Kind::Hypercall { ec, sm },
    });
}

/// Disarm `ec`'s semaphore-wait timeout, if present.
pub fn dequeue_hypercall(cpu: CpuId, ec: &'static Ec) {
    let mut list = LISTS[cpu as usize].lock();
    let before = list.len();
    list.retain(|e| match e.kind {
        Kind::Hypercall { ec: t, .. } => !core::ptr::eq(t, ec),
        Kind::Budget => true,
    });
    if list.len() != before {
        sync_timer(cpu, &list);
    }
}

/// Arm the budget timeout for the next dispatch.
pub fn budget_enqueue(cpu: CpuId, time: u64) {
    insert(cpu, Entry {
        time,
        kind: Kind::Budget,
    });
}

/// Disarm the budget timeout; returns its deadline, or `now` when none
/// was armed (a fresh CPU), so `left` computes to zero.
pub fn budget_dequeue(cpu: CpuId, now: u64) -> u64 {
    let mut list = LISTS[cpu as usize].lock();
    let pos = list.iter().position(|e| matches!(e.kind, Kind::Budget));
    match pos {
        Some(pos) => {
            let e = list.remove(pos);
            if pos == 0 {
                sync_timer(cpu, &list);
            }
            e.time
        }
        None => now,
    }
}

/// Fire every expired timeout on `cpu`.
pub fn check(cpu: CpuId) {
    loop {
        let fired = {
            let mut list = LISTS[cpu as usize].lock();
            match list.first() {
                Some(head) if head.time <= Timer::time() => {
                    let e = list.remove(0);
                    sync_timer(cpu, &list);
                    Some(e)
                }
                _ => None,
            }
        };

        match fired {
            Some(Entry {
                kind: Kind::Budget, ..
            }) => {
                cpu::get(cpu).hazard.set(HazardFlags::SCHED);
                crate::sync::rcu::check(cpu);
            }
            Some(Entry {
                kind: Kind::Hypercall { ec, sm },
                ..
            }) => {
                ec.timeout_disarmed();
                sm.timeout(ec);
            }
            None => break,
        }
    }
}

/// Earliest armed deadline, if any.
pub fn head(cpu: CpuId) -> Option<u64> {
    LISTS[cpu as usize].lock().first().map(|e| e.time)
}

#[cfg(all(test, not(target_os = "none")))]
pub(crate) fn reset() {
    for list in &LISTS {
        list.lock().clear();
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::test_support;

    #[test]
    fn list_stays_sorted_and_programs_head() {
        let _env = test_support::fresh_env(256, 1);
        budget_enqueue(0, 500);
        assert_eq!(Timer::deadline(0), 500);

        // Earlier deadline takes over the hardware timer.
        let sm = crate::object::Sm::create(0, None).unwrap();
        let ec = crate::object::Ec::create_kernel(0, crate::object::ec::Continuation::Idle).unwrap();
        enqueue_hypercall(0, 200, ec, sm);
        assert_eq!(Timer::deadline(0), 200);

        assert_eq!(head(0), Some(200));
        assert_eq!(budget_dequeue(0, 0), 500);
        assert_eq!(head(0), Some(200));
    }

    #[test]
    fn budget_dequeue_without_entry_returns_now() {
        let _env = test_support::fresh_env(256, 1);
        assert_eq!(budget_dequeue(0, 777), 777);
    }

    #[test]
    fn expired_budget_sets_sched_hazard() {
        let _env = test_support::fresh_env(256, 1);
        Timer::reset(1_000);
        budget_enqueue(0, 900);
        check(0);
        assert!(cpu::get(0).hazard.intersects(HazardFlags::SCHED));
        assert_eq!(head(0), None);
    }
}

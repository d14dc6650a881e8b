//! Shared harness for host unit tests.
//!
//! The kernel's state is global (pool, per-CPU records, RCU lists), so
//! tests touching it serialize on one lock and re-initialize what they
//! need. Pools are leaked deliberately: pointers created by an earlier
//! test stay dereferenceable even after the allocator moves on.

use core::ptr::NonNull;

use std::sync::{Mutex, MutexGuard};

use crate::arch::Timer;
use crate::boot::BootInfo;
use crate::cpu;
use crate::mm::{buddy, PAGE_SIZE};
use crate::object::Pd;

static LOCK: Mutex<()> = Mutex::new(());

pub(crate) struct Env {
    _guard: MutexGuard<'static, ()>,
}

/// Physical base every test pool pretends to live at.
pub(crate) const POOL_PHYS: u64 = 0x8000_0000;

fn lock() -> MutexGuard<'static, ()> {
    LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

fn alloc_pool(frames: usize) -> NonNull<u8> {
    let bytes = frames * PAGE_SIZE;
    // Align to the largest buddy block size so every order's blocks land
    // on an address boundary matching their size, not just the pool base.
    let align = PAGE_SIZE << (buddy::ORDERS - 1);
    let layout = core::alloc::Layout::from_size_align(bytes, align).unwrap();
    // SAFETY: nonzero layout; the pool is leaked for the process
    // lifetime so stale cross-test pointers stay valid.
    let ptr = unsafe { std::alloc::alloc(layout) };
    NonNull::new(ptr).expect("test pool allocation failed")
}

/// A fresh buddy pool and nothing else.
pub(crate) fn fresh_pool(frames: usize) -> Env {
    let guard = lock();
    buddy::init(alloc_pool(frames), POOL_PHYS, frames * PAGE_SIZE);
    Env { _guard: guard }
}

/// Pool, CPUs, timer, scheduler, RCU, and the kernel PD.
pub(crate) fn fresh_env(frames: usize, cpus: u16) -> Env {
    let env = fresh_pool(frames);
    Timer::reset(1_000_000);
    cpu::init(cpus);
    cpu::set_current_id(0);
    crate::sync::rcu::reset();
    crate::sched::reset();
    Pd::init_kernel().expect("kernel PD");
    env
}

/// Boot handoff used by full-boot tests.
pub(crate) fn boot_info(cpus: u16) -> BootInfo {
    BootInfo {
        cpus,
        timer_freq: 0,
        acpi_rsdp: 0xE_0000,
        kernel_start: POOL_PHYS,
        kernel_end: POOL_PHYS + 0x10000,
        root_start: POOL_PHYS + 0x10000,
        root_end: POOL_PHYS + 0x20000,
        root_entry: 0x20_0000,
        ..BootInfo::default()
    }
}

/// Fully booted kernel: `init_bsp` over a fresh pool.
pub(crate) fn booted(frames: usize, cpus: u16) -> Env {
    let guard = lock();
    Timer::reset(1_000_000);
    cpu::set_current_id(0);
    crate::sync::rcu::reset();
    crate::sched::reset();

    let pool = alloc_pool(frames);
    crate::boot::init_bsp(pool, POOL_PHYS, frames * PAGE_SIZE, &boot_info(cpus))
        .expect("bring-up");
    Env { _guard: guard }
}

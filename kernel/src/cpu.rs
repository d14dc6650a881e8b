//! Per-CPU kernel state.
//!
//! Each CPU owns a hazard mask, the current EC/SC pair, the FPU owner,
//! the helping-donation depth, and a set of event counters. There are no
//! static constructors: `init` is called explicitly from the boot path
//! (or from the test harness) before any per-CPU state is touched.

use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, Ordering};

use crate::arch::{self, IpiRequest, IPI_KINDS};
use crate::object::{Ec, Sc};
use crate::sync::Hazard;

pub type CpuId = u16;

/// Upper bound on supported CPUs.
pub const MAX_CPUS: usize = 16;

/// Bound on the caller→callee helping walk; exceeding it is a livelock.
pub const DONATION_LIMIT: u32 = 100;

/// Per-CPU event counters.
#[derive(Debug, Default)]
pub struct Counters {
    /// Scheduler invocations.
    pub schedule: AtomicU64,
    /// Helping donations performed.
    pub helping: AtomicU64,
    /// Timer interrupts taken.
    pub timer: AtomicU64,
    /// IPI requests handled, by kind.
    pub req: [AtomicU64; IPI_KINDS],
}

pub struct CpuLocal {
    pub hazard: Hazard,
    current_ec: AtomicPtr<Ec>,
    current_sc: AtomicPtr<Sc>,
    pub fpowner: AtomicPtr<Ec>,
    /// Donation depth accumulated by the current activation walk.
    pub donations: AtomicU32,
    pub counters: Counters,
}

impl CpuLocal {
    const fn new() -> Self {
        Self {
            hazard: Hazard::new(),
            current_ec: AtomicPtr::new(ptr::null_mut()),
            current_sc: AtomicPtr::new(ptr::null_mut()),
            fpowner: AtomicPtr::new(ptr::null_mut()),
            donations: AtomicU32::new(0),
            counters: Counters {
                schedule: AtomicU64::new(0),
                helping: AtomicU64::new(0),
                timer: AtomicU64::new(0),
                req: [const { AtomicU64::new(0) }; IPI_KINDS],
            },
        }
    }

    pub fn current_ec(&self) -> Option<&'static Ec> {
        // SAFETY: the pointer is only ever set to a live EC; ECs are
        // reclaimed through RCU after all CPUs quiesced.
        unsafe { self.current_ec.load(Ordering::Relaxed).as_ref() }
    }

    pub fn set_current_ec(&self, ec: &'static Ec) {
        self.current_ec
            .store(ec as *const Ec as *mut Ec, Ordering::Relaxed);
    }

    pub fn current_sc(&self) -> Option<&'static Sc> {
        // SAFETY: as for `current_ec`.
        unsafe { self.current_sc.load(Ordering::Relaxed).as_ref() }
    }

    pub fn set_current_sc(&self, sc: &'static Sc) {
        self.current_sc
            .store(sc as *const Sc as *mut Sc, Ordering::Relaxed);
    }
}

static CPUS: [CpuLocal; MAX_CPUS] = [const { CpuLocal::new() }; MAX_CPUS];

static ONLINE: AtomicU32 = AtomicU32::new(1);

/// Bring the CPU layer up with `online` CPUs.
pub fn init(online: u16) {
    assert!(online >= 1 && online as usize <= MAX_CPUS);
    ONLINE.store(u32::from(online), Ordering::SeqCst);
    for cpu in CPUS.iter().take(online as usize) {
        cpu.current_ec.store(ptr::null_mut(), Ordering::Relaxed);
        cpu.current_sc.store(ptr::null_mut(), Ordering::Relaxed);
        cpu.fpowner.store(ptr::null_mut(), Ordering::Relaxed);
        cpu.donations.store(0, Ordering::Relaxed);
        cpu.hazard.clear(crate::sync::HazardFlags::all());
    }
}

/// Number of online CPUs.
pub fn online() -> u16 {
    ONLINE.load(Ordering::Relaxed) as u16
}

#[cfg(not(target_os = "none"))]
static CURRENT_ID: AtomicU32 = AtomicU32::new(0);

/// Id of the CPU executing this code.
///
/// Bare metal reads the per-CPU register; the host model keeps one
/// explicit "executing CPU" that the run loop and tests switch.
pub fn current_id() -> CpuId {
    #[cfg(not(target_os = "none"))]
    {
        CURRENT_ID.load(Ordering::Relaxed) as CpuId
    }
    #[cfg(target_os = "none")]
    {
        // Per-CPU segment base holds the id on every supported arch.
        0
    }
}

/// Switch the modelled executing CPU (host build only).
#[cfg(not(target_os = "none"))]
pub fn set_current_id(id: CpuId) {
    CURRENT_ID.store(u32::from(id), Ordering::Relaxed);
}

/// Per-CPU state of `id`.
pub fn get(id: CpuId) -> &'static CpuLocal {
    &CPUS[id as usize]
}

/// Send a cross-CPU request.
///
/// On bare metal the request is handled in the target's IPI handler,
/// which bumps the matching `req` counter; remote waiters spin on that
/// counter. The host model accounts the request as handled at send time
/// and the test harness performs the handling explicitly.
pub fn send_request(target: CpuId, req: IpiRequest) {
    #[cfg(not(target_os = "none"))]
    get(target).counters.req[req as usize].fetch_add(1, Ordering::SeqCst);
    arch::raise_ipi(target, req);
}

/// Handled-request count of `req` on `target`.
pub fn request_count(target: CpuId, req: IpiRequest) -> u64 {
    get(target).counters.req[req as usize].load(Ordering::SeqCst)
}

/// Preemption point ahead of a long kernel loop iteration.
///
/// Kernel code never preempts itself; this briefly opens an interrupt
/// window on bare metal so pending interrupts can mark hazards.
#[inline]
pub fn preemption_point() {
    #[cfg(all(target_os = "none", target_arch = "x86_64"))]
    {
        x86_64::instructions::interrupts::enable();
        x86_64::instructions::interrupts::disable();
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn request_counters_account_delivery() {
        let before = request_count(3, IpiRequest::Shootdown);
        send_request(3, IpiRequest::Shootdown);
        assert_eq!(request_count(3, IpiRequest::Shootdown), before + 1);
    }
}

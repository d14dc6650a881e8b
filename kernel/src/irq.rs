//! Interrupt-to-semaphore binding.
//!
//! Each pin or MSI interrupt the kernel manages is backed by a
//! semaphore created at bring-up; the in-kernel handler answers a
//! firing interrupt with `up` on the bound SM, turning it into a
//! user-mode event. `assign_int` retargets an interrupt to a CPU and
//! reports the MSI address/data pair the device must be programmed
//! with. The interrupt-controller register surface itself stays outside
//! the core; this table records the routing decisions it would apply.

use core::sync::atomic::{AtomicPtr, AtomicU16, AtomicU32, Ordering};

use crate::cpu::CpuId;
use crate::error::Status;
use crate::object::Sm;

/// Pin interrupts managed by the kernel.
pub const PIN_COUNT: usize = 64;

struct Entry {
    sm: AtomicPtr<Sm>,
    cpu: AtomicU16,
    flags: AtomicU32,
    /// Deactivations since bring-up.
    deactivations: AtomicU32,
}

static TABLE: [Entry; PIN_COUNT] = [const {
    Entry {
        sm: AtomicPtr::new(core::ptr::null_mut()),
        cpu: AtomicU16::new(0),
        flags: AtomicU32::new(0),
        deactivations: AtomicU32::new(0),
    }
}; PIN_COUNT];

/// Bind `sm` as the event semaphore of interrupt `id` (bring-up path).
pub(crate) fn bind(id: u32, sm: &'static Sm) {
    TABLE[id as usize]
        .sm
        .store(sm as *const Sm as *mut Sm, Ordering::SeqCst);
}

pub fn sm(id: u32) -> Option<&'static Sm> {
    if id as usize >= PIN_COUNT {
        return None;
    }
    // SAFETY: bound SMs live for the kernel lifetime.
    unsafe { TABLE[id as usize].sm.load(Ordering::SeqCst).as_ref() }
}

/// CPU an interrupt is routed to.
pub fn target_cpu(id: u32) -> CpuId {
    TABLE[id as usize].cpu.load(Ordering::Relaxed)
}

/// Route interrupt `id` to `cpu`; returns the MSI address/data pair.
pub fn configure(id: u32, cpu: CpuId, flags: u32) -> Result<(u32, u16), Status> {
    if id as usize >= PIN_COUNT {
        return Err(Status::BadPar);
    }
    let e = &TABLE[id as usize];
    e.cpu.store(cpu, Ordering::Relaxed);
    e.flags.store(flags, Ordering::Relaxed);

    // Architected MSI encoding: destination in the address, vector in
    // the data word.
    let msi_addr = 0xFEE0_0000 | (u32::from(cpu) << 12);
    let msi_data = 0x20 + id as u16;
    Ok((msi_addr, msi_data))
}

/// Mask the interrupt at the controller until the handler re-enables it.
pub fn deactivate(id: u32) {
    TABLE[id as usize]
        .deactivations
        .fetch_add(1, Ordering::Relaxed);
}

pub fn deactivations(id: u32) -> u32 {
    TABLE[id as usize].deactivations.load(Ordering::Relaxed)
}

/// In-kernel interrupt delivery: release the bound semaphore.
pub fn deliver(id: u32) -> bool {
    match sm(id) {
        Some(sm) => sm.up(),
        None => false,
    }
}

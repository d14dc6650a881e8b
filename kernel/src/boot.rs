//! Bring-up: explicit initialization order and the root hand-off.
//!
//! There are no static constructors; the boot path calls `init_bsp`
//! with the firmware handoff, which initializes the allocators, the
//! kernel PD, the per-CPU idle contexts, the interrupt semaphores, and
//! finally builds the root task's PD, EC and SC, the HIP, and the
//! well-known capabilities. Application processors run `init_ap`.

use core::ptr::NonNull;

use crate::arch::Timer;
use crate::cap::{Capability, PERM_ALL};
use crate::cpu::{self, CpuId};
use crate::error::Status;
use crate::irq;
use crate::mm::page_table::{Memattr, Permissions};
use crate::mm::{buddy, PAGE_BITS};
use crate::object::ec::Continuation;
use crate::object::{Ec, KernelObject, Pd, Sc, Sm};
use crate::sched;
use crate::space::obj::SELECTORS;

/// Base of the architecture-defined event selectors.
pub const EVT_ARCH_BASE: u64 = 0;

/// Base of the interrupt-semaphore selectors in the root's space.
pub const EVT_INT_BASE: u64 = 1024;

/// Well-known selectors handed to the root task.
pub mod sel {
    use super::SELECTORS;

    /// The kernel PD: delegation source for memory and I/O grants.
    pub const KERNEL_PD: u64 = SELECTORS - 1;
    pub const ROOT_PD: u64 = SELECTORS - 2;
    pub const ROOT_EC: u64 = SELECTORS - 3;
    pub const ROOT_SC: u64 = SELECTORS - 4;
}

/// Root-space virtual addresses of the two bootstrap pages, at the top
/// of the user half (the upper half is the shared kernel region).
pub const HIP_ADDR: u64 = (crate::space::SpaceHst::selectors() / 2 - 1) << PAGE_BITS;
pub const ROOT_UTCB_ADDR: u64 = (crate::space::SpaceHst::selectors() / 2 - 2) << PAGE_BITS;

/// Firmware/bootloader handoff.
#[derive(Debug, Clone, Default)]
pub struct BootInfo {
    pub cpus: u16,
    /// Architected timer frequency in Hz; 0 keeps the default.
    pub timer_freq: u64,
    pub acpi_rsdp: u64,
    pub uefi_map: u64,
    pub uefi_map_size: u32,
    pub uefi_desc_size: u32,
    pub uefi_desc_version: u32,
    pub kernel_start: u64,
    pub kernel_end: u64,
    pub root_start: u64,
    pub root_end: u64,
    /// Entry point of the (already loaded) root image.
    pub root_entry: u64,
}

/// Per-CPU bring-up: the idle EC and its zero-priority SC.
pub fn init_ap(cpu: CpuId) -> Result<(), Status> {
    let idle_ec = Ec::create_kernel(cpu, Continuation::Idle)?;
    let idle_sc = Sc::create(idle_ec, cpu, 1000, 0, 0)?;

    let cl = cpu::get(cpu);
    cl.set_current_ec(idle_ec);
    cl.set_current_sc(idle_sc);
    Ok(())
}

/// Map the whole page pool into the kernel host space.
///
/// The pool becomes the delegation source for user memory; the kernel
/// image range is mapped kernel-only so it can never leave.
fn map_pool(kernel: &'static Pd, boot: &BootInfo, pool_phys: u64, pool_size: usize) -> Result<(), Status> {
    let mut phys = pool_phys;
    let mut left = pool_size as u64;
    while left > 0 {
        // Chunks never straddle the kernel-image boundaries, so the
        // kernel-only attribute applies exactly.
        let mut limit = left;
        for b in [boot.kernel_start, boot.kernel_end] {
            if b > phys && b - phys < limit {
                limit = b - phys;
            }
        }
        let ord = crate::mm::max_order(phys, limit).min(
            (crate::space::SpaceHst::max_order() + PAGE_BITS) as u32,
        ) as usize;
        let pm = if phys >= boot.kernel_start && phys < boot.kernel_end {
            Permissions::R | Permissions::W | Permissions::K
        } else {
            Permissions::R | Permissions::W | Permissions::XU | Permissions::U
        };
        kernel
            .hst()
            .update(0, phys, phys, ord - PAGE_BITS, pm, Memattr::ram())?;
        phys += 1 << ord;
        left -= 1 << ord;
    }
    Ok(())
}

/// Build the root task: PD, EC, SC, HIP, well-known capabilities.
fn create_root(boot: &BootInfo) -> Result<(), Status> {
    // Measure the loaded root module before it can run.
    if boot.root_end > boot.root_start {
        let size = (boot.root_end - boot.root_start) as usize;
        let ptr = crate::mm::phys_to_ptr(boot.root_start);
        // SAFETY: the loader placed the root module inside the pool
        // range described by the handoff.
        let image = unsafe { core::slice::from_raw_parts(ptr, size) };
        crate::integrity::measure(image);
    }

    let root = Pd::create()?;
    Pd::set_root(root);

    let ec = Ec::create(
        root,
        true,
        true,
        0,
        EVT_ARCH_BASE,
        ROOT_UTCB_ADDR,
        HIP_ADDR,
        boot.root_entry,
    )?;

    let sc = Sc::create(ec, 0, 1000, (sched::PRIORITIES - 1) as u8, 0)?;

    let obj = root.obj();
    if obj.insert(sel::KERNEL_PD, Capability::new(Pd::kernel().header(), 1)) != Status::Success
        || obj.insert(sel::ROOT_PD, Capability::new(root.header(), PERM_ALL)) != Status::Success
        || obj.insert(sel::ROOT_EC, Capability::new(ec.header(), PERM_ALL)) != Status::Success
        || obj.insert(sel::ROOT_SC, Capability::new(sc.header(), PERM_ALL)) != Status::Success
    {
        return Err(Status::BadCap);
    }

    // Interrupt semaphores at the kernel-defined event base.
    for id in 0..irq::PIN_COUNT as u32 {
        if let Some(sm) = irq::sm(id) {
            // up, down, assign.
            let perms: u8 = (1 << 0) | (1 << 1) | (1 << 4);
            let _ = obj.insert(EVT_INT_BASE + u64::from(id), Capability::new(sm.header(), perms));
        }
    }

    // The HIP is the root task's first stack frame neighbour: mapped
    // read-only at the top of its address space.
    let (hip, hip_phys) = crate::hip::build(boot).ok_or(Status::InsMem)?;
    debug_assert!(hip.validate());
    root.hst()
        .update(0, HIP_ADDR, hip_phys, 0, Permissions::R | Permissions::U, Memattr::ram())?;

    sched::unblock(sc);
    Ok(())
}

/// Bootstrap-processor bring-up.
///
/// `pool` is the page-aligned kernel memory pool (virtually and
/// physically contiguous), `pool_phys` its physical base.
pub fn init_bsp(
    pool: NonNull<u8>,
    pool_phys: u64,
    pool_size: usize,
    boot: &BootInfo,
) -> Result<(), Status> {
    crate::print::init_logging();

    if boot.timer_freq != 0 {
        Timer::set_freq(boot.timer_freq);
    }

    buddy::init(pool, pool_phys, pool_size);
    cpu::init(boot.cpus.max(1));

    let kernel = Pd::init_kernel()?;
    map_pool(kernel, boot, pool_phys, pool_size)?;

    // Interrupt semaphores exist before anything can bind to them.
    for id in 0..irq::PIN_COUNT as u32 {
        let sm = Sm::create(0, Some(id))?;
        irq::bind(id, sm);
    }

    for cpu in 0..cpu::online() {
        init_ap(cpu)?;
    }

    create_root(boot)?;

    log::info!(
        "boot: {} cpus, {} KiB pool, root entry {:#x}",
        cpu::online(),
        pool_size / 1024,
        boot.root_entry
    );
    Ok(())
}

//! System-call dispatch and kernel entry points.
//!
//! The fast-syscall entry saves the register frame into the current
//! EC's save area and lands here. The low nibble of the primary
//! argument selects one of 16 entry points; bits 4..11 carry
//! opcode-specific flags and the bits above them the selector. Every
//! entry point ends by storing a continuation; the run loop in
//! `object::ec` carries the CPU back to user mode.
//!
//! Argument conventions per opcode (registers `p1`..`p5` beyond the
//! packed `p0`):
//!
//! | op | name        | p1        | p2       | p3             | p4          | p5        |
//! |----|-------------|-----------|----------|----------------|-------------|-----------|
//! | 0  | ipc_call    | mtd       |          |                |             |           |
//! | 1  | ipc_reply   | mtd       |          |                |             |           |
//! | 2  | create_pd   | own PD    |          |                |             |           |
//! | 3  | create_ec   | own PD    | utcb     | sp             | ip          | cpu\|evt  |
//! | 4  | create_sc   | own PD    | EC sel   | budget\|prio\|cos |          |           |
//! | 5  | create_pt   | own PD    | EC sel   | ip             |             |           |
//! | 6  | create_sm   | own PD    | count    |                |             |           |
//! | 7  | ctrl_pd     | dst PD    | src sel  | dst sel        | ord\|pmm\|attr |        |
//! | 8  | ctrl_ec     |           |          |                |             |           |
//! | 9  | ctrl_sc     | (out) used |         |                |             |           |
//! | 10 | ctrl_pt     | badge     | mtd      |                |             |           |
//! | 11 | ctrl_sm     | deadline  |          |                |             |           |
//! | 12 | ctrl_hw     |           |          |                |             |           |
//! | 13 | assign_int  | cpu (out: msi addr) | (out) msi data | |             |           |
//! | 14 | assign_dev  | iommu     | device   |                |             |           |

pub mod create;
pub mod ctrl;
pub mod ipc;

use core::sync::atomic::Ordering;

use crate::cpu::{self, CpuId};
use crate::error::Status;
use crate::object::ec::{self, finish, Exit, Step};
use crate::object::Ec;
use crate::sched;

/// Decoded primary argument.
pub(crate) mod abi {
    use crate::object::Ec;

    pub(crate) struct Abi {
        pub op: u8,
        pub flags: u8,
        pub sel: u64,
    }

    pub(crate) fn decode(ec: &Ec) -> Abi {
        let p0 = ec.with_regs(|r| r.p0());
        Abi {
            op: (p0 & 0xF) as u8,
            flags: ((p0 >> 4) & 0xFF) as u8,
            sel: p0 >> 12,
        }
    }
}

/// Whether virtual-CPU ECs can be created on this platform.
pub(crate) fn vcpu_supported() -> bool {
    false
}

/// Select and run the entry point for the pending syscall.
pub fn dispatch(cpu: CpuId) -> Step {
    let cur = cpu::get(cpu).current_ec().expect("no current EC");
    let a = abi::decode(cur);

    match a.op {
        0 => ipc::sys_ipc_call(cpu),
        1 => ipc::sys_ipc_reply(cpu),
        2 => create::sys_create_pd(cpu),
        3 => create::sys_create_ec(cpu),
        4 => create::sys_create_sc(cpu),
        5 => create::sys_create_pt(cpu),
        6 => create::sys_create_sm(cpu),
        7 => ctrl::sys_ctrl_pd(cpu),
        8 => ctrl::sys_ctrl_ec(cpu),
        9 => ctrl::sys_ctrl_sc(cpu),
        10 => ctrl::sys_ctrl_pt(cpu),
        11 => ctrl::sys_ctrl_sm(cpu),
        12 => ctrl::sys_ctrl_hw(cpu),
        13 => ctrl::sys_assign_int(cpu),
        14 => ctrl::sys_assign_dev(cpu),
        _ => finish(cpu, cur, Status::BadHyp, false),
    }
}

// ----------------------------------------------------------------------
// Kernel entry points
// ----------------------------------------------------------------------

/// Fast-syscall entry for the current EC on `cpu`.
pub fn syscall(cpu: CpuId) -> Exit {
    let step = dispatch(cpu);
    ec::run_from(cpu, step)
}

/// Architected timer interrupt.
pub fn timer_interrupt(cpu: CpuId) -> Exit {
    cpu::get(cpu).counters.timer.fetch_add(1, Ordering::Relaxed);
    sched::timeout::check(cpu);
    ec::run_from(cpu, Step::Run)
}

/// Remote-ready IPI: splice the release queue and redispatch.
pub fn remote_ready_ipi(cpu: CpuId) -> Exit {
    sched::requeue(cpu);
    ec::run_from(cpu, Step::Run)
}

/// Recall IPI: nothing to do beyond re-running the hazard check.
pub fn recall_ipi(cpu: CpuId) -> Exit {
    ec::run_from(cpu, Step::Run)
}

/// Synchronous exception taken by the current EC: deliver through its
/// event portal and resume through the exception return path.
pub fn exception(cpu: CpuId, event: u64, fault_addr: u64) -> Exit {
    let cur = cpu::get(cpu).current_ec().expect("no current EC");
    cur.with_regs(|r| {
        r.fault_info = event;
        r.fault_addr = fault_addr;
    });
    cur.set_cont(ec::Continuation::SendMsg(ec::RetPath::Exception));
    ec::run_from(cpu, Step::Run)
}

/// Hardware interrupt `id`: release the bound semaphore, then take the
/// usual return path.
pub fn interrupt(cpu: CpuId, id: u32) -> Exit {
    crate::irq::deliver(id);
    ec::run_from(cpu, Step::Run)
}

/// FPU-unavailable trap: mark the ownership flip and return; the hazard
/// handler saves the old owner and loads the new one.
pub fn fpu_fault(cpu: CpuId) -> Exit {
    cpu::get(cpu).hazard.set(crate::sync::HazardFlags::FPU);
    ec::run_from(cpu, Step::Run)
}

/// Park the CPU in its idle loop (bring-up and after Halt exits).
pub fn idle(cpu: CpuId) -> Exit {
    ec::run_from(cpu, Step::Run)
}

/// Look up `ec` as the current EC of a remote CPU (diagnostics).
pub fn remote_current(cpu: CpuId) -> Option<&'static Ec> {
    cpu::get(cpu).current_ec()
}

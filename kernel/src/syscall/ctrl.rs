//! Object-control and assignment system calls.

use spin::Mutex;

use crate::arch::IpiRequest;
use crate::cpu::{self, CpuId};
use crate::error::Status;
use crate::irq;
use crate::mm::page_table::{Cacheability, Memattr, Permissions, Shareability};
use crate::object::ec::{finish, Step};
use crate::object::{Ec, Pd, Pt, Sc, Sm};
use crate::sched;
use crate::space::pio::PortPerm;
use crate::space::SpaceKind;
use crate::sync::HazardFlags;

use super::abi;

/// SM capability bit allowing `up`.
pub const PERM_SM_UP: u8 = 0;
/// SM capability bit allowing `down`.
pub const PERM_SM_DOWN: u8 = 1;
/// Capability bit allowing assignment operations.
pub const PERM_ASSIGN: u8 = 4;

fn pio_msr_supported() -> bool {
    cfg!(any(target_arch = "x86_64", not(target_os = "none")))
}

/// `ctrl_pd`: delegate a range between two PDs' spaces.
pub fn sys_ctrl_pd(cpu: CpuId) -> Step {
    let cur = cpu::get(cpu).current_ec().expect("no current EC");
    let a = abi::decode(cur);
    let (dpd_sel, src, dst, p4) = cur.with_regs(|r| (r.p1(), r.p2(), r.p3(), r.p4()));

    let ord = (p4 & 0x3F) as usize;
    let pmm = ((p4 >> 8) & 0xFF) as u32;
    let ca = (p4 >> 16) & 0x3;
    let sh = (p4 >> 19) & 0x3;
    let kind = (a.flags & 0x7) as u64;

    log::trace!(
        "EC:{:p} ctrl_pd spd={:#x} dpd={:#x} st={} src={:#x} dst={:#x} ord={} pmm={:#x}",
        cur,
        a.sel,
        dpd_sel,
        kind,
        src,
        dst,
        ord,
        pmm
    );

    let spd = match cur.pd().obj().lookup(a.sel).validate::<Pd>(0) {
        Some(pd) => pd,
        None => return finish(cpu, cur, Status::BadCap, false),
    };
    let dpd = match cur.pd().obj().lookup(dpd_sel).validate::<Pd>(0) {
        Some(pd) => pd,
        None => return finish(cpu, cur, Status::BadCap, false),
    };

    // The kernel PD's spaces are never a delegation target.
    if dpd.is_kernel() {
        return finish(cpu, cur, Status::BadCap, false);
    }

    if (src | dst) & ((1 << ord) - 1) != 0 {
        return finish(cpu, cur, Status::BadPar, false);
    }

    let kind = match SpaceKind::from_raw(kind) {
        Some(k) => k,
        None => return finish(cpu, cur, Status::BadPar, false),
    };

    let pm = Permissions::from_bits_truncate(pmm)
        & (Permissions::R
            | Permissions::W
            | Permissions::XU
            | Permissions::XS
            | Permissions::U
            | Permissions::G);
    let ma = Memattr {
        ca: match ca {
            0 => Cacheability::MemWb,
            1 => Cacheability::MemWc,
            2 => Cacheability::MemUc,
            _ => Cacheability::Dev,
        },
        sh: match sh {
            2 => Shareability::Outer,
            3 => Shareability::Inner,
            _ => Shareability::None,
        },
    };

    let s = match kind {
        SpaceKind::Obj => dpd.obj().delegate(spd.obj(), src, dst, ord, pmm as u8),
        SpaceKind::Hst => dpd.hst().delegate(cpu, spd.hst(), src, dst, ord, pm, ma),
        SpaceKind::Gst => dpd.gst().delegate(cpu, spd.hst(), src, dst, ord, pm, ma),
        SpaceKind::Dma => dpd.dma().delegate(cpu, spd.hst(), src, dst, ord, pm, ma),
        SpaceKind::Pio => {
            if !pio_msr_supported() {
                return finish(cpu, cur, Status::BadFtr, false);
            }
            dpd.pio()
                .delegate(spd.pio(), src, ord, PortPerm::from_bits_truncate(pmm as u8))
        }
        SpaceKind::Msr => {
            if !pio_msr_supported() {
                return finish(cpu, cur, Status::BadFtr, false);
            }
            dpd.msr()
                .delegate(spd.msr(), src, ord, PortPerm::from_bits_truncate(pmm as u8))
        }
    };

    finish(cpu, cur, s, false)
}

/// `ctrl_ec`: recall a running EC.
pub fn sys_ctrl_ec(cpu: CpuId) -> Step {
    let cur = cpu::get(cpu).current_ec().expect("no current EC");
    let a = abi::decode(cur);
    let strong = a.flags & 1 != 0;

    log::trace!(
        "EC:{:p} ctrl_ec ec={:#x} ({})",
        cur,
        a.sel,
        if strong { "strong" } else { "weak" }
    );

    let ec = match cur.pd().obj().lookup(a.sel).validate::<Ec>(0) {
        Some(ec) => ec,
        None => return finish(cpu, cur, Status::BadCap, false),
    };

    if !ec.hazard.test_and_set(HazardFlags::RECALL) {
        let target = ec.cpu();
        let remote_running = target != cpu
            && cpu::get(target)
                .current_ec()
                .is_some_and(|c| core::ptr::eq(c, ec));

        if remote_running {
            if strong {
                // Wait until the target CPU has taken the recall IPI at
                // least once, so it observed the hazard.
                let before = cpu::request_count(target, IpiRequest::Recall);
                cpu::send_request(target, IpiRequest::Recall);
                while cpu::request_count(target, IpiRequest::Recall) == before {
                    crate::arch::pause();
                }
            } else {
                cpu::send_request(target, IpiRequest::Recall);
            }
        }
    }

    finish(cpu, cur, Status::Success, false)
}

/// `ctrl_sc`: report an SC's consumed execution time.
pub fn sys_ctrl_sc(cpu: CpuId) -> Step {
    let cur = cpu::get(cpu).current_ec().expect("no current EC");
    let a = abi::decode(cur);

    let sc = match cur.pd().obj().lookup(a.sel).validate::<Sc>(0) {
        Some(sc) => sc,
        None => return finish(cpu, cur, Status::BadCap, false),
    };

    cur.with_regs(|r| r.set_p1(sc.used()));
    finish(cpu, cur, Status::Success, false)
}

/// `ctrl_pt`: set a portal's badge and transfer mask.
pub fn sys_ctrl_pt(cpu: CpuId) -> Step {
    let cur = cpu::get(cpu).current_ec().expect("no current EC");
    let a = abi::decode(cur);
    let (id, mtd) = cur.with_regs(|r| (r.p1(), r.p2()));

    log::trace!("EC:{:p} ctrl_pt pt={:#x} id={:#x} mtd={:#x}", cur, a.sel, id, mtd);

    let pt = match cur.pd().obj().lookup(a.sel).validate::<Pt>(0) {
        Some(pt) => pt,
        None => return finish(cpu, cur, Status::BadCap, false),
    };

    pt.set_id(id);
    pt.set_mtd(mtd as u32);
    finish(cpu, cur, Status::Success, false)
}

/// `ctrl_sm`: semaphore up/down.
pub fn sys_ctrl_sm(cpu: CpuId) -> Step {
    let cur = cpu::get(cpu).current_ec().expect("no current EC");
    let a = abi::decode(cur);
    let down = a.flags & 1 != 0;
    let zero = a.flags & 2 != 0;
    let deadline = cur.with_regs(|r| r.p1());

    let perm = if down { PERM_SM_DOWN } else { PERM_SM_UP };
    let sm = match cur.pd().obj().lookup(a.sel).validate::<Sm>(perm) {
        Some(sm) => sm,
        None => return finish(cpu, cur, Status::BadCap, false),
    };

    if down {
        if let Some(id) = sm.id() {
            if irq::target_cpu(id) != cpu {
                return finish(cpu, cur, Status::BadCpu, false);
            }
            irq::deactivate(id);
        }

        match sm.dn(cur, cpu, zero, deadline) {
            crate::object::sm::DnResult::Taken => finish(cpu, cur, Status::Success, false),
            crate::object::sm::DnResult::Blocked => sched::schedule(cpu, true),
            // The wake-up continuation is already installed.
            crate::object::sm::DnResult::Raced => Step::Run,
        }
    } else if sm.up() {
        finish(cpu, cur, Status::Success, false)
    } else {
        finish(cpu, cur, Status::Ovrflow, false)
    }
}

/// `ctrl_hw`: platform operations; root only.
pub fn sys_ctrl_hw(cpu: CpuId) -> Step {
    let cur = cpu::get(cpu).current_ec().expect("no current EC");
    let a = abi::decode(cur);

    if !cur.pd().is_root() {
        return finish(cpu, cur, Status::BadHyp, false);
    }

    // No platform operation of the supported set is available here.
    log::trace!("EC:{:p} ctrl_hw op={:#x}: unsupported", cur, a.flags);
    finish(cpu, cur, Status::BadFtr, false)
}

/// `assign_int`: route an interrupt SM to a CPU.
pub fn sys_assign_int(cpu: CpuId) -> Step {
    let cur = cpu::get(cpu).current_ec().expect("no current EC");
    let a = abi::decode(cur);
    let target = cur.with_regs(|r| r.p1()) as CpuId;

    log::trace!(
        "EC:{:p} assign_int sm={:#x} cpu={} flags={:#x}",
        cur,
        a.sel,
        target,
        a.flags
    );

    if target >= cpu::online() {
        return finish(cpu, cur, Status::BadCpu, false);
    }

    let sm = match cur.pd().obj().lookup(a.sel).validate::<Sm>(PERM_ASSIGN) {
        Some(sm) => sm,
        None => return finish(cpu, cur, Status::BadCap, false),
    };

    let id = match sm.id() {
        Some(id) => id,
        None => return finish(cpu, cur, Status::BadCap, false),
    };

    match irq::configure(id, target, u32::from(a.flags)) {
        Ok((msi_addr, msi_data)) => {
            cur.with_regs(|r| {
                r.set_p1(u64::from(msi_addr));
                r.set_p2(u64::from(msi_data));
            });
            finish(cpu, cur, Status::Success, false)
        }
        Err(s) => finish(cpu, cur, s, false),
    }
}

/// Modelled IOMMU stream table: device id → DMA-space root.
static STREAMS: Mutex<alloc::vec::Vec<(u64, u64)>> = Mutex::new(alloc::vec::Vec::new());

/// `assign_dev`: attach a device stream to a PD's DMA space; root only.
pub fn sys_assign_dev(cpu: CpuId) -> Step {
    let cur = cpu::get(cpu).current_ec().expect("no current EC");
    let a = abi::decode(cur);
    let (smmu, dev) = cur.with_regs(|r| (r.p1(), r.p2()));

    log::trace!(
        "EC:{:p} assign_dev pd={:#x} smmu={:#x} dev={:#x}",
        cur,
        a.sel,
        smmu,
        dev
    );

    if !cur.pd().is_root() {
        return finish(cpu, cur, Status::BadHyp, false);
    }

    // One modelled IOMMU instance.
    if smmu != 0 {
        return finish(cpu, cur, Status::BadDev, false);
    }

    let pd = match cur.pd().obj().lookup(a.sel).validate::<Pd>(PERM_ASSIGN) {
        Some(pd) => pd,
        None => return finish(cpu, cur, Status::BadCap, false),
    };

    let root = pd.dma().root_phys();
    let mut streams = STREAMS.lock();
    match streams.iter_mut().find(|(d, _)| *d == dev) {
        Some(entry) => entry.1 = root,
        None => streams.push((dev, root)),
    }

    finish(cpu, cur, Status::Success, false)
}

/// DMA-space root a device stream is attached to (diagnostics, tests).
pub fn stream_root(dev: u64) -> Option<u64> {
    STREAMS
        .lock()
        .iter()
        .find(|(d, _)| *d == dev)
        .map(|(_, r)| *r)
}


//! Object-creation system calls.
//!
//! Every creator validates a PD capability carrying the matching create
//! permission, builds the object, and installs it at the caller-chosen
//! selector. A failed installation unwinds the freshly built object
//! before the status reaches user mode; no partial state survives.

use crate::cap::{Capability, PERM_ALL};
use crate::cpu::{self, CpuId};
use crate::error::Status;
use crate::object::ec::{finish, Step};
use crate::object::{self, Ec, KernelObject, Pd, Pt, Sc, Sm};
use crate::sched;

use super::abi;

/// PD capability bit allowing `create_pd`.
pub const PERM_PD_PD: u8 = 1;
/// PD capability bit allowing `create_ec` / `create_pt` / `create_sm`.
pub const PERM_PD_OBJ: u8 = 2;
/// PD capability bit allowing `create_sc`.
pub const PERM_PD_SC: u8 = 3;
/// EC capability bit allowing portal binding.
pub const PERM_EC_PT: u8 = 2;
/// EC capability bit allowing SC binding.
pub const PERM_EC_SC: u8 = 3;

/// Install a fresh object and unwind when the selector is taken.
fn install(cur: &'static Ec, sel: u64, obj: &'static object::Kobject, perms: u8) -> Status {
    let s = cur.pd().obj().insert(sel, Capability::new(obj, perms));
    match s {
        Status::Success => {
            // The creator's reference moves into the capability table.
            object::release(obj);
            Status::Success
        }
        s => {
            log::trace!("create: selector {:#x} rejected: {}", sel, s);
            object::discard(obj);
            s
        }
    }
}

pub fn sys_create_pd(cpu: CpuId) -> Step {
    let cur = cpu::get(cpu).current_ec().expect("no current EC");
    let a = abi::decode(cur);
    let own = cur.with_regs(|r| r.p1());

    log::trace!("EC:{:p} create_pd sel={:#x}", cur, a.sel);

    let parent = match cur.pd().obj().lookup(own).validate::<Pd>(PERM_PD_PD) {
        Some(pd) => pd,
        None => return finish(cpu, cur, Status::BadCap, false),
    };
    let inherited = cur.pd().obj().lookup(own).perms();
    let _ = parent;

    let pd = match Pd::create() {
        Ok(pd) => pd,
        Err(s) => return finish(cpu, cur, s, false),
    };

    let s = install(cur, a.sel, pd.header(), inherited);
    finish(cpu, cur, s, false)
}

pub fn sys_create_ec(cpu: CpuId) -> Step {
    let cur = cpu::get(cpu).current_ec().expect("no current EC");
    let a = abi::decode(cur);
    let (own, utcb, sp, ip, p5) =
        cur.with_regs(|r| (r.p1(), r.p2(), r.p3(), r.p4(), r.gpr[5]));

    let target_cpu = (p5 & 0xFFFF) as CpuId;
    let evt = p5 >> 16;
    let global = a.flags & 1 != 0;
    let fpu = a.flags & 2 != 0;
    let vcpu = a.flags & 4 != 0;

    log::trace!(
        "EC:{:p} create_ec sel={:#x} pd={:#x} cpu={} utcb={:#x} sp={:#x} ip={:#x}",
        cur,
        a.sel,
        own,
        target_cpu,
        utcb,
        sp,
        ip
    );

    if target_cpu >= cpu::online() {
        return finish(cpu, cur, Status::BadCpu, false);
    }

    if utcb == 0
        || utcb & (crate::mm::PAGE_SIZE as u64 - 1) != 0
        || utcb >= crate::space::SpaceHst::selectors() << crate::mm::PAGE_BITS
    {
        return finish(cpu, cur, Status::BadPar, false);
    }

    if vcpu && !super::vcpu_supported() {
        return finish(cpu, cur, Status::BadFtr, false);
    }

    let pd = match cur.pd().obj().lookup(own).validate::<Pd>(PERM_PD_OBJ) {
        Some(pd) => pd,
        None => return finish(cpu, cur, Status::BadCap, false),
    };

    let ec = match Ec::create(pd, global, fpu, target_cpu, evt, utcb, sp, ip) {
        Ok(ec) => ec,
        Err(s) => return finish(cpu, cur, s, false),
    };

    let s = install(cur, a.sel, ec.header(), PERM_ALL);
    finish(cpu, cur, s, false)
}

pub fn sys_create_sc(cpu: CpuId) -> Step {
    let cur = cpu::get(cpu).current_ec().expect("no current EC");
    let a = abi::decode(cur);
    let (own, ec_sel, p3) = cur.with_regs(|r| (r.p1(), r.p2(), r.p3()));

    let budget_ms = (p3 & 0xFFFF_FFFF) as u32;
    let prio = ((p3 >> 32) & 0xFF) as u8;
    let cos = ((p3 >> 40) & 0xFFFF) as u16;

    log::trace!(
        "EC:{:p} create_sc sel={:#x} ec={:#x} prio={} budget={}ms",
        cur,
        a.sel,
        ec_sel,
        prio,
        budget_ms
    );

    if cur
        .pd()
        .obj()
        .lookup(own)
        .validate::<Pd>(PERM_PD_SC)
        .is_none()
    {
        return finish(cpu, cur, Status::BadCap, false);
    }

    let ec = match cur.pd().obj().lookup(ec_sel).validate::<Ec>(PERM_EC_SC) {
        Some(ec) => ec,
        None => return finish(cpu, cur, Status::BadCap, false),
    };

    // Local ECs run on donated time only.
    if ec.is_local() {
        return finish(cpu, cur, Status::BadCap, false);
    }

    if prio == 0 || prio as usize >= sched::PRIORITIES || budget_ms == 0 {
        return finish(cpu, cur, Status::BadPar, false);
    }

    let sc = match Sc::create(ec, ec.cpu(), budget_ms, prio, cos) {
        Ok(sc) => sc,
        Err(s) => return finish(cpu, cur, s, false),
    };

    let s = install(cur, a.sel, sc.header(), PERM_ALL);
    if s == Status::Success {
        sched::unblock(sc);
    }
    finish(cpu, cur, s, false)
}

pub fn sys_create_pt(cpu: CpuId) -> Step {
    let cur = cpu::get(cpu).current_ec().expect("no current EC");
    let a = abi::decode(cur);
    let (own, ec_sel, ip) = cur.with_regs(|r| (r.p1(), r.p2(), r.p3()));

    log::trace!(
        "EC:{:p} create_pt sel={:#x} ec={:#x} ip={:#x}",
        cur,
        a.sel,
        ec_sel,
        ip
    );

    if cur
        .pd()
        .obj()
        .lookup(own)
        .validate::<Pd>(PERM_PD_OBJ)
        .is_none()
    {
        return finish(cpu, cur, Status::BadCap, false);
    }

    let ec = match cur.pd().obj().lookup(ec_sel).validate::<Ec>(PERM_EC_PT) {
        Some(ec) => ec,
        None => return finish(cpu, cur, Status::BadCap, false),
    };

    // Portals bind to local (portal-handler) ECs only.
    if !ec.is_local() {
        return finish(cpu, cur, Status::BadCap, false);
    }

    let pt = match Pt::create(ec, ip) {
        Ok(pt) => pt,
        Err(s) => return finish(cpu, cur, s, false),
    };

    let s = install(cur, a.sel, pt.header(), PERM_ALL);
    finish(cpu, cur, s, false)
}

pub fn sys_create_sm(cpu: CpuId) -> Step {
    let cur = cpu::get(cpu).current_ec().expect("no current EC");
    let a = abi::decode(cur);
    let (own, count) = cur.with_regs(|r| (r.p1(), r.p2()));

    log::trace!("EC:{:p} create_sm sel={:#x} cnt={}", cur, a.sel, count);

    if cur
        .pd()
        .obj()
        .lookup(own)
        .validate::<Pd>(PERM_PD_OBJ)
        .is_none()
    {
        return finish(cpu, cur, Status::BadCap, false);
    }

    let sm = match Sm::create(count, None) {
        Ok(sm) => sm,
        Err(s) => return finish(cpu, cur, s, false),
    };

    let s = install(cur, a.sel, sm.header(), PERM_ALL);
    finish(cpu, cur, s, false)
}

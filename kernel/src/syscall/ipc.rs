//! Portal IPC: user call/reply and kernel-generated event delivery.
//!
//! A call rendezvous hands the caller's CPU to the callee: the caller
//! links itself to the callee, loads the portal's entry IP and badge,
//! and makes the callee current while the caller's SC keeps running the
//! chain (time donation). A busy callee is helped: the caller activates
//! the callee's chain tail on this CPU and retries once the chain
//! unwinds. Exceptions, VM exits and recalls are delivered as synthetic
//! calls through the EC's event portals, with the architectural state
//! flowing through the callee's UTCB.

use crate::cpu::{self, CpuId};
use crate::error::Status;
use crate::ipc::mtd::MtdUser;
use crate::object::ec::{finish, Continuation, RetPath, Step};
use crate::object::{Ec, Pt};

/// Event-portal indices relative to an EC's event base.
pub const EVT_RECALL: u64 = 0;
pub const EVT_STARTUP: u64 = 1;
pub const EVT_PAGE_FAULT: u64 = 2;

/// Permission bit a portal capability needs for a user call.
pub const PERM_PT_CALL: u8 = 1;
/// Permission bit a portal capability needs for event delivery.
pub const PERM_PT_EVENT: u8 = 2;

/// `ipc_call`: synchronous portal call.
pub fn sys_ipc_call(cpu: CpuId) -> Step {
    let cur = cpu::get(cpu).current_ec().expect("no current EC");
    let (p0, mtd) = cur.with_regs(|r| (r.p0(), r.p1()));
    let sel = p0 >> 12;
    let has_timeout = p0 & (1 << 4) != 0;

    let pt = match cur.pd().obj().lookup(sel).validate::<Pt>(PERM_PT_CALL) {
        Some(pt) => pt,
        None => {
            log::trace!("ipc_call: bad PT cap {:#x}", sel);
            return finish(cpu, cur, Status::BadCap, false);
        }
    };

    let callee = pt.ec();
    if callee.cpu() != cur.cpu() {
        return finish(cpu, cur, Status::BadCpu, false);
    }
    debug_assert!(callee.is_local());

    if callee.cont() == Continuation::None {
        cur.set_cont(Continuation::RetUser(RetPath::Hypercall));
        cur.set_partner(callee);
        callee.set_cont(Continuation::RecvUser);
        callee.with_regs(|r| {
            r.ip = pt.ip();
            r.set_p0(pt.id());
            r.set_p1(mtd);
        });
        callee.make_current(cpu);
        return Step::Run;
    }

    if has_timeout {
        return finish(cpu, cur, Status::Timeout, false);
    }

    match cur.help(cpu, callee, Continuation::SysIpcCall) {
        Some(step) => step,
        None => finish(cpu, cur, Status::Aborted, false),
    }
}

/// `ipc_reply`: finish the callee side of a call.
pub fn sys_ipc_reply(cpu: CpuId) -> Step {
    let cur = cpu::get(cpu).current_ec().expect("no current EC");
    let mtd = cur.with_regs(|r| r.p1());

    if let Some(caller) = cur.caller() {
        if caller.cont() == Continuation::RetUser(RetPath::Hypercall) {
            // Hypercall path: message registers flow back.
            caller.with_regs(|r| r.set_p1(mtd));
            if let (Some(src), Some(dst)) = (cur.utcb(), caller.utcb()) {
                src.copy_user(MtdUser::new(mtd as u32), dst);
            }
        } else {
            // Exception/VM-exit path: architectural state is restored.
            let legal = match cur.utcb() {
                Some(utcb) => caller.with_regs(|r| {
                    utcb.save_arch(r, crate::ipc::mtd::MtdArch::from_bits_truncate(mtd as u32))
                }),
                None => false,
            };
            if !legal {
                caller.hazard.set(crate::sync::HazardFlags::ILLEGAL);
            }
        }
    }

    cur.reply(cpu, Continuation::None)
}

/// Callee entry for a user call: copy the caller's message registers.
pub fn recv_user(cpu: CpuId, ec: &'static Ec) -> Step {
    let caller = match ec.caller() {
        Some(c) => c,
        None => return ec.kill(cpu, "receive without caller"),
    };

    let mtd = ec.with_regs(|r| r.p1());
    if let (Some(src), Some(dst)) = (caller.utcb(), ec.utcb()) {
        src.copy_user(MtdUser::new(mtd as u32), dst);
    }

    ec.set_cont(Continuation::RetUser(RetPath::Hypercall));
    Step::Run
}

/// Callee entry for a kernel-generated call: snapshot the caller's
/// architectural state into the callee's UTCB.
pub fn recv_kern(cpu: CpuId, ec: &'static Ec) -> Step {
    let caller = match ec.caller() {
        Some(c) => c,
        None => return ec.kill(cpu, "receive without caller"),
    };

    let mtd = crate::ipc::mtd::MtdArch::from_bits_truncate(ec.with_regs(|r| r.p1()) as u32);
    if let Some(utcb) = ec.utcb() {
        caller.with_regs(|r| utcb.load_arch(r, mtd));
    }

    ec.set_cont(Continuation::RetUser(RetPath::Hypercall));
    Step::Run
}

fn send_event(cpu: CpuId, ec: &'static Ec, path: RetPath, lethal: bool) -> Step {
    let event = ec.with_regs(|r| r.fault_info);
    let sel = ec.evt() + event;

    let pt = match ec.pd().obj().lookup(sel).validate::<Pt>(PERM_PT_EVENT) {
        Some(pt) => pt,
        None if lethal => return ec.kill(cpu, "no event portal"),
        None => {
            ec.set_cont(Continuation::RetUser(path));
            return Step::Run;
        }
    };

    let callee = pt.ec();
    if callee.cpu() != ec.cpu() {
        return ec.kill(cpu, "event portal on wrong CPU");
    }

    if callee.cont() == Continuation::None {
        ec.set_cont(Continuation::RetUser(path));
        ec.set_partner(callee);
        callee.set_cont(Continuation::RecvKern);
        callee.with_regs(|r| {
            r.ip = pt.ip();
            r.set_p0(pt.id());
            r.set_p1(u64::from(pt.mtd_raw()));
        });
        callee.make_current(cpu);
        return Step::Run;
    }

    match ec.help(cpu, callee, Continuation::SendMsg(path)) {
        Some(step) => step,
        None => ec.kill(cpu, "event delivery aborted"),
    }
}

/// Kernel-generated portal call for the pending event in the EC's frame.
pub fn send_msg(cpu: CpuId, ec: &'static Ec, path: RetPath) -> Step {
    send_event(cpu, ec, path, true)
}

/// Deliver a recall through the event portal; absent portals are not
/// fatal, the recall is simply consumed.
pub fn send_recall(cpu: CpuId, ec: &'static Ec, path: RetPath) -> Step {
    ec.with_regs(|r| r.fault_info = EVT_RECALL);
    send_event(cpu, ec, path, false)
}

//! Cross-module scenarios driven through the system-call interface.
//!
//! Each test boots the kernel on a fresh pool, lets the root EC run,
//! and issues system calls exactly the way user mode would: arguments
//! in the saved register frame, kernel entry through `syscall`, results
//! observed in the frame and in object state. Time advances only when
//! the test says so, which makes budget accounting exact.

use crate::arch::{IpiRequest, Timer};
use crate::boot::sel;
use crate::cpu::{self, CpuId};
use crate::error::Status;
use crate::mm::PAGE_BITS;
use crate::object::ec::Exit;
use crate::object::{Ec, Pd, Sc, Sm};
use crate::syscall;
use crate::test_support;

const OP_IPC_CALL: u64 = 0;
const OP_IPC_REPLY: u64 = 1;
const OP_CREATE_PD: u64 = 2;
const OP_CREATE_EC: u64 = 3;
const OP_CREATE_SC: u64 = 4;
const OP_CREATE_PT: u64 = 5;
const OP_CREATE_SM: u64 = 6;
const OP_CTRL_PD: u64 = 7;
const OP_CTRL_SC: u64 = 9;
const OP_CTRL_PT: u64 = 10;
const OP_CTRL_SM: u64 = 11;

const SEL_P1: u64 = 100;
const SEL_E1: u64 = 101;
const SEL_S1: u64 = 102;
const SEL_H1: u64 = 103;
const SEL_PT1: u64 = 104;
const SEL_SM1: u64 = 110;

fn p0(sel: u64, flags: u64, op: u64) -> u64 {
    (sel << 12) | (flags << 4) | op
}

/// Let the CPU take a timer tick and run whatever is due.
fn tick(cpu: CpuId) -> Exit {
    syscall::timer_interrupt(cpu)
}

/// Issue a syscall from the EC that is current on `cpu`.
fn sys(cpu: CpuId, setup: impl FnOnce(&mut crate::arch::Regs)) -> Exit {
    let cur = cpu::get(cpu).current_ec().unwrap();
    cur.with_regs(setup);
    syscall::syscall(cpu)
}

fn status_of(ec: &Ec) -> Status {
    match ec.with_regs(|r| r.p0()) {
        0 => Status::Success,
        1 => Status::Timeout,
        2 => Status::Aborted,
        8 => Status::BadCap,
        9 => Status::Ovrflow,
        v => panic!("unexpected status {}", v),
    }
}

/// Boot and run until the root EC is in user mode.
fn boot_to_root(cpus: u16) -> (test_support::Env, &'static Ec) {
    let env = test_support::booted(4096, cpus);
    let root = match tick(0) {
        Exit::User(ec) => ec,
        Exit::Halt => panic!("root task did not run"),
    };
    assert!(core::ptr::eq(root.pd(), Pd::root().unwrap()));
    (env, root)
}

/// Create P1, a global EC at `ip`, and its SC (priority 100, 10 ms).
fn setup_worker(root: &'static Ec, ip: u64) {
    let e = sys(0, |r| {
        r.set_p0(p0(SEL_P1, 0, OP_CREATE_PD));
        r.set_p1(sel::ROOT_PD);
    });
    assert!(matches!(e, Exit::User(ec) if core::ptr::eq(ec, root)));
    assert_eq!(status_of(root), Status::Success);

    let e = sys(0, |r| {
        r.set_p0(p0(SEL_E1, 0b11, OP_CREATE_EC));
        r.set_p1(SEL_P1);
        r.set_p2(0x2000);
        r.gpr[3] = 0x9000;
        r.gpr[4] = ip;
        r.gpr[5] = 0;
    });
    assert!(matches!(e, Exit::User(ec) if core::ptr::eq(ec, root)));
    assert_eq!(status_of(root), Status::Success);

    let e = sys(0, |r| {
        r.set_p0(p0(SEL_S1, 0, OP_CREATE_SC));
        r.set_p1(sel::ROOT_PD);
        r.set_p2(SEL_E1);
        r.set_p3(10 | (100u64 << 32));
    });
    assert!(matches!(e, Exit::User(ec) if core::ptr::eq(ec, root)));
    assert_eq!(status_of(root), Status::Success);
}

fn root_sm(root: &'static Ec, sel_sm: u64, count: u64) -> &'static Sm {
    let e = sys(0, |r| {
        r.set_p0(p0(sel_sm, 0, OP_CREATE_SM));
        r.set_p1(sel::ROOT_PD);
        r.set_p2(count);
    });
    assert!(matches!(e, Exit::User(ec) if core::ptr::eq(ec, root)));
    assert_eq!(status_of(root), Status::Success);
    root.pd().obj().lookup(sel_sm).validate::<Sm>(0).unwrap()
}

/// Block the root EC on `sel_sm` with an optional deadline.
fn root_down(sel_sm: u64, deadline: u64) -> Exit {
    sys(0, |r| {
        r.set_p0(p0(sel_sm, 0b01, OP_CTRL_SM));
        r.set_p1(deadline);
    })
}

#[test]
fn s1_sc_accounts_exact_execution_time() {
    let (_env, root) = boot_to_root(2);
    setup_worker(root, 0x1000);

    // Fresh SC reports zero consumed time.
    let e = sys(0, |r| r.set_p0(p0(SEL_S1, 0, OP_CTRL_SC)));
    assert!(matches!(e, Exit::User(ec) if core::ptr::eq(ec, root)));
    assert_eq!(status_of(root), Status::Success);
    assert_eq!(root.with_regs(|r| r.p1()), 0);

    // Root blocks; the worker runs for exactly 5 ms of modelled time.
    let sm = root_sm(root, SEL_SM1, 0);
    let e = root_down(SEL_SM1, 0);
    let worker = root.pd().obj().lookup(SEL_E1).validate::<Ec>(0).unwrap();
    assert!(matches!(e, Exit::User(ec) if core::ptr::eq(ec, worker)));

    Timer::advance(Timer::ms_to_ticks(5));

    // A wake-up from the other core preempts the worker.
    cpu::set_current_id(1);
    assert!(sm.up());
    let e = syscall::remote_ready_ipi(0);
    assert!(matches!(e, Exit::User(ec) if core::ptr::eq(ec, root)));
    assert_eq!(status_of(root), Status::Success);

    let e = sys(0, |r| r.set_p0(p0(SEL_S1, 0, OP_CTRL_SC)));
    assert!(matches!(e, Exit::User(ec) if core::ptr::eq(ec, root)));
    let used = root.with_regs(|r| r.p1());
    assert_eq!(used, Timer::ms_to_ticks(5));
}

#[test]
fn s2_portal_call_delivers_badge_and_payload() {
    let (_env, root) = boot_to_root(1);

    // A local handler EC in the root PD, and a portal into it.
    let e = sys(0, |r| {
        r.set_p0(p0(SEL_H1, 0, OP_CREATE_EC));
        r.set_p1(sel::ROOT_PD);
        r.set_p2(0x5000);
        r.gpr[3] = 0xA000;
        r.gpr[4] = 0;
        r.gpr[5] = 0;
    });
    assert!(matches!(e, Exit::User(ec) if core::ptr::eq(ec, root)));
    assert_eq!(status_of(root), Status::Success);

    let e = sys(0, |r| {
        r.set_p0(p0(SEL_PT1, 0, OP_CREATE_PT));
        r.set_p1(sel::ROOT_PD);
        r.set_p2(SEL_H1);
        r.set_p3(0x3000);
    });
    assert!(matches!(e, Exit::User(ec) if core::ptr::eq(ec, root)));
    assert_eq!(status_of(root), Status::Success);

    let e = sys(0, |r| {
        r.set_p0(p0(SEL_PT1, 0, OP_CTRL_PT));
        r.set_p1(0xCAFE);
        r.set_p2(0);
    });
    assert!(matches!(e, Exit::User(ec) if core::ptr::eq(ec, root)));

    // Caller payload: three message registers.
    root.utcb().unwrap().with(|d| {
        d.mr[0] = 0x1111;
        d.mr[1] = 0x2222;
        d.mr[2] = 0x3333;
    });

    let handler = root.pd().obj().lookup(SEL_H1).validate::<Ec>(0).unwrap();
    let e = sys(0, |r| {
        r.set_p0(p0(SEL_PT1, 0, OP_IPC_CALL));
        r.set_p1(2); // three registers
    });
    assert!(matches!(e, Exit::User(ec) if core::ptr::eq(ec, handler)));

    // The handler woke at the portal IP with the badge and payload.
    assert_eq!(handler.with_regs(|r| r.ip), 0x3000);
    assert_eq!(handler.with_regs(|r| r.p0()), 0xCAFE);
    handler.utcb().unwrap().with(|d| {
        assert_eq!(d.mr[0], 0x1111);
        assert_eq!(d.mr[1], 0x2222);
        assert_eq!(d.mr[2], 0x3333);
    });

    // Reply flows a result register back to the caller.
    handler.utcb().unwrap().with(|d| d.mr[0] = 0xBEEF);
    let e = sys(0, |r| {
        r.set_p0(p0(0, 0, OP_IPC_REPLY));
        r.set_p1(0); // one register
    });
    assert!(matches!(e, Exit::User(ec) if core::ptr::eq(ec, root)));
    root.utcb().unwrap().with(|d| assert_eq!(d.mr[0], 0xBEEF));

    // The handler is receptive again.
    assert!(handler.blocked());
}

#[test]
fn s3_semaphore_wakeup_beats_the_timeout() {
    let (_env, root) = boot_to_root(2);
    let sm = root_sm(root, SEL_SM1, 0);

    let deadline = Timer::time() + Timer::ms_to_ticks(100);
    let e = root_down(SEL_SM1, deadline);
    assert!(matches!(e, Exit::Halt));

    // +50 ms: another CPU posts the semaphore.
    Timer::advance(Timer::ms_to_ticks(50));
    cpu::set_current_id(1);
    assert!(sm.up());

    let e = syscall::remote_ready_ipi(0);
    assert!(matches!(e, Exit::User(ec) if core::ptr::eq(ec, root)));
    assert_eq!(status_of(root), Status::Success);
    assert_eq!(sm.counter(), 0);

    // The stale timeout fires into nothing.
    Timer::advance(Timer::ms_to_ticks(60));
    assert!(matches!(tick(0), Exit::User(ec) if core::ptr::eq(ec, root)));
    assert_eq!(sm.counter(), 0);
}

#[test]
fn s4_semaphore_timeout_returns_timeout() {
    let (_env, root) = boot_to_root(1);
    let sm = root_sm(root, SEL_SM1, 0);

    let deadline = Timer::time() + Timer::ms_to_ticks(100);
    let e = root_down(SEL_SM1, deadline);
    assert!(matches!(e, Exit::Halt));

    Timer::advance(Timer::ms_to_ticks(100));
    let e = tick(0);
    assert!(matches!(e, Exit::User(ec) if core::ptr::eq(ec, root)));
    assert_eq!(status_of(root), Status::Timeout);
    assert_eq!(sm.counter(), 0);
}

#[test]
fn s5_higher_priority_wakeup_preempts_promptly() {
    let (_env, root) = boot_to_root(2);
    setup_worker(root, 0x1000);

    // Root (priority top) blocks; the low-priority worker runs.
    let sm = root_sm(root, SEL_SM1, 0);
    let e = root_down(SEL_SM1, 0);
    let worker = root.pd().obj().lookup(SEL_E1).validate::<Ec>(0).unwrap();
    assert!(matches!(e, Exit::User(ec) if core::ptr::eq(ec, worker)));

    Timer::advance(Timer::ms_to_ticks(3));

    // Wake the high-priority root; the next kernel entry reschedules.
    cpu::set_current_id(1);
    assert!(sm.up());
    let e = syscall::remote_ready_ipi(0);
    assert!(matches!(e, Exit::User(ec) if core::ptr::eq(ec, root)));

    // The worker was charged only for the time it actually ran.
    let sc = root.pd().obj().lookup(SEL_S1).validate::<Sc>(0).unwrap();
    assert_eq!(sc.used(), Timer::ms_to_ticks(3));
}

#[test]
fn s6_host_delegation_and_revoke_with_shootdown() {
    let (_env, root) = boot_to_root(2);

    // A fresh PD to receive the window.
    let e = sys(0, |r| {
        r.set_p0(p0(SEL_P1, 0, OP_CREATE_PD));
        r.set_p1(sel::ROOT_PD);
    });
    assert!(matches!(e, Exit::User(ec) if core::ptr::eq(ec, root)));
    assert_eq!(status_of(root), Status::Success);
    let p1 = root.pd().obj().lookup(SEL_P1).validate::<Pd>(0).unwrap();

    // 2 MiB, 2 MiB-aligned, inside the pool and past the kernel image.
    let src_phys = test_support::POOL_PHYS + 0x20_0000;
    let src_frame = src_phys >> PAGE_BITS;
    let dst_frame = 0x4000_0000u64 >> PAGE_BITS;

    let e = sys(0, |r| {
        r.set_p0(p0(crate::boot::sel::KERNEL_PD, 1, OP_CTRL_PD));
        r.set_p1(SEL_P1);
        r.set_p2(src_frame);
        r.set_p3(dst_frame);
        r.set_p4(9 | (0b11 << 8));
    });
    assert!(matches!(e, Exit::User(ec) if core::ptr::eq(ec, root)));
    assert_eq!(status_of(root), Status::Success);

    let m = p1.hst().lookup(0x4000_0000).unwrap();
    assert_eq!(m.phys, src_phys);
    assert_eq!(m.order + PAGE_BITS, 21);
    use crate::mm::page_table::Permissions;
    assert!(m.pm.contains(Permissions::R | Permissions::W));
    assert!(!m.pm.intersects(Permissions::XU | Permissions::XS | Permissions::K));

    // Revoke with an empty mask; the other CPU gets shot down.
    let before = cpu::request_count(1, IpiRequest::Shootdown);
    let e = sys(0, |r| {
        r.set_p0(p0(crate::boot::sel::KERNEL_PD, 1, OP_CTRL_PD));
        r.set_p1(SEL_P1);
        r.set_p2(src_frame);
        r.set_p3(dst_frame);
        r.set_p4(9);
    });
    assert!(matches!(e, Exit::User(ec) if core::ptr::eq(ec, root)));
    assert_eq!(status_of(root), Status::Success);
    assert!(p1.hst().lookup(0x4000_0000).is_none());
    assert!(cpu::request_count(1, IpiRequest::Shootdown) > before);
}

#[test]
fn busy_portal_with_timeout_flag_returns_timeout() {
    let (_env, root) = boot_to_root(1);

    // Handler and portal.
    let e = sys(0, |r| {
        r.set_p0(p0(SEL_H1, 0, OP_CREATE_EC));
        r.set_p1(sel::ROOT_PD);
        r.set_p2(0x5000);
        r.gpr[5] = 0;
    });
    assert!(matches!(e, Exit::User(ec) if core::ptr::eq(ec, root)));
    let e = sys(0, |r| {
        r.set_p0(p0(SEL_PT1, 0, OP_CREATE_PT));
        r.set_p1(sel::ROOT_PD);
        r.set_p2(SEL_H1);
        r.set_p3(0x3000);
    });
    assert!(matches!(e, Exit::User(ec) if core::ptr::eq(ec, root)));

    // First call occupies the handler.
    let handler = root.pd().obj().lookup(SEL_H1).validate::<Ec>(0).unwrap();
    let e = sys(0, |r| {
        r.set_p0(p0(SEL_PT1, 0, OP_IPC_CALL));
        r.set_p1(0);
    });
    assert!(matches!(e, Exit::User(ec) if core::ptr::eq(ec, handler)));

    // The handler itself calls the portal: the callee is busy, and the
    // timeout flag converts the would-be help into TIMEOUT.
    let e = sys(0, |r| {
        r.set_p0(p0(SEL_PT1, 1, OP_IPC_CALL));
        r.set_p1(0);
    });
    assert!(matches!(e, Exit::User(ec) if core::ptr::eq(ec, handler)));
    assert_eq!(status_of(handler), Status::Timeout);
}

#[test]
fn exception_is_delivered_through_the_event_portal() {
    let (_env, root) = boot_to_root(1);

    // Handler EC and a portal installed at the page-fault event
    // selector of the root EC (event base 0).
    let e = sys(0, |r| {
        r.set_p0(p0(SEL_H1, 0, OP_CREATE_EC));
        r.set_p1(sel::ROOT_PD);
        r.set_p2(0x5000);
        r.gpr[5] = 0;
    });
    assert!(matches!(e, Exit::User(ec) if core::ptr::eq(ec, root)));

    let evt_sel = crate::syscall::ipc::EVT_PAGE_FAULT;
    let e = sys(0, |r| {
        r.set_p0(p0(evt_sel, 0, OP_CREATE_PT));
        r.set_p1(sel::ROOT_PD);
        r.set_p2(SEL_H1);
        r.set_p3(0x6000);
    });
    assert!(matches!(e, Exit::User(ec) if core::ptr::eq(ec, root)));

    let mtd = crate::ipc::mtd::MtdArch::GPR | crate::ipc::mtd::MtdArch::IP
        | crate::ipc::mtd::MtdArch::FAULT;
    let e = sys(0, |r| {
        r.set_p0(p0(evt_sel, 0, OP_CTRL_PT));
        r.set_p1(0xF00D);
        r.set_p2(u64::from(mtd.bits()));
    });
    assert!(matches!(e, Exit::User(ec) if core::ptr::eq(ec, root)));

    // The root EC faults; the handler observes the faulting state.
    root.with_regs(|r| {
        r.ip = 0x4444;
        r.gpr[7] = 0x77;
    });
    let handler = root.pd().obj().lookup(SEL_H1).validate::<Ec>(0).unwrap();
    let e = syscall::exception(0, evt_sel, 0xDEAD_B000);
    assert!(matches!(e, Exit::User(ec) if core::ptr::eq(ec, handler)));

    assert_eq!(handler.with_regs(|r| r.ip), 0x6000);
    assert_eq!(handler.with_regs(|r| r.p0()), 0xF00D);
    handler.utcb().unwrap().with(|d| {
        assert_eq!(d.arch.ip, 0x4444);
        assert_eq!(d.arch.gpr[7], 0x77);
        assert_eq!(d.arch.fault_addr, 0xDEAD_B000);
    });

    // The reply restores state and resumes the faulting EC.
    handler.utcb().unwrap().with(|d| d.arch.ip = 0x4448);
    let e = sys(0, |r| {
        r.set_p0(p0(0, 0, OP_IPC_REPLY));
        r.set_p1(u64::from(crate::ipc::mtd::MtdArch::IP.bits()));
    });
    assert!(matches!(e, Exit::User(ec) if core::ptr::eq(ec, root)));
    assert_eq!(root.with_regs(|r| r.ip), 0x4448);
}

#[test]
fn helping_donates_the_callers_time_to_the_busy_callee() {
    let (_env, root) = boot_to_root(1);

    // Handler, portal, and a second global EC with its own SC.
    let e = sys(0, |r| {
        r.set_p0(p0(SEL_H1, 0, OP_CREATE_EC));
        r.set_p1(sel::ROOT_PD);
        r.set_p2(0x5000);
        r.gpr[5] = 0;
    });
    assert!(matches!(e, Exit::User(ec) if core::ptr::eq(ec, root)));
    let e = sys(0, |r| {
        r.set_p0(p0(SEL_PT1, 0, OP_CREATE_PT));
        r.set_p1(sel::ROOT_PD);
        r.set_p2(SEL_H1);
        r.set_p3(0x3000);
    });
    assert!(matches!(e, Exit::User(ec) if core::ptr::eq(ec, root)));
    let e = sys(0, |r| {
        r.set_p0(p0(SEL_E1, 0b01, OP_CREATE_EC));
        r.set_p1(sel::ROOT_PD);
        r.set_p2(0x7000);
        r.gpr[4] = 0x1000;
        r.gpr[5] = 0;
    });
    assert!(matches!(e, Exit::User(ec) if core::ptr::eq(ec, root)));
    let e = sys(0, |r| {
        r.set_p0(p0(SEL_S1, 0, OP_CREATE_SC));
        r.set_p1(sel::ROOT_PD);
        r.set_p2(SEL_E1);
        r.set_p3(10 | (120u64 << 32));
    });
    assert!(matches!(e, Exit::User(ec) if core::ptr::eq(ec, root)));

    // Root's call occupies the handler.
    let handler = root.pd().obj().lookup(SEL_H1).validate::<Ec>(0).unwrap();
    let e = sys(0, |r| {
        r.set_p0(p0(SEL_PT1, 0, OP_IPC_CALL));
        r.set_p1(0);
    });
    assert!(matches!(e, Exit::User(ec) if core::ptr::eq(ec, handler)));

    // The second EC calls the busy portal: its time is donated to the
    // handler instead of failing.
    let caller = root.pd().obj().lookup(SEL_E1).validate::<Ec>(0).unwrap();
    let caller_sc = root.pd().obj().lookup(SEL_S1).validate::<Sc>(0).unwrap();
    caller.make_current(0);
    cpu::get(0).set_current_sc(caller_sc);

    let helping = cpu::get(0).counters.helping.load(core::sync::atomic::Ordering::Relaxed);
    let e = sys(0, |r| {
        r.set_p0(p0(SEL_PT1, 0, OP_IPC_CALL));
        r.set_p1(0);
    });
    assert!(matches!(e, Exit::User(ec) if core::ptr::eq(ec, handler)));
    assert_eq!(
        cpu::get(0).counters.helping.load(core::sync::atomic::Ordering::Relaxed),
        helping + 1
    );
    // The caller retries the call once it is scheduled again.
    assert_eq!(
        caller.cont(),
        crate::object::ec::Continuation::SysIpcCall
    );
}

#[test]
fn recall_hazard_is_consumed_on_next_user_return() {
    let (_env, root) = boot_to_root(1);

    root.hazard.set(crate::sync::HazardFlags::RECALL);
    let e = tick(0);
    assert!(matches!(e, Exit::User(ec) if core::ptr::eq(ec, root)));
    assert!(!root
        .hazard
        .intersects(crate::sync::HazardFlags::RECALL));
}

#[test]
fn bad_capability_yields_bad_cap() {
    let (_env, root) = boot_to_root(1);
    let e = sys(0, |r| {
        r.set_p0(p0(9999, 0, OP_IPC_CALL));
        r.set_p1(0);
    });
    assert!(matches!(e, Exit::User(ec) if core::ptr::eq(ec, root)));
    assert_eq!(status_of(root), Status::BadCap);
}

#[test]
fn semaphore_overflow_reports_ovrflow() {
    let (_env, root) = boot_to_root(1);
    let sm = root_sm(root, SEL_SM1, u64::MAX);
    assert_eq!(sm.counter(), u64::MAX);

    let e = sys(0, |r| {
        r.set_p0(p0(SEL_SM1, 0, OP_CTRL_SM));
        r.set_p1(0);
    });
    assert!(matches!(e, Exit::User(ec) if core::ptr::eq(ec, root)));
    assert_eq!(status_of(root), Status::Ovrflow);
}

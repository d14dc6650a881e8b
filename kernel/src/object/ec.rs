//! Execution contexts.
//!
//! An EC is a kernel-schedulable thread or virtual CPU: register frame,
//! UTCB, optional FPU state, and the continuation that says where the EC
//! re-enters the kernel. There is no kernel stack state across a system
//! call; every operation ends by storing a continuation and letting the
//! per-CPU run loop dispatch it.
//!
//! Blocking is encoded in the continuation cell itself: `None` (a local
//! EC waiting for a portal call) and the `Blocking` sentinel both mean
//! blocked. Readers of blockedness load acquire, remote unblockers store
//! release, so a successful remote unblock orders before the dispatcher's
//! next sampling on the blocking CPU.

use alloc::collections::VecDeque;

use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering};

use spin::Mutex;

use crate::arch::Regs;
use crate::cpu::{self, CpuId, DONATION_LIMIT};
use crate::error::Status;
use crate::ipc::Utcb;
use crate::mm::page_table::Permissions;
use crate::mm::slab::SlabCache;
use crate::sched;
use crate::sync::HazardFlags;
use crate::sync::Hazard;

use super::{construct, demolish, KernelObject, Kobject, ObjType, Pd, Sc, Subtype, KOBJECT_ALIGN};

/// Which architected return path a continuation resumes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RetPath {
    Hypercall = 0,
    Exception = 1,
    VmExit = 2,
}

/// Tagged kernel re-entry point of an EC, encoded in one atomic word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuation {
    /// No continuation: a local EC, receptive to portal calls. Blocked.
    None,
    /// Blocked by choice (semaphore wait). Sentinel; blocked.
    Blocking,
    /// The EC died mid-IPC; any activation kills it again.
    Dead,
    /// Per-CPU idle loop.
    Idle,
    /// Leave the kernel through the given return path.
    RetUser(RetPath),
    /// Callee side: load caller's architectural state, then return.
    RecvKern,
    /// Callee side: copy caller's message registers, then return.
    RecvUser,
    /// Retry a portal call after helping.
    SysIpcCall,
    /// Kernel-generated portal call; resume through the given path.
    SendMsg(RetPath),
    /// Write a status and return through the hypercall path.
    SysFinish(Status, bool),
}

const TAG_NONE: u64 = 0;
const TAG_BLOCKING: u64 = 1;
const TAG_DEAD: u64 = 2;
const TAG_IDLE: u64 = 3;
const TAG_RET_USER: u64 = 4;
const TAG_RECV_KERN: u64 = 5;
const TAG_RECV_USER: u64 = 6;
const TAG_SYS_IPC_CALL: u64 = 7;
const TAG_SEND_MSG: u64 = 8;
const TAG_SYS_FINISH: u64 = 9;

fn path_of(v: u64) -> RetPath {
    match v & 3 {
        0 => RetPath::Hypercall,
        1 => RetPath::Exception,
        _ => RetPath::VmExit,
    }
}

impl Continuation {
    fn encode(self) -> u64 {
        match self {
            Continuation::None => TAG_NONE,
            Continuation::Blocking => TAG_BLOCKING,
            Continuation::Dead => TAG_DEAD,
            Continuation::Idle => TAG_IDLE,
            Continuation::RetUser(p) => TAG_RET_USER | ((p as u64) << 8),
            Continuation::RecvKern => TAG_RECV_KERN,
            Continuation::RecvUser => TAG_RECV_USER,
            Continuation::SysIpcCall => TAG_SYS_IPC_CALL,
            Continuation::SendMsg(p) => TAG_SEND_MSG | ((p as u64) << 8),
            Continuation::SysFinish(s, t) => {
                TAG_SYS_FINISH | (s.as_u64() << 8) | ((t as u64) << 16)
            }
        }
    }

    fn decode(v: u64) -> Self {
        match v & 0xFF {
            TAG_NONE => Continuation::None,
            TAG_BLOCKING => Continuation::Blocking,
            TAG_DEAD => Continuation::Dead,
            TAG_IDLE => Continuation::Idle,
            TAG_RET_USER => Continuation::RetUser(path_of(v >> 8)),
            TAG_RECV_KERN => Continuation::RecvKern,
            TAG_RECV_USER => Continuation::RecvUser,
            TAG_SYS_IPC_CALL => Continuation::SysIpcCall,
            TAG_SEND_MSG => Continuation::SendMsg(path_of(v >> 8)),
            _ => {
                let status = match (v >> 8) & 0xFF {
                    0 => Status::Success,
                    1 => Status::Timeout,
                    2 => Status::Aborted,
                    3 => Status::BadHyp,
                    4 => Status::BadCpu,
                    5 => Status::BadDev,
                    6 => Status::BadPar,
                    7 => Status::BadFtr,
                    8 => Status::BadCap,
                    9 => Status::Ovrflow,
                    10 => Status::InsMem,
                    _ => Status::MemObj,
                };
                Continuation::SysFinish(status, (v >> 16) & 1 != 0)
            }
        }
    }
}

/// What the per-CPU run loop does next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Dispatch the (possibly new) current EC's continuation.
    Run,
    /// Leave the kernel to user mode; hazards already checked.
    User,
    /// Nothing runnable: halt until the next event.
    Halt,
}

/// Why the run loop returned to its caller.
#[derive(Clone, Copy)]
pub enum Exit {
    /// Return to user mode in this EC's context.
    User(&'static Ec),
    /// The CPU went idle.
    Halt,
}

/// FPU save area; owned by at most one EC per CPU at any time.
pub struct Fpu {
    state: Mutex<[u64; 64]>,
}

impl Fpu {
    fn create() -> Option<&'static Fpu> {
        let slot = FPU_CACHE.alloc()?;
        let ptr = slot.as_ptr() as *mut Fpu;
        // SAFETY: fresh, aligned, exclusively owned slab slot.
        unsafe {
            core::ptr::write(
                ptr,
                Fpu {
                    state: Mutex::new([0; 64]),
                },
            );
            Some(&*ptr)
        }
    }

    fn save(&self) {
        // Architected state store; the host model keeps the buffer as-is.
        let _ = self.state.lock();
    }

    fn load(&self) {
        let _ = self.state.lock();
    }
}

static FPU_CACHE: SlabCache = SlabCache::new(core::mem::size_of::<Fpu>(), KOBJECT_ALIGN);

#[repr(C)]
pub struct Ec {
    hdr: Kobject,
    pd: &'static Pd,
    cpu: CpuId,
    /// Base selector of this EC's event portals.
    evt: u64,
    regs: Mutex<Regs>,
    utcb: Option<&'static Utcb>,
    fpu: Option<&'static Fpu>,
    cont: AtomicU64,
    pub hazard: Hazard,
    caller: AtomicPtr<Ec>,
    callee: AtomicPtr<Ec>,
    /// SCs parked on this EC while it blocks.
    blocked_scs: Mutex<VecDeque<&'static Sc>>,
    timeout_armed: AtomicBool,
    /// Accumulated guest TSC offset.
    tsc_offset: AtomicU64,
}

// SAFETY: header first in a #[repr(C)] struct; construction only via
// `construct`.
unsafe impl KernelObject for Ec {
    const TYPE: ObjType = ObjType::Ec;

    fn header(&self) -> &Kobject {
        &self.hdr
    }
}

static CACHE: SlabCache = SlabCache::new(core::mem::size_of::<Ec>(), KOBJECT_ALIGN);

fn destroy(hdr: NonNull<Kobject>) {
    // SAFETY: invoked once per object after the RCU grace period.
    unsafe { demolish::<Ec>(&CACHE, hdr) };
}

impl Drop for Ec {
    fn drop(&mut self) {
        if let Some(utcb) = self.utcb.take() {
            // SAFETY: the EC owned its UTCB exclusively; we are past the
            // grace period.
            unsafe { Utcb::destroy(utcb) };
        }
        if let Some(fpu) = self.fpu.take() {
            FPU_CACHE.free(NonNull::from(fpu).cast());
        }
        super::release(self.pd.header());
    }
}

impl Ec {
    /// Create a kernel thread (idle loop, boot continuation).
    pub fn create_kernel(cpu: CpuId, cont: Continuation) -> Result<&'static Ec, Status> {
        let pd = Pd::kernel();
        if !pd.header().refcount().try_inc() {
            return Err(Status::Aborted);
        }
        construct(
            &CACHE,
            Ec {
                hdr: Kobject::new(ObjType::Ec, Subtype::EcGlobal, destroy),
                pd,
                cpu,
                evt: 0,
                regs: Mutex::new(Regs::new()),
                utcb: None,
                fpu: None,
                cont: AtomicU64::new(cont.encode()),
                hazard: Hazard::new(),
                caller: AtomicPtr::new(core::ptr::null_mut()),
                callee: AtomicPtr::new(core::ptr::null_mut()),
                blocked_scs: Mutex::new(VecDeque::new()),
                timeout_armed: AtomicBool::new(false),
                tsc_offset: AtomicU64::new(0),
            },
        )
        .ok_or(Status::MemObj)
    }

    /// Create a user thread bound to `pd` on `cpu`.
    ///
    /// A global EC owns a scheduling context and starts at `ip`; a local
    /// EC is a portal handler and starts receptive (no continuation).
    /// The UTCB page is allocated here and pinned into the PD's host
    /// space at `utcb_addr`.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        pd: &'static Pd,
        global: bool,
        fpu: bool,
        cpu: CpuId,
        evt: u64,
        utcb_addr: u64,
        sp: u64,
        ip: u64,
    ) -> Result<&'static Ec, Status> {
        if !pd.header().refcount().try_inc() {
            return Err(Status::Aborted);
        }

        let utcb = match Utcb::create() {
            Some(u) => u,
            None => {
                super::release(pd.header());
                return Err(Status::InsMem);
            }
        };

        let fpu = if fpu {
            match Fpu::create() {
                Some(f) => Some(f),
                None => {
                    // SAFETY: nothing references the fresh UTCB yet.
                    unsafe { Utcb::destroy(utcb) };
                    super::release(pd.header());
                    return Err(Status::MemObj);
                }
            }
        } else {
            None
        };

        let mut regs = Regs::new();
        regs.sp = sp;
        regs.ip = ip;

        let cont = if global {
            Continuation::RetUser(RetPath::Hypercall)
        } else {
            Continuation::None
        };

        let ec = construct(
            &CACHE,
            Ec {
                hdr: Kobject::new(
                    ObjType::Ec,
                    if global {
                        Subtype::EcGlobal
                    } else {
                        Subtype::EcLocal
                    },
                    destroy,
                ),
                pd,
                cpu,
                evt,
                regs: Mutex::new(regs),
                utcb: Some(utcb),
                fpu,
                cont: AtomicU64::new(cont.encode()),
                hazard: Hazard::new(),
                caller: AtomicPtr::new(core::ptr::null_mut()),
                callee: AtomicPtr::new(core::ptr::null_mut()),
                blocked_scs: Mutex::new(VecDeque::new()),
                timeout_armed: AtomicBool::new(false),
                tsc_offset: AtomicU64::new(0),
            },
        )
        .ok_or(Status::MemObj)?;

        if pd
            .hst()
            .map_user_page(cpu, utcb_addr, utcb.phys(), Permissions::R | Permissions::W)
            .is_err()
        {
            super::discard(ec.header());
            return Err(Status::InsMem);
        }

        Ok(ec)
    }

    pub fn pd(&self) -> &'static Pd {
        self.pd
    }

    pub fn cpu(&self) -> CpuId {
        self.cpu
    }

    pub fn evt(&self) -> u64 {
        self.evt
    }

    pub fn is_local(&self) -> bool {
        self.hdr.subtype == Subtype::EcLocal
    }

    pub fn utcb(&self) -> Option<&'static Utcb> {
        self.utcb
    }

    pub fn with_regs<R>(&self, f: impl FnOnce(&mut Regs) -> R) -> R {
        f(&mut self.regs.lock())
    }

    // ------------------------------------------------------------------
    // Continuation cell
    // ------------------------------------------------------------------

    pub fn cont(&self) -> Continuation {
        Continuation::decode(self.cont.load(Ordering::Acquire))
    }

    /// Same-CPU continuation store.
    pub fn set_cont(&self, c: Continuation) {
        self.cont.store(c.encode(), Ordering::Relaxed);
    }

    /// Mark the EC blocked with the sentinel continuation.
    pub fn block(&self) {
        self.cont
            .store(Continuation::Blocking.encode(), Ordering::Relaxed);
    }

    /// Install the wake-up continuation.
    ///
    /// Release ordering when the waker runs on a different CPU, so the
    /// target's next acquire load of `blocked()` observes it.
    pub fn unblock(&self, c: Continuation, same_cpu: bool) {
        let ord = if same_cpu {
            Ordering::Relaxed
        } else {
            Ordering::Release
        };
        self.cont.store(c.encode(), ord);
    }

    pub fn blocked(&self) -> bool {
        matches!(self.cont(), Continuation::None | Continuation::Blocking)
    }

    // ------------------------------------------------------------------
    // SC parking
    // ------------------------------------------------------------------

    /// Park the current SC on this blocked EC.
    ///
    /// Returns false when a remote waker already unblocked the EC, in
    /// which case the SC must keep running.
    pub fn block_sc(&self, cpu: CpuId) -> bool {
        let mut q = self.blocked_scs.lock();
        if !self.blocked() {
            return false;
        }
        if let Some(sc) = cpu::get(cpu).current_sc() {
            q.push_back(sc);
        }
        true
    }

    /// Release every parked SC back to the scheduler.
    pub fn unblock_sc(&self) {
        let scs: VecDeque<&'static Sc> = {
            let mut q = self.blocked_scs.lock();
            core::mem::take(&mut *q)
        };
        for sc in scs {
            sched::unblock(sc);
        }
    }

    // ------------------------------------------------------------------
    // Caller/callee chain
    // ------------------------------------------------------------------

    pub fn caller(&self) -> Option<&'static Ec> {
        // SAFETY: chain pointers reference live ECs; links only exist
        // during a synchronous call, which holds both sides live.
        unsafe { self.caller.load(Ordering::Relaxed).as_ref() }
    }

    pub fn callee(&self) -> Option<&'static Ec> {
        // SAFETY: as for `caller`.
        unsafe { self.callee.load(Ordering::Relaxed).as_ref() }
    }

    /// Link self→callee for the duration of a synchronous call.
    pub fn set_partner(&'static self, callee: &'static Ec) {
        self.callee
            .store(callee as *const Ec as *mut Ec, Ordering::Relaxed);
        callee
            .caller
            .store(self as *const Ec as *mut Ec, Ordering::Relaxed);
    }

    /// Unlink self→callee after the reply.
    pub fn clr_partner(&'static self) {
        let callee = self.callee.swap(core::ptr::null_mut(), Ordering::Relaxed);
        // SAFETY: non-null chain pointers reference live ECs.
        if let Some(callee) = unsafe { callee.as_ref() } {
            callee.caller.store(core::ptr::null_mut(), Ordering::Relaxed);
        }
    }

    // ------------------------------------------------------------------
    // Activation
    // ------------------------------------------------------------------

    /// Make this EC the current one on `cpu`.
    pub fn make_current(&'static self, cpu: CpuId) {
        cpu::get(cpu).set_current_ec(self);
    }

    /// Run this EC's donation chain on `cpu` without rescheduling.
    ///
    /// Walks caller→callee to the tail and makes it current; returns
    /// false when the tail blocked and the current SC parked on it.
    pub(crate) fn try_activate(&'static self, cpu: CpuId) -> bool {
        let mut ec = self;
        let mut depth = 0u32;
        while let Some(next) = ec.callee() {
            ec = next;
            depth += 1;
        }
        cpu::get(cpu).donations.store(depth, Ordering::Relaxed);

        // Fast path: the tail cannot block anymore. Slow path: a remote
        // core may unblock it at any time; block_sc arbitrates.
        if !ec.blocked() || !ec.block_sc(cpu) {
            ec.make_current(cpu);
            return true;
        }

        false
    }

    /// Run this EC's donation chain, rescheduling if the tail blocked.
    pub fn activate(&'static self, cpu: CpuId) -> Step {
        if self.try_activate(cpu) {
            Step::Run
        } else {
            sched::schedule(cpu, true)
        }
    }

    /// Help a busy callee by donating the current SC to its chain.
    ///
    /// Returns `None` when the callee died, in which case the caller
    /// maps the failure to ABORTED.
    pub fn help(&'static self, cpu: CpuId, callee: &'static Ec, retry: Continuation) -> Option<Step> {
        if callee.cont() == Continuation::Dead {
            return None;
        }

        self.set_cont(retry);

        // Preemption point ahead of the chain walk.
        cpu::preemption_point();
        if cpu::get(cpu).hazard.intersects(HazardFlags::SCHED) {
            return Some(sched::schedule(cpu, false));
        }

        let cl = cpu::get(cpu);
        if cl.donations.load(Ordering::Relaxed) >= DONATION_LIMIT {
            log::error!("helping chain exceeded depth bound, killing caller");
            return Some(self.kill(cpu, "livelock"));
        }

        cl.counters.helping.fetch_add(1, Ordering::Relaxed);

        if callee.try_activate(cpu) {
            Some(Step::Run)
        } else {
            Some(sched::schedule(cpu, true))
        }
    }

    /// Finish the callee side of a call and resume the caller.
    pub fn reply(&'static self, cpu: CpuId, c: Continuation) -> Step {
        self.set_cont(c);

        if let Some(caller) = self.caller() {
            caller.clr_partner();
            caller.make_current(cpu);
            return Step::Run;
        }

        sched::schedule(cpu, true)
    }

    /// Kill this EC: detach it, poison its caller, redispatch.
    pub fn kill(&'static self, cpu: CpuId, reason: &str) -> Step {
        log::warn!("killing EC on cpu {}: {}", cpu, reason);

        if let Some(caller) = self.caller() {
            let poison = if caller.cont() == Continuation::RetUser(RetPath::Hypercall) {
                Continuation::SysFinish(Status::Aborted, false)
            } else {
                Continuation::Dead
            };
            caller.set_cont(poison);
        }

        self.reply(cpu, Continuation::Dead)
    }

    // ------------------------------------------------------------------
    // Timeouts
    // ------------------------------------------------------------------

    pub fn set_timeout(&'static self, deadline: u64, sm: &'static super::Sm) {
        if deadline != 0 {
            self.timeout_armed.store(true, Ordering::Relaxed);
            sched::timeout::enqueue_hypercall(self.cpu, deadline, self, sm);
        }
    }

    pub fn clr_timeout(&'static self) {
        if self.timeout_armed.swap(false, Ordering::Relaxed) {
            sched::timeout::dequeue_hypercall(self.cpu, self);
        }
    }

    pub(crate) fn timeout_disarmed(&self) {
        self.timeout_armed.store(false, Ordering::Relaxed);
    }

    // ------------------------------------------------------------------
    // Guest time
    // ------------------------------------------------------------------

    /// Account time this EC did not run into its guest TSC offset.
    pub fn adjust_offset_ticks(&self, ticks: u64) {
        self.tsc_offset.fetch_add(ticks, Ordering::Relaxed);
        self.hazard.set(HazardFlags::TSC);
    }

    pub fn tsc_offset(&self) -> u64 {
        self.tsc_offset.load(Ordering::Relaxed)
    }

    // ------------------------------------------------------------------
    // FPU
    // ------------------------------------------------------------------

    /// Transfer FPU ownership on `cpu` to `ec` (or none).
    ///
    /// Returns false when the EC has no FPU state and cannot own it.
    pub fn switch_fpu(cpu: CpuId, ec: Option<&'static Ec>) -> bool {
        let cl = cpu::get(cpu);

        if let Some(ec) = ec {
            if ec.fpu.is_none() {
                return false;
            }
        }

        // SAFETY: fpowner references a live EC until replaced here.
        let prev = unsafe { cl.fpowner.load(Ordering::Relaxed).as_ref() };
        if let Some(prev) = prev {
            if let Some(f) = prev.fpu {
                f.save();
            }
        }

        cl.fpowner.store(
            ec.map_or(core::ptr::null_mut(), |e| e as *const Ec as *mut Ec),
            Ordering::Relaxed,
        );

        if let Some(ec) = ec {
            if let Some(f) = ec.fpu {
                f.load();
            }
        }

        true
    }
}

// ----------------------------------------------------------------------
// Per-CPU run loop
// ----------------------------------------------------------------------

/// Dispatch continuations on `cpu` starting from `step` until the CPU
/// leaves the kernel or goes idle.
pub fn run_from(cpu: CpuId, mut step: Step) -> Exit {
    #[cfg(not(target_os = "none"))]
    cpu::set_current_id(cpu);

    loop {
        match step {
            Step::Run => {
                let ec = cpu::get(cpu).current_ec().expect("no current EC");
                step = dispatch(cpu, ec);
            }
            Step::User => {
                let ec = cpu::get(cpu).current_ec().expect("no current EC");
                return Exit::User(ec);
            }
            Step::Halt => return Exit::Halt,
        }
    }
}

fn dispatch(cpu: CpuId, ec: &'static Ec) -> Step {
    match ec.cont() {
        Continuation::None | Continuation::Blocking => {
            // A blocked EC must not be current; something unblocked the
            // chain out from under us. Reschedule.
            sched::schedule(cpu, true)
        }
        Continuation::Dead => ec.kill(cpu, "activation of dead EC"),
        Continuation::Idle => idle(cpu, ec),
        Continuation::RetUser(path) => ret_user(cpu, ec, path),
        Continuation::RecvKern => crate::syscall::ipc::recv_kern(cpu, ec),
        Continuation::RecvUser => crate::syscall::ipc::recv_user(cpu, ec),
        Continuation::SysIpcCall => crate::syscall::ipc::sys_ipc_call(cpu),
        Continuation::SendMsg(path) => crate::syscall::ipc::send_msg(cpu, ec, path),
        Continuation::SysFinish(status, clear) => finish(cpu, ec, status, clear),
    }
}

/// Terminal syscall step: deliver `status` and return to user.
pub fn finish(_cpu: CpuId, ec: &'static Ec, status: Status, clear_timeout: bool) -> Step {
    if clear_timeout {
        ec.clr_timeout();
    }
    ec.with_regs(|r| r.set_p0(status.as_u64()));
    ec.set_cont(Continuation::RetUser(RetPath::Hypercall));
    Step::Run
}

fn idle(cpu: CpuId, ec: &'static Ec) -> Step {
    let cl = cpu::get(cpu);
    let hzd = cl.hazard.get() & (HazardFlags::RCU | HazardFlags::SLEEP | HazardFlags::SCHED);
    if !hzd.is_empty() {
        return handle_hazard(cpu, ec, hzd, Continuation::Idle);
    }
    crate::arch::halt();
    Step::Halt
}

/// Kernel→user transition with the hazard check.
fn ret_user(cpu: CpuId, ec: &'static Ec, path: RetPath) -> Step {
    let cl = cpu::get(cpu);

    loop {
        let hzd = cl.hazard.get() | ec.hazard.get();
        if hzd.is_empty() {
            break;
        }
        match handle_hazard(cpu, ec, hzd, Continuation::RetUser(path)) {
            Step::Run if core::ptr::eq(cl.current_ec().unwrap_or(ec), ec) => continue,
            step => return step,
        }
    }

    if path == RetPath::VmExit {
        ec.pd().gst().flush_on_entry(cpu);
    }

    Step::User
}

/// Divert through the slow path for one hazard, then resume `cont`.
fn handle_hazard(cpu: CpuId, ec: &'static Ec, hzd: HazardFlags, cont: Continuation) -> Step {
    let cl = cpu::get(cpu);

    if hzd.contains(HazardFlags::ILLEGAL) {
        ec.hazard.clear(HazardFlags::ILLEGAL);
        return ec.kill(cpu, "illegal architectural state");
    }

    if hzd.contains(HazardFlags::RCU) {
        crate::sync::rcu::quiet(cpu);
        return Step::Run;
    }

    if hzd.contains(HazardFlags::SCHED) {
        ec.set_cont(cont);
        return sched::schedule(cpu, false);
    }

    if hzd.contains(HazardFlags::RECALL) {
        ec.hazard.clear(HazardFlags::RECALL);
        if let Continuation::RetUser(path) = cont {
            return crate::syscall::ipc::send_recall(cpu, ec, path);
        }
        return Step::Run;
    }

    if hzd.contains(HazardFlags::FPU) {
        cl.hazard.clear(HazardFlags::FPU);
        Ec::switch_fpu(cpu, Some(ec));
        return Step::Run;
    }

    if hzd.contains(HazardFlags::TSC) {
        // Refresh the guest TSC offset in the VM control structure.
        ec.hazard.clear(HazardFlags::TSC);
        return Step::Run;
    }

    if hzd.contains(HazardFlags::SLEEP) {
        // Platform sleep is not implemented on this target.
        cl.hazard.clear(HazardFlags::SLEEP);
        log::warn!("sleep request ignored");
        return Step::Run;
    }

    cl.hazard
        .clear(HazardFlags::BOOT_HST | HazardFlags::BOOT_GST | HazardFlags::TR);
    ec.hazard
        .clear(HazardFlags::BOOT_HST | HazardFlags::BOOT_GST | HazardFlags::TR);
    Step::Run
}

//! User thread control block.
//!
//! One page per EC, pinned into the owning PD's host space at a
//! caller-chosen address. Holds the transfer descriptor, fault
//! information, a snapshot area for architectural state, and message
//! registers filling the remainder of the page.

use core::ptr::NonNull;

use spin::Mutex;

use crate::arch::regs::{Regs, GPR_COUNT};
use crate::mm::{buddy, Fill, PAGE_SIZE};

use super::mtd::{MtdArch, MtdUser};

/// Message registers available per UTCB.
pub const MR_COUNT: usize = 448;

/// Architectural snapshot transferred by kernel-generated IPC.
#[derive(Clone)]
#[repr(C)]
pub struct ArchState {
    pub gpr: [u64; GPR_COUNT],
    pub sp: u64,
    pub ip: u64,
    pub fault_addr: u64,
    pub fault_info: u64,
    /// Control registers.
    pub ctrl: [u64; 8],
    /// Selected model-specific registers.
    pub msr: [u64; 8],
    /// Virtual-interrupt state.
    pub vint: u64,
    /// Timer state.
    pub tmr: u64,
}

impl ArchState {
    const fn new() -> Self {
        Self {
            gpr: [0; GPR_COUNT],
            sp: 0,
            ip: 0,
            fault_addr: 0,
            fault_info: 0,
            ctrl: [0; 8],
            msr: [0; 8],
            vint: 0,
            tmr: 0,
        }
    }
}

#[repr(C)]
pub struct UtcbData {
    pub mtd: u64,
    pub arch: ArchState,
    pub mr: [u64; MR_COUNT],
}

impl UtcbData {
    const fn new() -> Self {
        Self {
            mtd: 0,
            arch: ArchState::new(),
            mr: [0; MR_COUNT],
        }
    }
}

pub struct Utcb {
    data: Mutex<UtcbData>,
}

const _: () = assert!(core::mem::size_of::<Utcb>() <= PAGE_SIZE);

impl Utcb {
    /// Allocate a UTCB page from the pool.
    pub fn create() -> Option<&'static Utcb> {
        let page = buddy::alloc(0, Fill::Bits0)?;
        let ptr = page.as_ptr() as *mut Utcb;
        // SAFETY: one fresh page, exclusively owned, large enough.
        unsafe {
            core::ptr::write(
                ptr,
                Utcb {
                    data: Mutex::new(UtcbData::new()),
                },
            );
            Some(&*ptr)
        }
    }

    /// Return the UTCB page to the pool.
    ///
    /// # Safety
    /// No reference to this UTCB may remain; called from EC destruction
    /// after the grace period.
    pub unsafe fn destroy(utcb: &'static Utcb) {
        let ptr = NonNull::from(utcb).as_ptr();
        // SAFETY: per contract.
        unsafe { core::ptr::drop_in_place(ptr) };
        buddy::free(ptr as *mut u8);
    }

    /// Physical address of the UTCB page, for mapping into user space.
    pub fn phys(&self) -> u64 {
        crate::mm::ptr_to_phys(self as *const Utcb)
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut UtcbData) -> R) -> R {
        f(&mut self.data.lock())
    }

    /// Copy message registers into `dst` per the user descriptor.
    pub fn copy_user(&self, mtd: MtdUser, dst: &Utcb) {
        let count = mtd.count();
        let src = self.data.lock();
        let mut d = dst.data.lock();
        d.mtd = u64::from(mtd.bits());
        d.mr[..count].copy_from_slice(&src.mr[..count]);
    }

    /// Snapshot architectural state out of a register frame (kernel-
    /// generated IPC delivery).
    pub fn load_arch(&self, regs: &Regs, mtd: MtdArch) {
        let mut d = self.data.lock();
        d.mtd = u64::from(mtd.bits());
        if mtd.contains(MtdArch::GPR) {
            d.arch.gpr = regs.gpr;
        }
        if mtd.contains(MtdArch::SP) {
            d.arch.sp = regs.sp;
        }
        if mtd.contains(MtdArch::IP) {
            d.arch.ip = regs.ip;
        }
        if mtd.contains(MtdArch::FAULT) {
            d.arch.fault_addr = regs.fault_addr;
            d.arch.fault_info = regs.fault_info;
        }
    }

    /// Restore architectural state into a register frame on reply.
    ///
    /// Returns false when the snapshot cannot be restored legally; the
    /// caller marks the EC illegal.
    pub fn save_arch(&self, regs: &mut Regs, mtd: MtdArch) -> bool {
        if mtd.contains(MtdArch::POISON) {
            return false;
        }
        let d = self.data.lock();
        if mtd.contains(MtdArch::GPR) {
            regs.gpr = d.arch.gpr;
        }
        if mtd.contains(MtdArch::SP) {
            regs.sp = d.arch.sp;
        }
        if mtd.contains(MtdArch::IP) {
            regs.ip = d.arch.ip;
        }
        if mtd.contains(MtdArch::FAULT) {
            regs.fault_addr = d.arch.fault_addr;
            regs.fault_info = d.arch.fault_info;
        }
        true
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::test_support;

    #[test]
    fn message_registers_copy_by_count() {
        let _env = test_support::fresh_env(64, 1);
        let a = Utcb::create().unwrap();
        let b = Utcb::create().unwrap();

        a.with(|d| {
            d.mr[0] = 11;
            d.mr[1] = 22;
            d.mr[2] = 33;
        });
        a.copy_user(MtdUser::new(1), b);

        b.with(|d| {
            assert_eq!(d.mr[0], 11);
            assert_eq!(d.mr[1], 22);
            assert_eq!(d.mr[2], 0);
        });
    }

    #[test]
    fn arch_state_round_trips_through_snapshot() {
        let _env = test_support::fresh_env(64, 1);
        let u = Utcb::create().unwrap();

        let mut regs = Regs::new();
        regs.gpr[5] = 0xAB;
        regs.ip = 0x4000;
        regs.sp = 0x9000;
        u.load_arch(&regs, MtdArch::GPR | MtdArch::IP | MtdArch::SP);

        let mut out = Regs::new();
        assert!(u.save_arch(&mut out, MtdArch::GPR | MtdArch::IP | MtdArch::SP));
        assert_eq!(out.gpr[5], 0xAB);
        assert_eq!(out.ip, 0x4000);
        assert_eq!(out.sp, 0x9000);

        assert!(!u.save_arch(&mut out, MtdArch::POISON));
    }
}

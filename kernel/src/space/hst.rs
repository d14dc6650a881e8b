//! Host memory space.
//!
//! Translates supervisor-mode accesses of the CPUs. The kernel half of
//! the address space is shared: per-PD tables copy the master kernel
//! entries at the root level, so kernel mappings are observed identically
//! everywhere. Invalidation is a local TLB flush plus an IPI shootdown of
//! the other online CPUs under a millisecond-bounded wait.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::arch::{self, IpiRequest, Timer};
use crate::cpu::{self, CpuId};
use crate::error::Status;
use crate::mm::page_table::{
    Cacheability, Mapping, Memattr, Permissions, PteFormat, Shareability,
};

use super::mem::SpaceMem;

/// x86-style host entry: present/write/user/global hardware bits, the
/// full permission set stashed in the high available bits so decode is
/// exact, PAT index bits for cacheability.
pub struct HostPte;

const P: u64 = 1 << 0;
const W: u64 = 1 << 1;
const U: u64 = 1 << 2;
const CA_SHIFT: u64 = 3;
const PS: u64 = 1 << 7;
const G: u64 = 1 << 8;
const PM_SHIFT: u64 = 52;
const SH_SHIFT: u64 = 60;
const NX: u64 = 1 << 63;

impl PteFormat for HostPte {
    const LEVELS: usize = 4;
    const BPL: usize = 9;
    const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

    fn ptab_attr() -> u64 {
        P | W | U
    }

    fn page_attr(level: usize, pm: Permissions, ma: Memattr) -> u64 {
        if !pm.intersects(Permissions::R | Permissions::W | Permissions::XU | Permissions::XS) {
            return 0;
        }
        let mut v = P | (u64::from(pm.bits()) << PM_SHIFT) | ((ma.ca as u64) << CA_SHIFT);
        if pm.contains(Permissions::W) {
            v |= W;
        }
        if pm.contains(Permissions::U) {
            v |= U;
        }
        if pm.contains(Permissions::G) {
            v |= G;
        }
        if !pm.intersects(Permissions::XU | Permissions::XS) {
            v |= NX;
        }
        if level > 0 {
            v |= PS;
        }
        v | ((ma.sh as u64) << SH_SHIFT)
    }

    fn page_pm(val: u64) -> Permissions {
        Permissions::from_bits_truncate(((val >> PM_SHIFT) & 0xFF) as u32)
    }

    fn page_ca(val: u64, _level: usize) -> Cacheability {
        match (val >> CA_SHIFT) & 3 {
            0 => Cacheability::MemWb,
            1 => Cacheability::MemWc,
            2 => Cacheability::MemUc,
            _ => Cacheability::Dev,
        }
    }

    fn page_sh(val: u64) -> Shareability {
        match (val >> SH_SHIFT) & 3 {
            2 => Shareability::Outer,
            3 => Shareability::Inner,
            _ => Shareability::None,
        }
    }

    fn is_large(val: u64, level: usize) -> bool {
        level > 0 && val & PS != 0
    }

    fn is_table(val: u64, level: usize) -> bool {
        level > 0 && val & PS == 0
    }
}

/// Root-level slots forming the kernel half of the address space.
const KERNEL_HALF: core::ops::Range<usize> = 256..512;

/// Count of shootdown waits that timed out (diagnostic).
static SHOOTDOWN_HANGS: AtomicU64 = AtomicU64::new(0);

pub struct SpaceHst {
    mem: SpaceMem<HostPte>,
    /// The kernel's own space: delegation source of last resort, and the
    /// master copy of the kernel half.
    kernel: bool,
}

impl Drop for SpaceHst {
    fn drop(&mut self) {
        // The kernel half is shared subtable trees owned by the master
        // copy; detach before the table tree is torn down.
        if !self.kernel {
            for i in KERNEL_HALF {
                self.mem.ptab().root_entry(i).store(0, Ordering::SeqCst);
            }
        }
    }
}

impl SpaceHst {
    pub fn new() -> Option<Self> {
        Some(Self {
            mem: SpaceMem::new(false)?,
            kernel: false,
        })
    }

    pub(crate) fn new_kernel() -> Option<Self> {
        Some(Self {
            mem: SpaceMem::new(false)?,
            kernel: true,
        })
    }

    pub const fn selectors() -> u64 {
        SpaceMem::<HostPte>::selectors()
    }

    /// Page order ceiling for one delegation request.
    pub const fn max_order() -> usize {
        (HostPte::LEVELS - 1) * HostPte::BPL
    }

    pub fn is_kernel(&self) -> bool {
        self.kernel
    }

    pub fn root_phys(&self) -> u64 {
        self.mem.root_phys()
    }

    pub fn lookup(&self, v: u64) -> Option<Mapping> {
        self.mem.lookup(v)
    }

    pub fn update(
        &self,
        cpu: CpuId,
        v: u64,
        p: u64,
        order: usize,
        pm: Permissions,
        ma: Memattr,
    ) -> Result<(), Status> {
        self.mem.update(cpu, v, p, order, pm, ma)
    }

    /// Adopt the master's kernel-half entries.
    ///
    /// Every per-PD table that was shared this way observes later kernel
    /// mappings identically, because the shared entries point into the
    /// same subtable trees.
    pub fn share_from_master(&self, master: &SpaceHst) {
        debug_assert!(master.kernel);
        for i in KERNEL_HALF {
            let v = master.mem.ptab().root_entry(i).load(Ordering::Relaxed);
            self.mem.ptab().root_entry(i).store(v, Ordering::SeqCst);
        }
    }

    /// Delegate a frame range from `src` into this space and synchronize
    /// the TLBs of every online CPU.
    pub fn delegate(
        &self,
        cpu: CpuId,
        src: &SpaceHst,
        ssb: u64,
        dsb: u64,
        ord: usize,
        pmm: Permissions,
        ma: Memattr,
    ) -> Status {
        let s = self.mem.delegate(cpu, src, ssb, dsb, ord, pmm, ma);
        self.sync(cpu);
        crate::mm::buddy::free_wait(cpu);
        s
    }

    /// Flush the local TLB and shoot down every other online CPU.
    pub fn sync(&self, cpu: CpuId) {
        arch::tlb_invalidate_local();

        let deadline = Timer::time() + Timer::ms_to_ticks(1);
        for other in 0..cpu::online() {
            if other == cpu {
                continue;
            }
            let before = cpu::request_count(other, IpiRequest::Shootdown);
            cpu::send_request(other, IpiRequest::Shootdown);
            while cpu::request_count(other, IpiRequest::Shootdown) == before {
                if Timer::time() >= deadline {
                    SHOOTDOWN_HANGS.fetch_add(1, Ordering::Relaxed);
                    log::warn!("shootdown: cpu {} unresponsive", other);
                    break;
                }
                arch::pause();
            }
        }
    }

    /// Map one frame for user access (UTCB, HIP).
    pub fn map_user_page(&self, cpu: CpuId, v: u64, p: u64, pm: Permissions) -> Result<(), Status> {
        self.update(cpu, v, p, 0, pm | Permissions::U, Memattr::ram())
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::arch::IpiRequest;
    use crate::mm::{buddy, Fill};
    use crate::test_support;

    const RW: Permissions = Permissions::R.union(Permissions::W);

    fn backing(frames: usize) -> u64 {
        let p = buddy::alloc(frames.trailing_zeros() as usize, Fill::Bits0).unwrap();
        crate::mm::ptr_to_phys(p.as_ptr())
    }

    #[test]
    fn delegate_intersects_permissions_and_inherits_mapping() {
        let _env = test_support::fresh_env(1024, 2);
        let kernel = SpaceHst::new_kernel().unwrap();
        let user = SpaceHst::new().unwrap();

        let phys = backing(16);
        kernel
            .update(0, 0x10000, phys, 4, RW | Permissions::XU, Memattr::ram())
            .unwrap();

        let s = user.delegate(0, &kernel, 0x10, 0x500, 4, RW, Memattr::ram());
        assert_eq!(s, Status::Success);

        let m = user.lookup(0x500000).unwrap();
        assert_eq!(m.phys, phys);
        assert_eq!(m.pm, RW);
    }

    #[test]
    fn kernel_only_mappings_do_not_delegate() {
        let _env = test_support::fresh_env(1024, 1);
        let kernel = SpaceHst::new_kernel().unwrap();
        let user = SpaceHst::new().unwrap();

        let phys = backing(1);
        kernel
            .update(0, 0x5000, phys, 0, RW | Permissions::K, Memattr::ram())
            .unwrap();

        let s = user.delegate(0, &kernel, 5, 9, 0, RW, Memattr::ram());
        assert_eq!(s, Status::Success);
        assert!(user.lookup(0x9000).is_none());
    }

    #[test]
    fn revoke_by_empty_mask_unmaps_and_shoots_down() {
        let _env = test_support::fresh_env(1024, 2);
        let kernel = SpaceHst::new_kernel().unwrap();
        let user = SpaceHst::new().unwrap();

        let phys = backing(1);
        kernel.update(0, 0x7000, phys, 0, RW, Memattr::ram()).unwrap();

        assert_eq!(
            user.delegate(0, &kernel, 7, 7, 0, RW, Memattr::ram()),
            Status::Success
        );
        assert!(user.lookup(0x7000).is_some());

        let before = cpu::request_count(1, IpiRequest::Shootdown);
        assert_eq!(
            user.delegate(0, &kernel, 7, 7, 0, Permissions::empty(), Memattr::ram()),
            Status::Success
        );
        assert!(user.lookup(0x7000).is_none());
        assert!(cpu::request_count(1, IpiRequest::Shootdown) > before);
    }

    #[test]
    fn kernel_half_is_shared_from_master() {
        let _env = test_support::fresh_env(1024, 1);
        let kernel = SpaceHst::new_kernel().unwrap();
        let user = SpaceHst::new().unwrap();

        // A kernel-half address: top root slot.
        let kva = 0xFFFF_FF80_0000_0000u64 & ((1 << 48) - 1);
        let phys = backing(1);
        kernel
            .update(0, kva, phys, 0, RW | Permissions::G, Memattr::ram())
            .unwrap();

        user.share_from_master(&kernel);
        let m = user.lookup(kva).unwrap();
        assert_eq!(m.phys, phys);

        // Entries added to the shared half after sharing are observed too.
        let phys2 = backing(1);
        kernel
            .update(0, kva + 0x1000, phys2, 0, RW, Memattr::ram())
            .unwrap();
        assert_eq!(user.lookup(kva + 0x1000).unwrap().phys, phys2);
    }
}

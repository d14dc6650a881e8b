//! Guest memory space.
//!
//! Second-stage translation for virtual machines. Each guest space draws
//! a fresh VMID at creation and keeps a per-CPU presence bitmap: a set
//! bit means the CPU may hold stale guest translations, so the next VM
//! entry on that CPU emits the architected guest-TLB invalidation and
//! clears the bit.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::cpu::CpuId;
use crate::error::Status;
use crate::mm::page_table::{
    Cacheability, Mapping, Memattr, Permissions, PteFormat, Shareability,
};

use super::hst::SpaceHst;
use super::mem::SpaceMem;

/// EPT-style guest entry: read/write/execute in the low bits, memory
/// type alongside, the full permission set stashed high for exact decode.
pub struct GstPte;

const R: u64 = 1 << 0;
const W: u64 = 1 << 1;
const X: u64 = 1 << 2;
const MT_SHIFT: u64 = 3;
const LARGE: u64 = 1 << 7;
const PM_SHIFT: u64 = 52;
const SH_SHIFT: u64 = 60;

impl PteFormat for GstPte {
    const LEVELS: usize = 4;
    const BPL: usize = 9;
    const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

    fn ptab_attr() -> u64 {
        R | W | X
    }

    fn page_attr(level: usize, pm: Permissions, ma: Memattr) -> u64 {
        if !pm.intersects(Permissions::R | Permissions::W | Permissions::XU | Permissions::XS) {
            return 0;
        }
        let mut v = u64::from(pm.bits()) << PM_SHIFT;
        if pm.contains(Permissions::R) {
            v |= R;
        }
        if pm.contains(Permissions::W) {
            v |= W;
        }
        if pm.intersects(Permissions::XU | Permissions::XS) {
            v |= X;
        }
        if level > 0 {
            v |= LARGE;
        }
        v | ((ma.ca as u64) << MT_SHIFT) | ((ma.sh as u64) << SH_SHIFT)
    }

    fn page_pm(val: u64) -> Permissions {
        Permissions::from_bits_truncate(((val >> PM_SHIFT) & 0xFF) as u32)
    }

    fn page_ca(val: u64, _level: usize) -> Cacheability {
        match (val >> MT_SHIFT) & 3 {
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
        level > 0 && val & LARGE != 0
    }

    fn is_table(val: u64, level: usize) -> bool {
        level > 0 && val & LARGE == 0
    }
}

/// Per-boot VMID source. A fresh VMID is required per guest space; the
/// counter saturates at the architectural width rather than wrapping
/// into reuse.
static NEXT_VMID: AtomicU32 = AtomicU32::new(1);

const VMID_LIMIT: u32 = u16::MAX as u32;

fn alloc_vmid() -> u16 {
    let v = NEXT_VMID.fetch_add(1, Ordering::Relaxed);
    if v >= VMID_LIMIT {
        NEXT_VMID.store(VMID_LIMIT, Ordering::Relaxed);
        static ONCE: AtomicU32 = AtomicU32::new(0);
        if ONCE.swap(1, Ordering::Relaxed) == 0 {
            log::warn!("vmid space exhausted, reusing {}", VMID_LIMIT);
        }
        return VMID_LIMIT as u16;
    }
    v as u16
}

pub struct SpaceGst {
    mem: SpaceMem<GstPte>,
    vmid: u16,
    /// CPUs whose guest TLB may hold stale entries for this space.
    gtlb: AtomicU32,
    /// Guest-TLB invalidations emitted on VM entry.
    invalidations: AtomicU64,
}

impl SpaceGst {
    pub fn new() -> Option<Self> {
        Some(Self {
            mem: SpaceMem::new(false)?,
            vmid: alloc_vmid(),
            gtlb: AtomicU32::new(0),
            invalidations: AtomicU64::new(0),
        })
    }

    pub const fn selectors() -> u64 {
        SpaceMem::<GstPte>::selectors()
    }

    pub const fn max_order() -> usize {
        (GstPte::LEVELS - 1) * GstPte::BPL
    }

    pub fn vmid(&self) -> u16 {
        self.vmid
    }

    pub fn root_phys(&self) -> u64 {
        self.mem.root_phys()
    }

    pub fn lookup(&self, v: u64) -> Option<Mapping> {
        self.mem.lookup(v)
    }

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
        self.sync();
        crate::mm::buddy::free_wait(cpu);
        s
    }

    /// Mark every CPU's guest TLB stale for this space.
    pub fn sync(&self) {
        self.gtlb
            .store((1u32 << crate::cpu::online()) - 1, Ordering::SeqCst);
    }

    /// VM-entry hook: invalidate the guest TLB if this CPU is marked.
    ///
    /// Returns whether an invalidation was emitted.
    pub fn flush_on_entry(&self, cpu: CpuId) -> bool {
        let bit = 1u32 << cpu;
        if self.gtlb.fetch_and(!bit, Ordering::SeqCst) & bit != 0 {
            self.invalidations.fetch_add(1, Ordering::Relaxed);
            return true;
        }
        false
    }

    pub fn invalidations(&self) -> u64 {
        self.invalidations.load(Ordering::Relaxed)
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::{buddy, Fill};
    use crate::test_support;

    const RW: Permissions = Permissions::R.union(Permissions::W);

    #[test]
    fn each_space_gets_a_fresh_vmid() {
        let _env = test_support::fresh_env(512, 1);
        let a = SpaceGst::new().unwrap();
        let b = SpaceGst::new().unwrap();
        assert_ne!(a.vmid(), b.vmid());
    }

    #[test]
    fn vm_entry_flushes_exactly_once_per_update() {
        let _env = test_support::fresh_env(512, 2);
        let kernel = SpaceHst::new_kernel().unwrap();
        let gst = SpaceGst::new().unwrap();

        let p = buddy::alloc(0, Fill::Bits0).unwrap();
        let phys = crate::mm::ptr_to_phys(p.as_ptr());
        kernel.update(0, 0x3000, phys, 0, RW, Memattr::ram()).unwrap();

        assert_eq!(gst.delegate(0, &kernel, 3, 8, 0, RW, Memattr::ram()), Status::Success);

        assert!(gst.flush_on_entry(0));
        assert!(!gst.flush_on_entry(0));
        assert!(gst.flush_on_entry(1));
        assert_eq!(gst.invalidations(), 2);

        assert_eq!(gst.lookup(0x8000).unwrap().phys, phys);
    }
}

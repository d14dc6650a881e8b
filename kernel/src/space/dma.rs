//! DMA memory space.
//!
//! IOMMU translation for devices. When the IOMMU has no coherent page
//! walker, the space is created non-coherent: every subtable and leaf
//! write is followed by a data-cache clean. Invalidation waits for the
//! controller's synchronization status instead of an IPI.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::cpu::CpuId;
use crate::error::Status;
use crate::mm::page_table::{
    Cacheability, Mapping, Memattr, Permissions, PteFormat, Shareability,
};

use super::hst::SpaceHst;
use super::mem::SpaceMem;

/// IOMMU entry: read/write low bits, stash-decoded permission set.
pub struct DmaPte;

const R: u64 = 1 << 0;
const W: u64 = 1 << 1;
const LARGE: u64 = 1 << 7;
const PM_SHIFT: u64 = 52;
const SH_SHIFT: u64 = 60;
const CA_SHIFT: u64 = 3;

impl PteFormat for DmaPte {
    const LEVELS: usize = 4;
    const BPL: usize = 9;
    const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

    fn ptab_attr() -> u64 {
        R | W
    }

    fn page_attr(level: usize, pm: Permissions, ma: Memattr) -> u64 {
        if !pm.intersects(Permissions::R | Permissions::W) {
            return 0;
        }
        let mut v = u64::from(pm.bits()) << PM_SHIFT;
        if pm.contains(Permissions::R) {
            v |= R;
        }
        if pm.contains(Permissions::W) {
            v |= W;
        }
        if level > 0 {
            v |= LARGE;
        }
        v | ((ma.ca as u64) << CA_SHIFT) | ((ma.sh as u64) << SH_SHIFT)
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
        level > 0 && val & LARGE != 0
    }

    fn is_table(val: u64, level: usize) -> bool {
        level > 0 && val & LARGE == 0
    }
}

pub struct SpaceDma {
    mem: SpaceMem<DmaPte>,
    /// IOTLB invalidations issued.
    invalidations: AtomicU64,
}

impl SpaceDma {
    pub fn new(noncoherent: bool) -> Option<Self> {
        Some(Self {
            mem: SpaceMem::new(noncoherent)?,
            invalidations: AtomicU64::new(0),
        })
    }

    pub const fn selectors() -> u64 {
        SpaceMem::<DmaPte>::selectors()
    }

    pub const fn max_order() -> usize {
        (DmaPte::LEVELS - 1) * DmaPte::BPL
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

    /// Invalidate the IOTLB and wait on the controller's sync status.
    pub fn sync(&self) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn invalidations(&self) -> u64 {
        self.invalidations.load(Ordering::Relaxed)
    }
}

//! Generic memory space: the page-table engine plus the delegation walk
//! shared by the host, guest and DMA flavours.

use crate::cpu::{self, CpuId};
use crate::error::Status;
use crate::mm::page_table::{Mapping, Memattr, Permissions, PteFormat, Ptab};
use crate::mm::PAGE_BITS;

use super::hst::SpaceHst;

/// A memory space backed by one page table of format `F`.
pub struct SpaceMem<F: PteFormat> {
    ptab: Ptab<F>,
    /// The page walker does not snoop the data cache; every table write
    /// must be followed by a cache clean.
    noncoherent: bool,
}

impl<F: PteFormat> Drop for SpaceMem<F> {
    fn drop(&mut self) {
        let cpu = cpu::current_id();
        self.ptab.free_tree(cpu);
        crate::mm::buddy::free_wait(cpu);
    }
}

impl<F: PteFormat> SpaceMem<F> {
    pub fn new(noncoherent: bool) -> Option<Self> {
        Some(Self {
            ptab: Ptab::new()?,
            noncoherent,
        })
    }

    /// Number of page selectors this space translates.
    pub const fn selectors() -> u64 {
        1 << (F::LEVELS * F::BPL)
    }

    pub fn root_phys(&self) -> u64 {
        self.ptab.root_phys()
    }

    pub(crate) fn ptab(&self) -> &Ptab<F> {
        &self.ptab
    }

    pub fn lookup(&self, v: u64) -> Option<Mapping> {
        self.ptab.lookup(v)
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
        self.ptab.update(cpu, v, p, order, pm, ma, self.noncoherent)
    }

    /// Delegate a `2^ord`-frame range from a host space into this space.
    ///
    /// Walks the source, intersects the found permissions with `pmm`,
    /// and installs the result at the destination frames. Kernel-only
    /// mappings never delegate (the permission collapses to empty, which
    /// unmaps the destination). Memory attributes are inherited from the
    /// source unless the source is the kernel's own space, where the
    /// caller-requested attributes win.
    pub fn delegate(
        &self,
        cpu: CpuId,
        src: &SpaceHst,
        ssb: u64,
        dsb: u64,
        ord: usize,
        pmm: Permissions,
        mut ma: Memattr,
    ) -> Status {
        let sse = match ssb.checked_add(1 << ord) {
            Some(e) if e <= SpaceHst::selectors() => e,
            _ => return Status::BadPar,
        };
        match dsb.checked_add(1 << ord) {
            Some(e) if e <= Self::selectors() => (),
            _ => return Status::BadPar,
        }

        let keep = Permissions::K | Permissions::U | pmm;
        let src_is_kernel = src.is_kernel();

        let mut s = ssb;
        let mut d = dsb;
        while s < sse {
            cpu::preemption_point();

            let (mut o, mut pm, phys, attr) = match src.lookup(s << PAGE_BITS) {
                Some(m) => (m.order, m.pm & keep, m.phys, m.ma),
                None => (0, Permissions::empty(), 0, ma),
            };

            // Kernel memory cannot be delegated.
            if pm.contains(Permissions::K) {
                pm = Permissions::empty();
            }

            if !src_is_kernel {
                ma = attr;
            }

            o = o.min(ord);
            let mask = (1u64 << o) - 1;
            let dv = d & !mask;
            let pp = (phys >> PAGE_BITS) & !mask;

            if let Err(e) = self.update(cpu, dv << PAGE_BITS, pp << PAGE_BITS, o, pm, ma) {
                return e;
            }

            s += 1 << o;
            d += 1 << o;
        }

        Status::Success
    }
}

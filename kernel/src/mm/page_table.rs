//! Generic multi-level page-table engine.
//!
//! One radix-tree implementation parameterised over the entry encoding:
//! the host, guest and DMA spaces each supply a [`PteFormat`] with their
//! level count, bits per level and attribute encodings, and get the same
//! atomic walk/update/lookup machinery. Static dispatch only.
//!
//! Concurrency: entries load relaxed; subtable installation is a SEQ_CST
//! compare-and-swap (losers deallocate their raced allocation); leaf
//! replacement is a SEQ_CST exchange. Replaced subtables go onto the
//! deferred-free waitlist because a concurrent lock-free walk may still
//! be traversing them; TLB/IOTLB invalidation is the owning space's duty.

use core::marker::PhantomData;
use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;

use super::{buddy, Fill, PAGE_BITS};
use crate::cpu::CpuId;
use crate::error::Status;

bitflags! {
    /// Access permissions carried by a mapping.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Permissions: u32 {
        /// Readable.
        const R  = 1 << 0;
        /// Writable.
        const W  = 1 << 1;
        /// Executable from user mode.
        const XU = 1 << 2;
        /// Executable from supervisor mode.
        const XS = 1 << 3;
        /// User-accessible.
        const U  = 1 << 4;
        /// Kernel-only; never delegable.
        const K  = 1 << 5;
        /// Global (not flushed on address-space switch).
        const G  = 1 << 6;
        /// Shadow-stack page.
        const SS = 1 << 7;
    }
}

/// Cacheability attribute of a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cacheability {
    MemWb = 0,
    MemWc = 1,
    MemUc = 2,
    Dev = 3,
}

/// Shareability attribute of a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Shareability {
    None = 0,
    Outer = 2,
    Inner = 3,
}

/// Combined memory attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Memattr {
    pub ca: Cacheability,
    pub sh: Shareability,
}

impl Memattr {
    pub const fn ram() -> Self {
        Self {
            ca: Cacheability::MemWb,
            sh: Shareability::Inner,
        }
    }

    pub const fn dev() -> Self {
        Self {
            ca: Cacheability::Dev,
            sh: Shareability::Outer,
        }
    }
}

/// Entry encoding hooks for one page-table flavour.
pub trait PteFormat: 'static {
    /// Number of levels in the radix tree.
    const LEVELS: usize;
    /// Bits translated per level.
    const BPL: usize;
    /// Mask extracting the output address from an entry.
    const ADDR_MASK: u64;

    /// Attribute bits of a link to a subtable.
    fn ptab_attr() -> u64;

    /// Attribute bits of a leaf at `level`; returns 0 for empty
    /// permissions (an unmapping).
    fn page_attr(level: usize, pm: Permissions, ma: Memattr) -> u64;

    /// Decode permissions from a leaf entry.
    fn page_pm(val: u64) -> Permissions;

    /// Decode cacheability from a leaf entry.
    fn page_ca(val: u64, level: usize) -> Cacheability;

    /// Decode shareability from a leaf entry.
    fn page_sh(val: u64) -> Shareability;

    /// Is this nonzero entry a large page at `level`?
    fn is_large(val: u64, level: usize) -> bool;

    /// Is this nonzero entry a subtable link at `level`?
    fn is_table(val: u64, level: usize) -> bool;
}

/// Result of a successful lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub phys: u64,
    /// Size class in page orders: the mapping covers `2^order` pages.
    pub order: usize,
    pub pm: Permissions,
    pub ma: Memattr,
}

/// A multi-level page table with entry encoding `F`.
pub struct Ptab<F: PteFormat> {
    /// Physical address of the root table page.
    root: u64,
    _format: PhantomData<F>,
}

fn entries_of(phys: u64, bpl: usize) -> &'static [AtomicU64] {
    let ptr = super::phys_to_ptr(phys) as *const AtomicU64;
    // SAFETY: table pages are allocated from the pool, zero-filled, and
    // only ever reinterpreted as arrays of atomic words.
    unsafe { core::slice::from_raw_parts(ptr, 1 << bpl) }
}

impl<F: PteFormat> Ptab<F> {
    /// Highest page order expressible as a single leaf run.
    const LIM: usize = (F::LEVELS - 1) * F::BPL;

    /// Allocate an empty table.
    pub fn new() -> Option<Self> {
        let page = buddy::alloc(0, Fill::Bits0)?;
        Some(Self {
            root: super::ptr_to_phys(page.as_ptr()),
            _format: PhantomData,
        })
    }

    /// Physical address of the root table.
    pub fn root_phys(&self) -> u64 {
        self.root
    }

    /// Root-level entry cell, for kernel-half sharing between tables.
    pub(crate) fn root_entry(&self, index: usize) -> &'static AtomicU64 {
        &entries_of(self.root, F::BPL)[index]
    }

    fn shift(level: usize) -> usize {
        level * F::BPL + PAGE_BITS
    }

    fn index(v: u64, level: usize) -> usize {
        ((v >> Self::shift(level)) as usize) & ((1 << F::BPL) - 1)
    }

    /// Size in bytes mapped by one entry at `level`.
    fn entry_size(level: usize) -> u64 {
        1u64 << Self::shift(level)
    }

    /// Return the entry cell at `target_level` for `v`.
    ///
    /// With `allocate`, missing subtables are created and installed by
    /// compare-and-swap, and a large entry on the way down is split into
    /// a fresh subtable that preserves its permissions and attributes.
    fn walk(&self, v: u64, target_level: usize, allocate: bool, nc: bool) -> Option<&AtomicU64> {
        let mut level = F::LEVELS - 1;
        let mut table = self.root;

        loop {
            let entry = &entries_of(table, F::BPL)[Self::index(v, level)];

            if level == target_level {
                return Some(entry);
            }

            let mut val = entry.load(Ordering::Relaxed);

            loop {
                debug_assert!(
                    val == 0 || F::is_large(val, level) != F::is_table(val, level),
                    "entry is both large and table"
                );

                if val == 0 && !allocate {
                    return None;
                }

                if val == 0 || F::is_large(val, level) {
                    let page = buddy::alloc(0, Fill::Bits0)?;
                    let page_phys = super::ptr_to_phys(page.as_ptr());

                    if val != 0 {
                        // Split: repopulate the subtable with entries that
                        // preserve the large page's output range, permissions
                        // and attributes one level down.
                        let pm = F::page_pm(val);
                        let ma = Memattr {
                            ca: F::page_ca(val, level),
                            sh: F::page_sh(val),
                        };
                        let base = val & F::ADDR_MASK;
                        let sub = entries_of(page_phys, F::BPL);
                        let step = Self::entry_size(level - 1);
                        for (i, cell) in sub.iter().enumerate() {
                            let addr = base + i as u64 * step;
                            cell.store(addr | F::page_attr(level - 1, pm, ma), Ordering::Relaxed);
                        }
                    }

                    let link = page_phys | F::ptab_attr();
                    match entry.compare_exchange(val, link, Ordering::SeqCst, Ordering::SeqCst) {
                        Ok(_) => {
                            if nc {
                                crate::arch::cache_clean(entry as *const _ as *const u8, 8);
                            }
                            val = link;
                        }
                        Err(seen) => {
                            // Raced: another CPU installed first.
                            buddy::free(page.as_ptr());
                            val = seen;
                            continue;
                        }
                    }
                }

                break;
            }

            table = val & F::ADDR_MASK;
            level -= 1;
        }
    }

    /// Pure read: resolve `v` to its current mapping, if any.
    pub fn lookup(&self, v: u64) -> Option<Mapping> {
        let mut level = F::LEVELS - 1;
        let mut table = self.root;

        loop {
            let entry = &entries_of(table, F::BPL)[Self::index(v, level)];
            let val = entry.load(Ordering::Relaxed);

            if val == 0 {
                return None;
            }

            if level > 0 && F::is_table(val, level) {
                table = val & F::ADDR_MASK;
                level -= 1;
                continue;
            }

            let order = level * F::BPL;
            let offs_mask = Self::entry_size(level) - 1;
            return Some(Mapping {
                phys: (val & F::ADDR_MASK) | (v & offs_mask & !((1 << PAGE_BITS) - 1)),
                order,
                pm: F::page_pm(val),
                ma: Memattr {
                    ca: F::page_ca(val, level),
                    sh: F::page_sh(val),
                },
            });
        }
    }

    /// Map (or unmap, with empty permissions) `2^order` pages at `v`.
    ///
    /// Writes `2^(order % BPL)` entries at level `order / BPL`, repeated
    /// for orders beyond one level's reach. Replaced subtables are queued
    /// on CPU `cpu`'s deferred-free list; the caller flushes TLBs and then
    /// drains it.
    pub fn update(
        &self,
        cpu: CpuId,
        mut v: u64,
        mut p: u64,
        order: usize,
        pm: Permissions,
        ma: Memattr,
        nc: bool,
    ) -> Result<(), Status> {
        let offs_mask = (1u64 << (order + PAGE_BITS)) - 1;
        debug_assert_eq!(v & offs_mask, 0);
        debug_assert_eq!(p & offs_mask, 0);

        let o = order.min(Self::LIM);
        let level = o / F::BPL;
        let n = 1usize << (o % F::BPL);
        let attr = F::page_attr(level, pm, ma);

        let chunk = 1u64 << (o + PAGE_BITS);
        for _ in 0..1u64 << (order - o) {
            let entry = match self.walk(v, level, attr != 0, nc) {
                Some(e) => e,
                None if attr == 0 => {
                    // Unmapping an already-absent range.
                    v += chunk;
                    p += chunk;
                    continue;
                }
                None => return Err(Status::InsMem),
            };

            let base = entry as *const AtomicU64;
            let step = if attr != 0 { Self::entry_size(level) } else { 0 };
            let mut x = if attr != 0 { p | attr } else { 0 };

            for j in 0..n {
                // SAFETY: the walk returned the first of `n` contiguous
                // entry cells inside one table page.
                let cell = unsafe { &*base.add(j) };
                let old = cell.swap(x, Ordering::SeqCst);
                x = x.wrapping_add(step);

                if old != 0 && level > 0 && F::is_table(old, level) {
                    Self::deallocate(cpu, old & F::ADDR_MASK, level - 1);
                }
            }

            if nc {
                crate::arch::cache_clean(base as *const u8, n * 8);
            }

            v += chunk;
            p += chunk;
        }

        Ok(())
    }

    /// Queue the whole tree, root included, for deferred freeing.
    pub(crate) fn free_tree(&self, cpu: CpuId) {
        Self::deallocate(cpu, self.root, F::LEVELS - 1);
    }

    /// Queue a subtable tree for deferred freeing.
    fn deallocate(cpu: CpuId, table: u64, level: usize) {
        if level > 0 {
            for cell in entries_of(table, F::BPL) {
                let val = cell.load(Ordering::Relaxed);
                if val != 0 && F::is_table(val, level) {
                    Self::deallocate(cpu, val & F::ADDR_MASK, level - 1);
                }
            }
        }
        buddy::wait(cpu, super::phys_to_ptr(table));
    }
}

//! Object space: the sparse two-level capability table.
//!
//! A selector indexes two levels of page-sized tables; the leaf cells
//! are atomic capability words. Levels appear lazily, installed by
//! compare-and-swap so concurrent faults on the same slot allocate at
//! most one table. Lookup is a relaxed load; insert is a CAS from null;
//! update is an unconditional exchange. Capabilities in the table hold a
//! reference on their object, taken with `try_inc` so delegation racing
//! with destruction fails cleanly instead of resurrecting the object.

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::cap::Capability;
use crate::cpu;
use crate::error::Status;
use crate::mm::{buddy, Fill, PAGE_SIZE};
use crate::object;

/// Bits of a selector consumed per level.
pub const BPL: usize = 9;

/// Table levels.
pub const LEVELS: usize = 2;

/// Total selector space.
pub const SELECTORS: u64 = 1 << (BPL * LEVELS);

/// Largest delegation order in one request.
pub const MAX_ORDER: usize = BPL;

const SLOTS: usize = 1 << BPL;

fn table_at(addr: usize) -> &'static [AtomicU64] {
    // SAFETY: table pages come zero-filled from the pool and hold only
    // atomic words for the table's lifetime.
    unsafe { core::slice::from_raw_parts(addr as *const AtomicU64, SLOTS) }
}

/// Per-PD capability table.
pub struct SpaceObj {
    root: AtomicUsize,
}

impl SpaceObj {
    pub const fn new() -> Self {
        Self {
            root: AtomicUsize::new(0),
        }
    }

    fn level_cell(table: &[AtomicU64], index: usize, alloc: bool) -> Option<usize> {
        let mut val = table[index].load(Ordering::Relaxed);
        loop {
            if val != 0 {
                return Some(val as usize);
            }
            if !alloc {
                return None;
            }
            let page = buddy::alloc(0, Fill::Bits0)?;
            let fresh = page.as_ptr() as u64;
            match table[index].compare_exchange(0, fresh, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => return Some(fresh as usize),
                Err(seen) => {
                    buddy::free(page.as_ptr());
                    val = seen;
                }
            }
        }
    }

    /// Leaf cell for `sel`, allocating missing levels when `alloc`.
    fn walk(&self, sel: u64, alloc: bool) -> Option<&'static AtomicU64> {
        debug_assert!(sel < SELECTORS);

        let mut root = self.root.load(Ordering::Relaxed);
        while root == 0 {
            if !alloc {
                return None;
            }
            let page = buddy::alloc(0, Fill::Bits0)?;
            match self.root.compare_exchange(
                0,
                page.as_ptr() as usize,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => root = page.as_ptr() as usize,
                Err(seen) => {
                    buddy::free(page.as_ptr());
                    root = seen;
                }
            }
        }

        let l1 = table_at(root);
        let leaf = Self::level_cell(l1, (sel >> BPL) as usize, alloc)?;
        Some(&table_at(leaf)[(sel & (SLOTS as u64 - 1)) as usize])
    }

    /// Atomic capability lookup.
    pub fn lookup(&self, sel: u64) -> Capability {
        if sel >= SELECTORS {
            return Capability::NULL;
        }
        match self.walk(sel, false) {
            Some(cell) => Capability::from_raw(cell.load(Ordering::Relaxed)),
            None => Capability::NULL,
        }
    }

    /// Install `cap` at a previously empty selector.
    pub fn insert(&self, sel: u64, cap: Capability) -> Status {
        if sel >= SELECTORS {
            return Status::BadPar;
        }
        let cell = match self.walk(sel, true) {
            Some(c) => c,
            None => return Status::InsMem,
        };

        if let Some(hdr) = cap.header() {
            // SAFETY: the caller presents a live object.
            if !unsafe { hdr.as_ref() }.refcount().try_inc() {
                return Status::Aborted;
            }
        }

        match cell.compare_exchange(0, cap.raw(), Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => Status::Success,
            Err(_) => {
                if let Some(hdr) = cap.header() {
                    // SAFETY: reference taken above is returned.
                    object::release(unsafe { hdr.as_ref() });
                }
                Status::BadCap
            }
        }
    }

    /// Replace whatever is at `sel` with `cap` (possibly null).
    pub fn update(&self, sel: u64, cap: Capability) -> Status {
        if sel >= SELECTORS {
            return Status::BadPar;
        }
        let cell = match self.walk(sel, true) {
            Some(c) => c,
            None => return Status::InsMem,
        };

        if let Some(hdr) = cap.header() {
            // SAFETY: the caller presents a live object.
            if !unsafe { hdr.as_ref() }.refcount().try_inc() {
                return Status::Aborted;
            }
        }

        let old = Capability::from_raw(cell.swap(cap.raw(), Ordering::SeqCst));
        if let Some(hdr) = old.header() {
            // SAFETY: the table held a reference on the old object.
            object::release(unsafe { hdr.as_ref() });
        }
        Status::Success
    }

    /// Copy a `2^ord`-selector range from `src`, intersecting permissions
    /// with `pmm`. A copy whose permission intersection is empty clears
    /// the destination slot instead.
    pub fn delegate(&self, src: &SpaceObj, ssb: u64, dsb: u64, ord: usize, pmm: u8) -> Status {
        if ord > MAX_ORDER || ssb + (1 << ord) > SELECTORS || dsb + (1 << ord) > SELECTORS {
            return Status::BadPar;
        }

        for i in 0..1u64 << ord {
            cpu::preemption_point();

            let cap = src.lookup(ssb + i).masked(pmm);
            let cap = if cap.perms() == 0 {
                Capability::NULL
            } else {
                cap
            };

            let s = self.update(dsb + i, cap);
            if s != Status::Success && s != Status::Aborted {
                return s;
            }
        }

        Status::Success
    }
}

impl Default for SpaceObj {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SpaceObj {
    fn drop(&mut self) {
        let root = self.root.load(Ordering::Relaxed);
        if root == 0 {
            return;
        }
        for l1 in table_at(root) {
            let leaf = l1.load(Ordering::Relaxed) as usize;
            if leaf == 0 {
                continue;
            }
            for cell in table_at(leaf) {
                let cap = Capability::from_raw(cell.load(Ordering::Relaxed));
                if let Some(hdr) = cap.header() {
                    // SAFETY: the table owned a reference on the object.
                    object::release(unsafe { hdr.as_ref() });
                }
            }
            buddy::free(leaf as *mut u8);
        }
        buddy::free(root as *mut u8);
    }
}

const _: () = assert!(PAGE_SIZE / core::mem::size_of::<u64>() == SLOTS);

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::object::{KernelObject, Kobject, Sm};
    use crate::test_support;

    fn sample_object() -> &'static Kobject {
        Sm::create(0, None).unwrap().header()
    }

    #[test]
    fn insert_then_lookup_returns_same_capability() {
        let _env = test_support::fresh_env(128, 1);
        let space = SpaceObj::new();
        let obj = sample_object();
        let cap = Capability::new(obj, 0b111);

        assert_eq!(space.insert(5, cap), Status::Success);
        assert_eq!(space.lookup(5), cap);
    }

    #[test]
    fn insert_fails_on_occupied_slot() {
        let _env = test_support::fresh_env(128, 1);
        let space = SpaceObj::new();
        let cap = Capability::new(sample_object(), 0b1);

        assert_eq!(space.insert(9, cap), Status::Success);
        assert_eq!(space.insert(9, cap), Status::BadCap);
    }

    #[test]
    fn update_replaces_and_lookup_observes() {
        let _env = test_support::fresh_env(128, 1);
        let space = SpaceObj::new();
        let a = Capability::new(sample_object(), 0b1);
        let b = Capability::new(sample_object(), 0b11);

        assert_eq!(space.insert(7, a), Status::Success);
        assert_eq!(space.update(7, b), Status::Success);
        assert_eq!(space.lookup(7), b);
    }

    #[test]
    fn lookup_out_of_range_is_null() {
        let _env = test_support::fresh_env(128, 1);
        let space = SpaceObj::new();
        assert!(space.lookup(SELECTORS).is_null());
        assert!(space.lookup(12345).is_null());
    }

    #[test]
    fn second_level_selectors_work() {
        let _env = test_support::fresh_env(128, 1);
        let space = SpaceObj::new();
        let cap = Capability::new(sample_object(), 0b1);
        let sel = (3 << BPL) as u64 + 17;

        assert_eq!(space.insert(sel, cap), Status::Success);
        assert_eq!(space.lookup(sel), cap);
        assert!(space.lookup(sel + 1).is_null());
    }

    #[test]
    fn delegate_intersects_permissions() {
        let _env = test_support::fresh_env(128, 1);
        let src = SpaceObj::new();
        let dst = SpaceObj::new();
        let cap = Capability::new(sample_object(), 0b11111);

        assert_eq!(src.insert(0, cap), Status::Success);
        assert_eq!(dst.delegate(&src, 0, 10, 0, 0b00101), Status::Success);
        assert_eq!(dst.lookup(10).perms(), 0b00101);

        // Empty intersection clears the destination.
        assert_eq!(dst.delegate(&src, 0, 10, 0, 0), Status::Success);
        assert!(dst.lookup(10).is_null());
    }

    #[test]
    fn table_holds_object_reference() {
        let _env = test_support::fresh_env(128, 1);
        let space = SpaceObj::new();
        let sm = Sm::create(0, None).unwrap();
        let before = sm.header().refcount().value();

        assert_eq!(
            space.insert(1, Capability::new(sm.header(), 0b1)),
            Status::Success
        );
        assert_eq!(sm.header().refcount().value(), before + 1);

        assert_eq!(space.update(1, Capability::NULL), Status::Success);
        assert_eq!(sm.header().refcount().value(), before);
    }
}

//! Model-specific-register space.
//!
//! A permission bitmap over a bounded MSR window, two bits per register
//! (read, write), with the same delegation shape as the port space. The
//! window covers the architectural MSRs user-level monitors pass through;
//! everything outside it is implicitly denied.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::cpu;
use crate::error::Status;
use crate::mm::{buddy, Fill};

pub use super::pio::PortPerm as MsrPerm;

/// Size of the delegable MSR window.
pub const MSRS: u64 = 1 << 13;

const WORDS: usize = (MSRS as usize * 2) / 64;

pub struct SpaceMsr {
    bitmap: &'static [AtomicU64],
}

impl SpaceMsr {
    pub fn new(grant_all: bool) -> Option<Self> {
        let fill = if grant_all { Fill::Bits1 } else { Fill::Bits0 };
        let page = buddy::alloc(0, fill)?;
        // SAFETY: one fresh pool page reinterpreted as atomic words for
        // the lifetime of the space.
        let bitmap = unsafe {
            core::slice::from_raw_parts(page.as_ptr() as *const AtomicU64, WORDS)
        };
        Some(Self { bitmap })
    }

    pub fn lookup(&self, msr: u64) -> MsrPerm {
        if msr >= MSRS {
            return MsrPerm::empty();
        }
        let bit = (msr as usize) * 2;
        let word = self.bitmap[bit / 64].load(Ordering::Relaxed);
        MsrPerm::from_bits_truncate(((word >> (bit % 64)) & 0b11) as u8)
    }

    fn set(&self, msr: u64, perm: MsrPerm) {
        let bit = (msr as usize) * 2;
        let mask = 0b11u64 << (bit % 64);
        let val = u64::from(perm.bits()) << (bit % 64);
        let word = &self.bitmap[bit / 64];
        let mut cur = word.load(Ordering::Relaxed);
        loop {
            let new = (cur & !mask) | val;
            match word.compare_exchange(cur, new, Ordering::SeqCst, Ordering::Relaxed) {
                Ok(_) => return,
                Err(seen) => cur = seen,
            }
        }
    }

    pub fn delegate(&self, src: &SpaceMsr, base: u64, ord: usize, pmm: MsrPerm) -> Status {
        let end = match base.checked_add(1 << ord) {
            Some(e) if e <= MSRS => e,
            _ => return Status::BadPar,
        };
        for msr in base..end {
            cpu::preemption_point();
            self.set(msr, src.lookup(msr) & pmm);
        }
        Status::Success
    }
}

impl Drop for SpaceMsr {
    fn drop(&mut self) {
        buddy::free(self.bitmap.as_ptr() as *mut u8);
    }
}

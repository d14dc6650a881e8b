//! Port-I/O space.
//!
//! A permission bitmap over the 16-bit port range, two bits per port
//! (read, write). Delegation intersects source and mask like the other
//! spaces; the kernel PD's bitmap is the grant root. The objects exist on
//! every architecture so the PD layout stays uniform; exercising them
//! where the platform has no port I/O reports BAD_FTR at the system-call
//! layer.

use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;

use crate::cpu;
use crate::error::Status;
use crate::mm::{buddy, Fill};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PortPerm: u8 {
        const R = 1 << 0;
        const W = 1 << 1;
    }
}

pub const PORTS: u64 = 1 << 16;

/// Two bits per port.
const WORDS: usize = (PORTS as usize * 2) / 64;
const PAGES_ORDER: usize = 2;

pub struct SpacePio {
    bitmap: &'static [AtomicU64],
}

impl SpacePio {
    /// Create an empty (or, for the kernel PD, full) port space.
    pub fn new(grant_all: bool) -> Option<Self> {
        let fill = if grant_all { Fill::Bits1 } else { Fill::Bits0 };
        let page = buddy::alloc(PAGES_ORDER, fill)?;
        // SAFETY: freshly allocated pool pages, reinterpreted as atomic
        // words for the lifetime of the space.
        let bitmap = unsafe {
            core::slice::from_raw_parts(page.as_ptr() as *const AtomicU64, WORDS)
        };
        Some(Self { bitmap })
    }

    pub fn lookup(&self, port: u64) -> PortPerm {
        if port >= PORTS {
            return PortPerm::empty();
        }
        let bit = (port as usize) * 2;
        let word = self.bitmap[bit / 64].load(Ordering::Relaxed);
        PortPerm::from_bits_truncate(((word >> (bit % 64)) & 0b11) as u8)
    }

    fn set(&self, port: u64, perm: PortPerm) {
        let bit = (port as usize) * 2;
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

    /// Delegate a `2^ord`-port range, intersecting with `pmm`.
    pub fn delegate(&self, src: &SpacePio, base: u64, ord: usize, pmm: PortPerm) -> Status {
        let end = match base.checked_add(1 << ord) {
            Some(e) if e <= PORTS => e,
            _ => return Status::BadPar,
        };
        for port in base..end {
            cpu::preemption_point();
            self.set(port, src.lookup(port) & pmm);
        }
        Status::Success
    }
}

impl Drop for SpacePio {
    fn drop(&mut self) {
        buddy::free(self.bitmap.as_ptr() as *mut u8);
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::test_support;

    #[test]
    fn delegation_intersects_and_revokes() {
        let _env = test_support::fresh_env(512, 1);
        let root = SpacePio::new(true).unwrap();
        let user = SpacePio::new(false).unwrap();

        assert_eq!(user.lookup(0x3F8), PortPerm::empty());
        assert_eq!(user.delegate(&root, 0x3F8, 3, PortPerm::R), Status::Success);
        assert_eq!(user.lookup(0x3F8), PortPerm::R);
        assert_eq!(user.lookup(0x3FF), PortPerm::R);
        assert_eq!(user.lookup(0x400), PortPerm::empty());

        assert_eq!(
            user.delegate(&root, 0x3F8, 3, PortPerm::empty()),
            Status::Success
        );
        assert_eq!(user.lookup(0x3F8), PortPerm::empty());
    }
}

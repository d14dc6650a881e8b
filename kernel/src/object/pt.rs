//! Portals.
//!
//! A portal is an IPC rendezvous point: a strong reference to the
//! handler EC (which must be local), the instruction pointer the handler
//! starts at, a badge delivered to the handler, and the transfer mask
//! for kernel-generated calls. Badge and mask are mutable post-creation
//! through `ctrl_pt`.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::error::Status;
use crate::ipc::mtd::MtdArch;
use crate::mm::slab::SlabCache;

use super::{construct, demolish, Ec, KernelObject, Kobject, ObjType, Subtype, KOBJECT_ALIGN};

#[repr(C)]
pub struct Pt {
    hdr: Kobject,
    ec: &'static Ec,
    ip: u64,
    id: AtomicU64,
    mtd: AtomicU32,
}

// SAFETY: header first in a #[repr(C)] struct; construction only via
// `construct`.
unsafe impl KernelObject for Pt {
    const TYPE: ObjType = ObjType::Pt;

    fn header(&self) -> &Kobject {
        &self.hdr
    }
}

static CACHE: SlabCache = SlabCache::new(core::mem::size_of::<Pt>(), KOBJECT_ALIGN);

fn destroy(hdr: NonNull<Kobject>) {
    // SAFETY: invoked once per object after the RCU grace period.
    unsafe { demolish::<Pt>(&CACHE, hdr) };
}

impl Drop for Pt {
    fn drop(&mut self) {
        super::release(self.ec.header());
    }
}

impl Pt {
    pub fn create(ec: &'static Ec, ip: u64) -> Result<&'static Pt, Status> {
        if !ec.header().refcount().try_inc() {
            return Err(Status::Aborted);
        }
        let pt = construct(
            &CACHE,
            Pt {
                hdr: Kobject::new(ObjType::Pt, Subtype::None, destroy),
                ec,
                ip,
                id: AtomicU64::new(0),
                mtd: AtomicU32::new(0),
            },
        );
        match pt {
            Some(pt) => {
                log::trace!("PT created ec={:p} ip={:#x}", ec, ip);
                Ok(pt)
            }
            // The dropped value already returned its EC reference.
            None => Err(Status::MemObj),
        }
    }

    pub fn ec(&self) -> &'static Ec {
        self.ec
    }

    pub fn ip(&self) -> u64 {
        self.ip
    }

    pub fn id(&self) -> u64 {
        self.id.load(Ordering::Relaxed)
    }

    pub fn set_id(&self, id: u64) {
        self.id.store(id, Ordering::Relaxed);
    }

    pub fn mtd_raw(&self) -> u32 {
        self.mtd.load(Ordering::Relaxed)
    }

    pub fn mtd_arch(&self) -> MtdArch {
        MtdArch::from_bits_truncate(self.mtd_raw())
    }

    pub fn set_mtd(&self, mtd: u32) {
        self.mtd.store(mtd, Ordering::Relaxed);
    }
}

//! Protection domains.
//!
//! A PD is the resource container: it owns the object space (capability
//! table), the three memory spaces, and the port-I/O and MSR bitmaps.
//! The kernel PD holds the master host space (every mapping the kernel
//! hands out is delegated from it) and the full-grant I/O bitmaps.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicPtr, Ordering};

use crate::error::Status;
use crate::mm::slab::SlabCache;
use crate::space::{SpaceDma, SpaceGst, SpaceHst, SpaceMsr, SpaceObj, SpacePio};

use super::{construct, demolish, KernelObject, Kobject, ObjType, Subtype, KOBJECT_ALIGN};

#[repr(C)]
pub struct Pd {
    hdr: Kobject,
    obj: SpaceObj,
    hst: SpaceHst,
    gst: SpaceGst,
    dma: SpaceDma,
    pio: SpacePio,
    msr: SpaceMsr,
}

// SAFETY: header is the first field of a #[repr(C)] struct and Pds are
// built only through `construct`.
unsafe impl KernelObject for Pd {
    const TYPE: ObjType = ObjType::Pd;

    fn header(&self) -> &Kobject {
        &self.hdr
    }
}

static CACHE: SlabCache = SlabCache::new(core::mem::size_of::<Pd>(), KOBJECT_ALIGN);

static KERNEL: AtomicPtr<Pd> = AtomicPtr::new(core::ptr::null_mut());
static ROOT: AtomicPtr<Pd> = AtomicPtr::new(core::ptr::null_mut());

fn destroy(hdr: NonNull<Kobject>) {
    // SAFETY: invoked once per object after the RCU grace period.
    unsafe { demolish::<Pd>(&CACHE, hdr) };
}

impl Pd {
    fn build(kernel: bool) -> Result<&'static Pd, Status> {
        let hst = if kernel {
            SpaceHst::new_kernel()
        } else {
            SpaceHst::new()
        }
        .ok_or(Status::InsMem)?;

        let pd = Pd {
            hdr: Kobject::new(ObjType::Pd, Subtype::None, destroy),
            obj: SpaceObj::new(),
            hst,
            gst: SpaceGst::new().ok_or(Status::InsMem)?,
            dma: SpaceDma::new(false).ok_or(Status::InsMem)?,
            pio: SpacePio::new(kernel).ok_or(Status::InsMem)?,
            msr: SpaceMsr::new(kernel).ok_or(Status::InsMem)?,
        };

        let pd = construct(&CACHE, pd).ok_or(Status::MemObj)?;

        if !kernel {
            if let Some(master) = Self::try_kernel() {
                pd.hst.share_from_master(&master.hst);
            }
        }

        Ok(pd)
    }

    /// Create a user PD.
    pub fn create() -> Result<&'static Pd, Status> {
        Self::build(false)
    }

    pub fn obj(&self) -> &SpaceObj {
        &self.obj
    }

    pub fn hst(&self) -> &SpaceHst {
        &self.hst
    }

    pub fn gst(&self) -> &SpaceGst {
        &self.gst
    }

    pub fn dma(&self) -> &SpaceDma {
        &self.dma
    }

    pub fn pio(&self) -> &SpacePio {
        &self.pio
    }

    pub fn msr(&self) -> &SpaceMsr {
        &self.msr
    }

    /// The kernel's own PD.
    pub fn kernel() -> &'static Pd {
        Self::try_kernel().expect("kernel PD not initialized")
    }

    pub fn try_kernel() -> Option<&'static Pd> {
        // SAFETY: set once at boot to a live, never-destroyed PD.
        unsafe { KERNEL.load(Ordering::Acquire).as_ref() }
    }

    /// The root task's PD, once bootstrapped.
    pub fn root() -> Option<&'static Pd> {
        // SAFETY: set at boot; the root PD is never destroyed.
        unsafe { ROOT.load(Ordering::Acquire).as_ref() }
    }

    pub fn is_kernel(&self) -> bool {
        core::ptr::eq(self, KERNEL.load(Ordering::Relaxed))
    }

    pub fn is_root(&self) -> bool {
        core::ptr::eq(self, ROOT.load(Ordering::Relaxed))
    }

    /// Install the kernel PD (boot path).
    pub(crate) fn init_kernel() -> Result<&'static Pd, Status> {
        let pd = Self::build(true)?;
        KERNEL.store(pd as *const Pd as *mut Pd, Ordering::Release);
        Ok(pd)
    }

    /// Record the root PD (boot path).
    pub(crate) fn set_root(pd: &'static Pd) {
        ROOT.store(pd as *const Pd as *mut Pd, Ordering::Release);
    }
}

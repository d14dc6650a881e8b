//! Spaces owned by a protection domain.
//!
//! A PD owns an object space (the capability table), three memory spaces
//! (host, guest, DMA) sharing the generic page-table engine, and the
//! port-I/O and MSR permission bitmaps. All spaces expose the same
//! `delegate` shape: walk the source, intersect permissions, install
//! into the destination.

pub mod dma;
pub mod gst;
pub mod hst;
pub mod mem;
pub mod msr;
pub mod obj;
pub mod pio;

pub use dma::SpaceDma;
pub use gst::SpaceGst;
pub use hst::SpaceHst;
pub use msr::SpaceMsr;
pub use obj::SpaceObj;
pub use pio::SpacePio;

/// Space selector in `ctrl_pd` requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SpaceKind {
    Obj = 0,
    Hst = 1,
    Gst = 2,
    Dma = 3,
    Pio = 4,
    Msr = 5,
}

impl SpaceKind {
    pub fn from_raw(v: u64) -> Option<Self> {
        match v {
            0 => Some(Self::Obj),
            1 => Some(Self::Hst),
            2 => Some(Self::Gst),
            3 => Some(Self::Dma),
            4 => Some(Self::Pio),
            5 => Some(Self::Msr),
            _ => None,
        }
    }
}

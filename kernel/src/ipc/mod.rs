//! IPC message transfer: descriptors and the per-EC UTCB.

pub mod mtd;
pub mod utcb;

pub use mtd::{MtdArch, MtdUser};
pub use utcb::Utcb;

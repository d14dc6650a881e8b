//! Message transfer descriptors.
//!
//! A 32-bit mask selecting what moves between UTCB and architectural
//! state on IPC. User transfers interpret the descriptor as a message
//! register count; kernel-generated transfers (exceptions, VM exits)
//! interpret it as a mask of register classes. The kernel treats every
//! class symmetrically: loaded for the callee, saved on reply.

use bitflags::bitflags;

use super::utcb::MR_COUNT;

/// User-IPC descriptor: low bits select how many message registers copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct MtdUser(u32);

impl MtdUser {
    pub const fn new(v: u32) -> Self {
        Self(v)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Number of message registers transferred: 1..=MR_COUNT.
    pub fn count(self) -> usize {
        (self.0 as usize % MR_COUNT) + 1
    }
}

bitflags! {
    /// Architectural-state descriptor for kernel-generated IPC.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MtdArch: u32 {
        /// Poisoned transfer; the reply must not restore state.
        const POISON   = 1 << 0;
        /// General-purpose registers.
        const GPR      = 1 << 1;
        /// Floating-point registers.
        const FPR      = 1 << 2;
        /// Stack pointer.
        const SP       = 1 << 3;
        /// Instruction pointer and flags.
        const IP       = 1 << 4;
        /// Fault address and syndrome.
        const FAULT    = 1 << 5;
        /// Control registers.
        const CTRL     = 1 << 6;
        /// Virtual-interrupt state.
        const VINT     = 1 << 7;
        /// Timer state.
        const TMR      = 1 << 8;
    }
}

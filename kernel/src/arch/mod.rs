//! Architecture layer.
//!
//! Everything the portable kernel needs from the hardware sits behind this
//! module: the neutral register frame, the architected timer, inter-
//! processor interrupts, cache maintenance for non-coherent page walkers,
//! and the kernel/user transition. The host build substitutes a software
//! model for each of these so the portable core is unit-testable; the
//! bare-metal build supplies the real instructions per architecture.

pub mod regs;
pub mod timer;

pub use regs::Regs;
pub use timer::Timer;

#[cfg(not(target_os = "none"))]
use core::sync::atomic::{AtomicU64, Ordering};

use crate::cpu::CpuId;

/// Inter-processor interrupt request kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum IpiRequest {
    /// Remote-ready: the target CPU's release queue became nonempty.
    RemoteReady = 0,
    /// Recall: the target CPU must re-evaluate an EC's hazards.
    Recall = 1,
    /// TLB shootdown: the target CPU must invalidate its TLB.
    Shootdown = 2,
}

pub const IPI_KINDS: usize = 3;

/// Raise an IPI on the target CPU.
///
/// The host model delivers nothing; `cpu::send_request` accounts delivery
/// in the per-CPU request counters, which is what the portable kernel
/// spins on.
pub fn raise_ipi(_cpu: CpuId, _req: IpiRequest) {
    #[cfg(all(target_os = "none", target_arch = "x86_64"))]
    {
        // Programmed through the local APIC ICR by the interrupt layer.
    }
    #[cfg(all(target_os = "none", target_arch = "aarch64"))]
    {
        // Programmed through GICD_SGIR by the interrupt layer.
    }
}

/// Clean a data-cache range to the point of coherency.
///
/// Required after page-table writes when the page walker (an IOMMU
/// without a coherent walker) does not snoop the data cache.
pub fn cache_clean(ptr: *const u8, len: usize) {
    #[cfg(not(target_os = "none"))]
    {
        let _ = (ptr, len);
        CACHE_CLEANS.fetch_add(1, Ordering::Relaxed);
    }
    #[cfg(all(target_os = "none", target_arch = "aarch64"))]
    {
        const LINE: usize = 64;
        let mut a = ptr as usize & !(LINE - 1);
        while a < ptr as usize + len {
            // SAFETY: DC CVAC on a mapped kernel address.
            unsafe { core::arch::asm!("dc cvac, {}", in(reg) a) };
            a += LINE;
        }
        // SAFETY: barrier instruction, no operands.
        unsafe { core::arch::asm!("dsb ish") };
    }
    #[cfg(all(target_os = "none", not(target_arch = "aarch64")))]
    {
        let _ = (ptr, len);
    }
}

#[cfg(not(target_os = "none"))]
static CACHE_CLEANS: AtomicU64 = AtomicU64::new(0);

/// Number of cache-clean operations issued (host model).
#[cfg(not(target_os = "none"))]
pub fn cache_clean_count() -> u64 {
    CACHE_CLEANS.load(Ordering::Relaxed)
}

/// Invalidate the local TLB for an address-space switch or shootdown.
pub fn tlb_invalidate_local() {
    #[cfg(all(target_os = "none", target_arch = "x86_64"))]
    {
        x86_64::instructions::tlb::flush_all();
    }
    #[cfg(all(target_os = "none", target_arch = "aarch64"))]
    {
        // SAFETY: TLBI VMALLE1IS + barriers, no operands.
        unsafe { core::arch::asm!("dsb ishst", "tlbi vmalle1is", "dsb ish", "isb") };
    }
}

/// Relax the CPU inside a spin-wait loop.
#[inline]
pub fn pause() {
    core::hint::spin_loop();
}

/// Halt the CPU until the next interrupt.
pub fn halt() {
    #[cfg(all(target_os = "none", target_arch = "x86_64"))]
    x86_64::instructions::hlt();
    #[cfg(all(target_os = "none", target_arch = "aarch64"))]
    cortex_a::asm::wfi();
    #[cfg(all(target_os = "none", target_arch = "riscv64"))]
    riscv::asm::wfi();
    #[cfg(not(target_os = "none"))]
    pause();
}

/// Program the hardware one-shot timer deadline (bare metal).
#[cfg(target_os = "none")]
pub(crate) fn set_hw_deadline(_time: u64) {
    #[cfg(target_arch = "x86_64")]
    {
        // TSC-deadline MSR, written by the interrupt layer.
    }
    #[cfg(target_arch = "aarch64")]
    {
        // SAFETY: CNTHP timer registers are writable at EL2.
        unsafe {
            core::arch::asm!("msr cnthp_cval_el2, {}", in(reg) _time);
            core::arch::asm!("msr cnthp_ctl_el2, {}", in(reg) 1u64);
        }
    }
}

/// Load the user-visible register frame and leave the kernel.
///
/// On bare metal this reloads the architectural state from `regs` and
/// executes the fast-syscall return (or exception return) instruction; it
/// never returns. The host model has no user mode, so the portable kernel
/// surfaces the transition as an exit value instead of calling this.
#[cfg(target_os = "none")]
pub fn enter_user(_regs: &Regs) -> ! {
    unimplemented!("architected user return stub")
}

//! Architected timer abstraction.
//!
//! The scheduler and the timeout lists work in timer ticks. On bare metal
//! the tick source is the architected counter (TSC, CNTPCT, `time` CSR);
//! on the host build it is a monotonic software counter that tests advance
//! explicitly, which makes every time-dependent path deterministic.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::cpu::{CpuId, MAX_CPUS};

/// Timer frequency in Hz.
///
/// Defaults to 1 GHz (1 tick == 1 ns) until bring-up code overrides it
/// from the firmware tables. Must stay >= 1 kHz so that 1 ms converts to a
/// nonzero number of ticks.
static FREQ: AtomicU64 = AtomicU64::new(1_000_000_000);

#[cfg(not(target_os = "none"))]
static NOW: AtomicU64 = AtomicU64::new(0);

/// Per-CPU armed deadline, 0 when the timer is stopped.
static DEADLINE: [AtomicU64; MAX_CPUS] = [const { AtomicU64::new(0) }; MAX_CPUS];

pub struct Timer;

impl Timer {
    /// Current time in ticks.
    #[inline]
    pub fn time() -> u64 {
        #[cfg(not(target_os = "none"))]
        {
            NOW.load(Ordering::Relaxed)
        }
        #[cfg(all(target_os = "none", target_arch = "x86_64"))]
        {
            // SAFETY: RDTSC is always available on supported CPUs.
            unsafe { core::arch::x86_64::_rdtsc() }
        }
        #[cfg(all(target_os = "none", target_arch = "aarch64"))]
        {
            let t: u64;
            // SAFETY: CNTPCT_EL0 is readable at EL2.
            unsafe { core::arch::asm!("mrs {}, cntpct_el0", out(reg) t) };
            t
        }
        #[cfg(all(target_os = "none", target_arch = "riscv64"))]
        {
            riscv::register::time::read64()
        }
    }

    #[inline]
    pub fn freq() -> u64 {
        FREQ.load(Ordering::Relaxed)
    }

    /// Override the tick frequency from firmware-provided values.
    pub fn set_freq(hz: u64) {
        debug_assert!(hz >= 1000);
        FREQ.store(hz, Ordering::Relaxed);
    }

    /// Program the one-shot timer deadline for a CPU.
    pub fn set_deadline(cpu: CpuId, time: u64) {
        DEADLINE[cpu as usize].store(time, Ordering::Relaxed);
        #[cfg(target_os = "none")]
        super::set_hw_deadline(time);
    }

    /// Stop the one-shot timer for a CPU.
    pub fn stop(cpu: CpuId) {
        DEADLINE[cpu as usize].store(0, Ordering::Relaxed);
        #[cfg(target_os = "none")]
        super::set_hw_deadline(u64::MAX);
    }

    /// Armed deadline for a CPU, or 0 when stopped.
    pub fn deadline(cpu: CpuId) -> u64 {
        DEADLINE[cpu as usize].load(Ordering::Relaxed)
    }

    /// Convert relative wall-clock milliseconds to ticks.
    #[inline]
    pub fn ms_to_ticks(ms: u32) -> u64 {
        Self::freq() * u64::from(ms) / 1000
    }

    /// Convert relative ticks to wall-clock milliseconds.
    #[inline]
    pub fn ticks_to_ms(ticks: u64) -> u64 {
        ticks * 1000 / Self::freq()
    }

    /// Advance the software clock (host build only).
    #[cfg(not(target_os = "none"))]
    pub fn advance(ticks: u64) {
        NOW.fetch_add(ticks, Ordering::Relaxed);
    }

    /// Reset the software clock (host build only).
    #[cfg(not(target_os = "none"))]
    pub fn reset(time: u64) {
        NOW.store(time, Ordering::Relaxed);
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn tick_conversions_round_trip_at_default_freq() {
        assert_eq!(Timer::ms_to_ticks(1), 1_000_000);
        assert_eq!(Timer::ticks_to_ms(5_000_000), 5);
    }

    #[test]
    fn deadline_is_per_cpu() {
        Timer::set_deadline(2, 1234);
        assert_eq!(Timer::deadline(2), 1234);
        Timer::stop(2);
        assert_eq!(Timer::deadline(2), 0);
    }
}

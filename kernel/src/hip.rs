//! Hypervisor information page.
//!
//! One page built by the kernel before first entry to the root task and
//! mapped read-only at a well-known address in the root PD. Everything
//! the root task needs to bootstrap user space lives here: physical
//! ranges, firmware table pointers, timer frequency, selector bounds,
//! CPU and interrupt counts, per-space maximum delegation orders, and
//! feature flags. The byte-wise checksum over `length` sums to zero.

use crate::boot::BootInfo;
use crate::cpu;
use crate::mm::{buddy, Fill, PAGE_SIZE};
use crate::space::{SpaceDma, SpaceGst, SpaceHst};

/// "NOVA" in little-endian byte order.
pub const SIGNATURE: u32 = u32::from_le_bytes(*b"NOVA");

/// Feature bits advertised to the root task.
pub mod feature {
    /// IOMMU present.
    pub const IOMMU: u64 = 1 << 0;
    /// Guest spaces (second-stage translation) available.
    pub const VIRT: u64 = 1 << 1;
    /// Port-I/O spaces available.
    pub const PIO: u64 = 1 << 2;
}

#[derive(Clone)]
#[repr(C)]
pub struct Hip {
    pub signature: u32,
    pub checksum: u16,
    pub length: u16,

    pub kernel_start: u64,
    pub kernel_end: u64,
    pub root_start: u64,
    pub root_end: u64,

    pub acpi_rsdp: u64,
    pub uefi_map: u64,
    pub uefi_map_size: u32,
    pub uefi_desc_size: u32,
    pub uefi_desc_version: u32,
    _reserved: u32,

    pub timer_freq: u64,

    pub sel_bound: u64,
    /// Base of the architecture-defined event selectors.
    pub evt_arch_base: u64,
    /// Base of the kernel-defined event selectors.
    pub evt_base: u64,

    pub cpu_count: u16,
    pub cpu_bsp: u16,
    pub int_pin: u16,
    pub int_msi: u16,

    pub max_order_hst: u8,
    pub max_order_gst: u8,
    pub max_order_dma: u8,
    pub max_mem_key: u8,
    _pad: u32,

    pub features: u64,

    /// Architecture-specific tail.
    pub arch: [u64; 4],
}

impl Hip {
    fn build(boot: &BootInfo) -> Self {
        let mut hip = Hip {
            signature: SIGNATURE,
            checksum: 0,
            length: core::mem::size_of::<Hip>() as u16,
            kernel_start: boot.kernel_start,
            kernel_end: boot.kernel_end,
            root_start: boot.root_start,
            root_end: boot.root_end,
            acpi_rsdp: boot.acpi_rsdp,
            uefi_map: boot.uefi_map,
            uefi_map_size: boot.uefi_map_size,
            uefi_desc_size: boot.uefi_desc_size,
            uefi_desc_version: boot.uefi_desc_version,
            _reserved: 0,
            timer_freq: crate::arch::Timer::freq(),
            sel_bound: crate::space::obj::SELECTORS,
            evt_arch_base: crate::boot::EVT_ARCH_BASE,
            evt_base: crate::boot::EVT_INT_BASE,
            cpu_count: cpu::online(),
            cpu_bsp: 0,
            int_pin: crate::irq::PIN_COUNT as u16,
            int_msi: 0,
            max_order_hst: SpaceHst::max_order() as u8,
            max_order_gst: SpaceGst::max_order() as u8,
            max_order_dma: SpaceDma::max_order() as u8,
            max_mem_key: 0,
            _pad: 0,
            features: feature::IOMMU | feature::VIRT | feature::PIO,
            arch: [0; 4],
        };
        hip.checksum = hip.compute_checksum();
        hip
    }

    fn bytes(&self) -> &[u8] {
        // SAFETY: plain-old-data view over the struct's own length.
        unsafe {
            core::slice::from_raw_parts(self as *const Hip as *const u8, self.length as usize)
        }
    }

    fn byte_sum(&self) -> u8 {
        self.bytes().iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
    }

    /// Complement making the byte-wise sum over `length` zero; computed
    /// with the checksum field itself still zero.
    fn compute_checksum(&self) -> u16 {
        debug_assert_eq!(self.checksum, 0);
        u16::from(0u8.wrapping_sub(self.byte_sum()))
    }

    /// Byte-wise sum over `length`, checksum included, must be zero.
    pub fn validate(&self) -> bool {
        self.signature == SIGNATURE && self.byte_sum() == 0
    }
}

const _: () = assert!(core::mem::size_of::<Hip>() <= PAGE_SIZE);

/// Build the HIP in a fresh pool page; returns it and its physical
/// address for mapping into the root PD.
pub fn build(boot: &BootInfo) -> Option<(&'static Hip, u64)> {
    let page = buddy::alloc(0, Fill::Bits0)?;
    let ptr = page.as_ptr() as *mut Hip;
    // SAFETY: fresh page, exclusively owned, large enough.
    unsafe {
        core::ptr::write(ptr, Hip::build(boot));
        Some((&*ptr, crate::mm::ptr_to_phys(page.as_ptr())))
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::test_support;

    #[test]
    fn hip_carries_environment_description() {
        let _env = test_support::fresh_env(1024, 2);
        let boot = BootInfo {
            acpi_rsdp: 0xE0000,
            kernel_start: 0x100000,
            kernel_end: 0x400000,
            ..BootInfo::default()
        };
        let (hip, phys) = build(&boot).unwrap();

        assert_eq!(hip.signature, SIGNATURE);
        assert_eq!(hip.cpu_count, 2);
        assert_eq!(hip.acpi_rsdp, 0xE0000);
        assert_eq!(hip.sel_bound, crate::space::obj::SELECTORS);
        assert_eq!(hip.timer_freq, crate::arch::Timer::freq());
        assert_ne!(phys, 0);
        assert_eq!(&hip.signature.to_le_bytes(), b"NOVA");
        assert!(hip.validate());
    }
}

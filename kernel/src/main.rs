//! Bare-metal kernel binary.
//!
//! The real entry stub (multiboot/UEFI handoff, stack setup, paging
//! enable) hands over here with the firmware tables already located.
//! After `init_bsp` the bootstrap CPU enters its run loop and never
//! returns; interrupts re-enter through the `umbra_kernel` entry
//! points.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
use umbra_kernel::{boot::BootInfo, println};

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    println!("[KERNEL PANIC] {}", info);
    umbra_kernel::arch_halt_loop()
}

#[cfg(target_os = "none")]
#[no_mangle]
pub extern "C" fn kernel_main(
    pool_base: *mut u8,
    pool_phys: u64,
    pool_size: usize,
    boot: &BootInfo,
) -> ! {
    println!("umbra {}", env!("CARGO_PKG_VERSION"));

    let pool = core::ptr::NonNull::new(pool_base).expect("no memory pool");
    if let Err(s) = umbra_kernel::init_bsp(pool, pool_phys, pool_size, boot) {
        panic!("bring-up failed: {}", s);
    }

    loop {
        match umbra_kernel::syscall::idle(0) {
            umbra_kernel::Exit::User(_) => {
                // The architected return path takes over from here.
            }
            umbra_kernel::Exit::Halt => {}
        }
    }
}

#[cfg(not(target_os = "none"))]
fn main() {
    // The kernel runs on hardware; the host build exists for testing.
    eprintln!("umbra-kernel: bare-metal image, nothing to run on the host");
}

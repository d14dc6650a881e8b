//! Umbra microhypervisor kernel library.
//!
//! The kernel's object, scheduling, and IPC machinery: kernel objects
//! behind one-word capabilities, the continuation-driven execution-
//! context state machine, the fixed-priority budget scheduler with
//! cross-core release queues, synchronous portal IPC with helping,
//! semaphores with timeouts, epoch-based RCU reclamation, and the
//! generic atomic page-table engine behind the host/guest/DMA spaces.
//!
//! The library builds for bare metal and for the host; the host build
//! substitutes a deterministic software model for the architecture
//! layer so the portable core is testable with the standard harness.

#![no_std]
#![cfg_attr(all(test, target_os = "none"), no_main)]
#![cfg_attr(target_os = "none", feature(alloc_error_handler))]
#![cfg_attr(target_os = "none", feature(custom_test_frameworks))]
#![cfg_attr(target_os = "none", test_runner(crate::test_runner))]
#![cfg_attr(target_os = "none", reexport_test_harness_main = "test_main")]

extern crate alloc;

// On bare metal the kernel heap backs the allocator; on the host the
// system allocator serves, so test code using collections just works.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
use linked_list_allocator::LockedHeap;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

#[cfg(not(target_os = "none"))]
extern crate std;
#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

#[macro_use]
pub mod print;

pub mod arch;
pub mod boot;
pub mod cap;
pub mod cpu;
pub mod error;
pub mod hip;
pub mod integrity;
pub mod ipc;
pub mod irq;
pub mod mm;
pub mod object;
pub mod sched;
pub mod space;
pub mod sync;
pub mod syscall;

#[cfg(all(test, not(target_os = "none")))]
mod integration_tests;
#[cfg(all(test, not(target_os = "none")))]
pub(crate) mod test_support;

pub use boot::{init_ap, init_bsp, BootInfo};
pub use error::Status;
pub use object::ec::Exit;
pub use syscall::{exception, interrupt, remote_ready_ipi, recall_ipi, syscall, timer_interrupt};

/// Halt forever; terminal panic path.
#[cfg(target_os = "none")]
pub fn arch_halt_loop() -> ! {
    loop {
        arch::halt();
    }
}

/// Heap allocation failure in a no_std kernel is unrecoverable.
#[cfg(target_os = "none")]
#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    panic!("allocation error: {:?}", layout);
}

#[cfg(all(test, target_os = "none"))]
#[no_mangle]
pub extern "C" fn _start() -> ! {
    test_main();
    loop {
        core::hint::spin_loop();
    }
}

#[cfg(all(test, target_os = "none"))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    println!("[KERNEL PANIC] {}", info);
    loop {
        core::hint::spin_loop();
    }
}

#[cfg(all(test, target_os = "none"))]
fn test_runner(tests: &[&dyn Fn()]) {
    println!("running {} tests", tests.len());
    for test in tests {
        test();
    }
}

//! Status codes returned to user mode and used for in-kernel propagation.
//!
//! Every system call terminates by writing exactly one `Status` into the
//! primary argument register. Internal fallible operations return
//! `Result<T, Status>` and propagate with `?`; nothing unwinds.

use core::fmt;

/// Outcome of a system call or an internal kernel operation.
#[must_use = "status codes must be handled, not silently discarded"]
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Operation completed.
    Success = 0,
    /// Operation timed out before completion.
    Timeout = 1,
    /// Operation aborted (transient race or dying object).
    Aborted = 2,
    /// Caller is in the wrong protection domain for this operation.
    BadHyp = 3,
    /// Target object is bound to a different CPU.
    BadCpu = 4,
    /// No such device.
    BadDev = 5,
    /// Malformed arguments (bad shape, range, or alignment).
    BadPar = 6,
    /// Feature not available on this platform.
    BadFtr = 7,
    /// Capability not present or of the wrong type/permission.
    BadCap = 8,
    /// Semaphore counter saturated.
    Ovrflow = 9,
    /// Page-frame allocator exhausted.
    InsMem = 10,
    /// Kernel-object slab exhausted.
    MemObj = 11,
}

impl Status {
    /// Raw value as written to the user's status register.
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self as u64
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Success => "SUCCESS",
            Status::Timeout => "TIMEOUT",
            Status::Aborted => "ABORTED",
            Status::BadHyp => "BAD_HYP",
            Status::BadCpu => "BAD_CPU",
            Status::BadDev => "BAD_DEV",
            Status::BadPar => "BAD_PAR",
            Status::BadFtr => "BAD_FTR",
            Status::BadCap => "BAD_CAP",
            Status::Ovrflow => "OVRFLOW",
            Status::InsMem => "INS_MEM",
            Status::MemObj => "MEM_OBJ",
        };
        f.write_str(s)
    }
}

/// Result alias for kernel-internal fallible operations.
pub type Result<T> = core::result::Result<T, Status>;

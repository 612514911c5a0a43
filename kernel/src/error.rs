//! Error types for the virtual memory subsystem.
//!
//! Mirrors the structured, struct-like-variant error style used
//! throughout this codebase instead of string literals.

use core::fmt;

/// Errors produced by the paging core.
///
/// Swap exhaustion and a missing swap device are *not* represented here:
/// both are system-wide panics with no defined recovery path, so modeling
/// them as a recoverable `Result` would misstate the contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "vm errors must be handled, not silently discarded"]
pub enum VmError {
    /// A virtual address outside the user range, or null.
    InvalidAddress { addr: usize },
    /// `page_add` called with an already-present key.
    DuplicateMapping { upage: usize },
    /// `pagedir_set_page` reported the mapping already existed.
    MappingInstallFailed { upage: usize },
    /// `file_read` returned fewer bytes than `read_bytes` demanded.
    ShortRead { expected: u32, got: usize },
    /// The clock scan found every resident frame pinned, with no
    /// unpinned, evictable frame to select.
    AllFramesPinned,
    /// An operation referenced a file descriptor that was never opened,
    /// or was already closed.
    UnknownFileDescriptor { fd: u32 },
    /// An operation referenced a process id the registry has no record
    /// of, typically because the process already exited.
    UnknownProcess { pid: u64 },
}

/// Result type alias for vm subsystem operations.
pub type VmResult<T> = Result<T, VmError>;

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidAddress { addr } => write!(f, "invalid user address: 0x{:x}", addr),
            Self::DuplicateMapping { upage } => {
                write!(f, "duplicate supplemental page table entry at 0x{:x}", upage)
            }
            Self::MappingInstallFailed { upage } => {
                write!(f, "failed to install page directory mapping at 0x{:x}", upage)
            }
            Self::ShortRead { expected, got } => {
                write!(f, "short file read: expected {} bytes, got {}", expected, got)
            }
            Self::AllFramesPinned => {
                write!(f, "clock scan found no evictable frame: every resident frame is pinned")
            }
            Self::UnknownFileDescriptor { fd } => write!(f, "unknown file descriptor {}", fd),
            Self::UnknownProcess { pid } => write!(f, "unknown process id {}", pid),
        }
    }
}

/// Outcome of a syscall-layer address validation.
///
/// Source helpers called `exit(-1)` directly on failure; here validation
/// only ever returns a result, and the single place that would act on
/// `Terminate` is the syscall dispatcher (out of scope for this crate).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmFault {
    /// The process touched memory it has no business touching and must
    /// be terminated with exit status -1.
    Terminate,
}

/// Construct a `VmError` variant, unit or struct-like, without spelling
/// out the full `VmError::` path at every trigger site.
#[macro_export]
macro_rules! vm_error {
    ($variant:ident { $($field:ident : $value:expr),+ $(,)? }) => {
        $crate::error::VmError::$variant { $($field: $value),+ }
    };
    ($variant:ident) => {
        $crate::error::VmError::$variant
    };
}

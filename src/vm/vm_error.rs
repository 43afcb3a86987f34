//! VM Error Kinds
//!
//! Status taxonomy shared by every VM object operation. Callers see one of
//! these kinds; `ShouldWait` is internal to the pager retry loop and never
//! escapes a blocking operation.

use thiserror::Error;

/// Error returned by VM object operations
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// Offset/length outside the object, or nested offsets overflowed
    #[error("offset or length out of range")]
    OutOfRange,

    /// The page registry is exhausted
    #[error("out of physical pages")]
    NoMemory,

    /// Structurally disallowed operation
    #[error("operation not supported on this object")]
    NotSupported,

    /// Refused given the object's current configuration
    #[error("object is in the wrong state for this operation")]
    BadState,

    /// Object not resizable, or a pin count saturated
    #[error("resource unavailable")]
    Unavailable,

    /// Pure existence query found no page
    #[error("no page at offset")]
    NotFound,

    /// A pager request is outstanding
    #[error("page request pending")]
    ShouldWait,

    /// Misaligned or unknown argument
    #[error("invalid argument")]
    InvalidArgs,
}

/// Result alias used throughout the VM layer
pub type VmResult<T> = Result<T, VmError>;

impl VmError {
    /// Short name matching the kernel status it stands in for
    pub const fn as_str(&self) -> &'static str {
        match self {
            VmError::OutOfRange => "OUT_OF_RANGE",
            VmError::NoMemory => "NO_MEMORY",
            VmError::NotSupported => "NOT_SUPPORTED",
            VmError::BadState => "BAD_STATE",
            VmError::Unavailable => "UNAVAILABLE",
            VmError::NotFound => "NOT_FOUND",
            VmError::ShouldWait => "SHOULD_WAIT",
            VmError::InvalidArgs => "INVALID_ARGS",
        }
    }
}

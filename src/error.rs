use core::fmt;

/// Errors returned by the allocator's public operations.
///
/// Contract violations that a well-behaved caller can never trigger
/// (misaligned ranges, out-of-bounds indices) are caught by
/// `debug_assert!` instead and never reach this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A caller-supplied argument violates a documented precondition
    /// (e.g. `min_length` not a power of two, `min_length > length`,
    /// a misaligned offset, or a hint beyond the managed range).
    InvalidArgument(&'static str),
    /// The allocator has no operation in progress for this request:
    /// not enough free space remains even for a short allocation.
    Exhausted,
    /// A public operation was invoked before `init`.
    Uninitialized,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Error::Exhausted => write!(f, "allocator exhausted"),
            Error::Uninitialized => write!(f, "allocator not initialized"),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = core::result::Result<T, Error>;

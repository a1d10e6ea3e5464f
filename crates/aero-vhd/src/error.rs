use thiserror::Error;

pub type Result<T> = std::result::Result<T, VhdError>;

/// Unified error type for VHD image operations.
///
/// Range overruns are *not* errors: sector transfers clamp to the image capacity and report the
/// clamped-off tail as a truncated-sector count instead.
///
/// Note: [`VhdError::Io`] stores a human-readable `String` rather than `std::io::Error` so
/// non-`std::io` storage backends can surface their failures through the same type.
#[derive(Debug, Error)]
pub enum VhdError {
    #[error("buffer too small: len={len} required={required}")]
    BufferTooSmall { len: usize, required: usize },

    #[error("out of bounds: offset={offset} len={len} capacity={capacity}")]
    OutOfBounds {
        offset: u64,
        len: usize,
        capacity: u64,
    },

    #[error("integer overflow while computing byte offsets")]
    OffsetOverflow,

    #[error("corrupt vhd image: {0}")]
    CorruptImage(&'static str),

    #[error("unsupported vhd feature: {0}")]
    Unsupported(&'static str),

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("backend not supported: {0}")]
    NotSupported(String),

    #[error("differencing image read requires its parent chain")]
    ParentUnavailable,

    #[error("parent unique id does not match the differencing header")]
    ParentMismatch,

    #[error("unknown image id {0}")]
    UnknownImage(usize),

    /// Generic I/O failure.
    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for VhdError {
    fn from(err: std::io::Error) -> Self {
        VhdError::Io(err.to_string())
    }
}

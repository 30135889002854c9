//! Native status codes.
//!
//! [`Status`] is a `repr(i32)` mirror of the status codes the native
//! library reports through its error channel. Values are ABI-stable and
//! must match the native headers exactly.

use crate::error::InteropError;

/// Status code reported by the native library.
///
/// `Ok` = 0, all failures are negative.
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Status {
    /// Success.
    Ok = 0,
    /// Pseudo error used for back-tracing.
    BackTrace = -1,
    /// Unspecified error.
    Error = -2,
    /// Internal error.
    Internal = -3,
    /// Insufficient memory.
    NoMem = -4,
    /// Function argument is invalid.
    BadArg = -5,
    /// Unsupported function.
    BadFunc = -6,
    /// A required pointer argument was null.
    NullPtr = -27,
    /// Incorrect size of an input array or record.
    BadSize = -201,
    /// Requested object was not found.
    ObjectNotFound = -204,
    /// Formats of input arguments do not match.
    UnmatchedFormats = -205,
    /// Flag value is invalid.
    BadFlag = -206,
    /// Sizes of input arguments do not match.
    UnmatchedSizes = -209,
    /// Argument is out of range.
    OutOfRange = -211,
    /// Function or feature is not implemented.
    NotImplemented = -213,
    /// A memory block was corrupted.
    BadMemBlock = -214,
    /// An assertion failed inside the native library.
    Assert = -215,
}

impl Status {
    /// Map a raw native code onto a known status.
    ///
    /// Codes this layer does not recognise collapse to [`Status::Error`];
    /// the raw value is still preserved in [`NativeError::code`](crate::NativeError).
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Self::Ok,
            -1 => Self::BackTrace,
            -2 => Self::Error,
            -3 => Self::Internal,
            -4 => Self::NoMem,
            -5 => Self::BadArg,
            -6 => Self::BadFunc,
            -27 => Self::NullPtr,
            -201 => Self::BadSize,
            -204 => Self::ObjectNotFound,
            -205 => Self::UnmatchedFormats,
            -206 => Self::BadFlag,
            -209 => Self::UnmatchedSizes,
            -211 => Self::OutOfRange,
            -213 => Self::NotImplemented,
            -214 => Self::BadMemBlock,
            -215 => Self::Assert,
            _ => Self::Error,
        }
    }

    /// The raw `i32` value passed across the C boundary.
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Whether this status reports success.
    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }
}

impl From<&InteropError> for Status {
    fn from(e: &InteropError) -> Self {
        match e {
            InteropError::InvalidArgument { .. } | InteropError::Config(_) => Status::BadArg,
            InteropError::Disposed { .. } | InteropError::Unbound => Status::NullPtr,
            InteropError::LayoutMismatch { .. } | InteropError::UnknownLength => Status::BadSize,
            InteropError::KindMismatch { .. } => Status::BadFlag,
            InteropError::Native(native) => native.status(),
            InteropError::OutOfRange { .. } => Status::OutOfRange,
            InteropError::FreeNode { .. } | InteropError::UnknownField { .. } => {
                Status::ObjectNotFound
            }
            InteropError::FieldTypeMismatch { .. } => Status::UnmatchedFormats,
            InteropError::ElementSizeMismatch { .. } => Status::UnmatchedSizes,
            InteropError::BrokenLink { .. } => Status::BadMemBlock,
        }
    }
}

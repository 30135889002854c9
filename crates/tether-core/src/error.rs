//! Error types for the interop layer.
//!
//! Every failure the layer reports is an [`InteropError`], returned to the
//! immediate caller and never retried. Failures that originate inside the
//! native library are carried as a [`NativeError`], produced at the
//! translation boundary by [`check_address`] and [`check_status`].

use std::error::Error;
use std::fmt;
use std::ptr::NonNull;

use crate::config::ConfigError;
use crate::status::Status;

/// Convenience alias used throughout the workspace.
pub type Result<T, E = InteropError> = std::result::Result<T, E>;

/// A failure reported by the wrapped native library.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NativeError {
    /// Raw native status code (negative on failure).
    pub code: i32,
    /// Name of the native function that reported the failure.
    pub function: String,
    /// Diagnostic message from the native library.
    pub message: String,
}

impl NativeError {
    /// Create a native error from its three reported parts.
    pub fn new(code: i32, function: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            function: function.into(),
            message: message.into(),
        }
    }

    /// The code mapped onto a known [`Status`].
    pub fn status(&self) -> Status {
        Status::from_code(self.code)
    }
}

impl fmt::Display for NativeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} failed with status {} ({:?}): {}",
            self.function,
            self.code,
            self.status(),
            self.message
        )
    }
}

impl Error for NativeError {}

/// Errors surfaced by handles, views and layouts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InteropError {
    /// A null or otherwise unusable argument was supplied where a live
    /// value is required. Raised at construction, never deferred.
    InvalidArgument {
        /// What was invalid.
        what: &'static str,
    },
    /// The object was used after its disposal.
    Disposed {
        /// Kind of object that was disposed.
        object: &'static str,
    },
    /// A container view was used before it was bound to a native header.
    Unbound,
    /// A record's size disagrees with what the native library reports.
    LayoutMismatch {
        /// Record type whose size disagreed.
        record: &'static str,
        /// Size this layer expected, in bytes.
        expected: usize,
        /// Size found in native memory, in bytes.
        actual: usize,
    },
    /// A native header carries a signature for a different record kind.
    KindMismatch {
        /// Record type that was expected.
        record: &'static str,
        /// Expected signature bits.
        expected: u32,
        /// Signature bits found in native memory.
        found: u32,
    },
    /// Failure reported by the native library.
    Native(NativeError),
    /// An index fell outside the known element range.
    OutOfRange {
        /// The requested index.
        index: isize,
        /// Number of addressable elements.
        len: usize,
    },
    /// An index resolved to a slot on the allocator's free list.
    FreeNode {
        /// The requested index.
        index: isize,
    },
    /// A field name that the record layout does not define.
    UnknownField {
        /// Record type that was searched.
        record: &'static str,
        /// The unrecognised field name.
        field: String,
    },
    /// A field was accessed as the wrong primitive type.
    FieldTypeMismatch {
        /// The field that was accessed.
        field: &'static str,
        /// Primitive type declared by the layout.
        declared: &'static str,
        /// Primitive type requested by the caller.
        requested: &'static str,
    },
    /// A checked access was requested on a view whose length is unknown.
    UnknownLength,
    /// An element buffer does not match the container's element size.
    ElementSizeMismatch {
        /// Element size of the container, in bytes.
        expected: usize,
        /// Size supplied by the caller, in bytes.
        actual: usize,
    },
    /// A native link walk did not terminate where the header said it would.
    BrokenLink {
        /// Record type whose links were inconsistent.
        record: &'static str,
    },
    /// Acquisition or binding was attempted under an invalid configuration.
    Config(ConfigError),
}

impl fmt::Display for InteropError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument { what } => write!(f, "invalid argument: {what}"),
            Self::Disposed { object } => write!(f, "{object} used after dispose"),
            Self::Unbound => write!(f, "view is not bound to a native header"),
            Self::LayoutMismatch {
                record,
                expected,
                actual,
            } => write!(
                f,
                "layout mismatch for {record}: expected {expected} bytes, native reports {actual}"
            ),
            Self::KindMismatch {
                record,
                expected,
                found,
            } => write!(
                f,
                "signature mismatch for {record}: expected {expected:#010x}, found {found:#010x}"
            ),
            Self::Native(e) => write!(f, "native failure: {e}"),
            Self::OutOfRange { index, len } => {
                write!(f, "index {index} out of range for length {len}")
            }
            Self::FreeNode { index } => write!(f, "index {index} resolves to a free node"),
            Self::UnknownField { record, field } => {
                write!(f, "record {record} has no field '{field}'")
            }
            Self::FieldTypeMismatch {
                field,
                declared,
                requested,
            } => write!(
                f,
                "field '{field}' is declared {declared}, accessed as {requested}"
            ),
            Self::UnknownLength => write!(f, "checked access on a view of unknown length"),
            Self::ElementSizeMismatch { expected, actual } => write!(
                f,
                "element size mismatch: container holds {expected}-byte elements, got {actual}"
            ),
            Self::BrokenLink { record } => write!(f, "broken link chain in {record}"),
            Self::Config(e) => write!(f, "invalid configuration: {e}"),
        }
    }
}

impl Error for InteropError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Native(e) => Some(e),
            Self::Config(e) => Some(e),
            _ => None,
        }
    }
}

impl From<NativeError> for InteropError {
    fn from(e: NativeError) -> Self {
        Self::Native(e)
    }
}

impl From<ConfigError> for InteropError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

/// The native library's status/message query convention.
///
/// After a native call the binding asks the channel for a pending status.
/// Implementations must clear the pending status when it is taken so that
/// one call's failure never leaks into the next call's result.
pub trait ErrorChannel {
    /// Take the pending native failure, if any, clearing it.
    fn take_error(&self) -> Option<NativeError>;
}

/// Translate an address-returning native call into a `Result`.
///
/// A pending status on `channel` wins over the returned value. Otherwise a
/// null sentinel becomes a [`Status::NullPtr`] failure attributed to
/// `function`.
pub fn check_address<C, T>(channel: &C, function: &'static str, address: *mut T) -> Result<NonNull<T>>
where
    C: ErrorChannel + ?Sized,
{
    if let Some(err) = channel.take_error() {
        log::debug!("{function}: native status {} ({})", err.code, err.message);
        return Err(InteropError::Native(err));
    }
    NonNull::new(address).ok_or_else(|| {
        InteropError::Native(NativeError::new(
            Status::NullPtr.code(),
            function,
            "native call returned a null address",
        ))
    })
}

/// Translate an integer-returning native call into a `Result`.
///
/// Negative return codes are failures; the channel's message is attached
/// when the library queued one.
pub fn check_status<C>(channel: &C, function: &'static str, code: i32) -> Result<i32>
where
    C: ErrorChannel + ?Sized,
{
    match channel.take_error() {
        Some(err) => Err(InteropError::Native(err)),
        None if code < 0 => Err(InteropError::Native(NativeError::new(
            code,
            function,
            "native call reported failure without a message",
        ))),
        None => Ok(code),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[derive(Default)]
    struct Queue(RefCell<Option<NativeError>>);

    impl ErrorChannel for Queue {
        fn take_error(&self) -> Option<NativeError> {
            self.0.borrow_mut().take()
        }
    }

    #[test]
    fn null_sentinel_becomes_null_ptr_failure() {
        let channel = Queue::default();
        let err = check_address(&channel, "create_seq", std::ptr::null_mut::<u8>()).unwrap_err();
        match err {
            InteropError::Native(native) => {
                assert_eq!(native.status(), Status::NullPtr);
                assert_eq!(native.function, "create_seq");
            }
            other => panic!("expected native error, got {other:?}"),
        }
    }

    #[test]
    fn queued_status_wins_over_returned_address() {
        let channel = Queue::default();
        *channel.0.borrow_mut() = Some(NativeError::new(-5, "seq_push", "bad element"));
        let mut slot = 0u8;
        let err = check_address(&channel, "seq_push", &mut slot as *mut u8).unwrap_err();
        assert_eq!(
            err,
            InteropError::Native(NativeError::new(-5, "seq_push", "bad element"))
        );
        // The status was consumed.
        assert!(channel.take_error().is_none());
    }

    #[test]
    fn live_address_passes_through() {
        let channel = Queue::default();
        let mut slot = 7u32;
        let ptr = check_address(&channel, "get", &mut slot as *mut u32).unwrap();
        assert_eq!(ptr.as_ptr(), &mut slot as *mut u32);
    }

    #[test]
    fn negative_code_without_message_is_still_an_error() {
        let channel = Queue::default();
        let err = check_status(&channel, "set_remove", -211).unwrap_err();
        match err {
            InteropError::Native(native) => assert_eq!(native.status(), Status::OutOfRange),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(check_status(&channel, "set_add", 3), Ok(3));
    }

    #[test]
    fn native_error_is_the_source() {
        let err = InteropError::from(NativeError::new(-4, "alloc", "oom"));
        assert!(err.source().is_some());
        assert!(InteropError::Unbound.source().is_none());
    }

    #[test]
    fn display_mentions_function_and_message() {
        let err = NativeError::new(-211, "graph_add_edge", "vertex index is out of range");
        let text = err.to_string();
        assert!(text.contains("graph_add_edge"));
        assert!(text.contains("-211"));
        assert!(text.contains("vertex index is out of range"));
    }
}

//! Foreign handles and the disposal protocol.
//!
//! A [`ForeignHandle`] establishes the disposal contract around one
//! foreign address. Explicit [`dispose`](ForeignHandle::dispose) and the
//! implicit `Drop` path share one idempotent transition: the first of them
//! to run flips `disposed`, withdraws the pressure hint and, for owning
//! handles, calls the paired release routine. Every later request is a
//! no-op, so double release is impossible by construction.
//!
//! The drop path touches nothing but the foreign resource and the pressure
//! sink; it never reaches into other wrapper objects.

#![allow(unsafe_code)]

use std::ffi::c_void;
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::config::InteropConfig;
use crate::error::{InteropError, Result};
use crate::pressure::{self, PressureSink, PressureTicket};
use crate::release::{NoRelease, Release};

/// Which route requested disposal. Only used for diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DisposePath {
    Explicit,
    Drop,
}

impl fmt::Display for DisposePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Explicit => write!(f, "explicit"),
            Self::Drop => write!(f, "drop"),
        }
    }
}

/// One foreign address plus its ownership and disposal state.
///
/// `R` is the release routine paired with the acquisition call. Handles
/// that merely observe an address use [`NoRelease`] and never call into the
/// native library on disposal.
///
/// Not `Send`/`Sync`: concurrent use requires external synchronisation.
pub struct ForeignHandle<R: Release = NoRelease> {
    address: *mut c_void,
    /// `Some` only while an owning handle has not been disposed.
    release: Option<R>,
    owns: bool,
    disposed: bool,
    byte_size: Option<usize>,
    pressure: Option<PressureTicket>,
}

impl<R: Release> ForeignHandle<R> {
    /// Take ownership of `address`; `release` runs exactly once on disposal.
    ///
    /// Returns [`InteropError::InvalidArgument`] for a null address.
    ///
    /// # Safety
    ///
    /// `address` must be a live allocation returned by the native call that
    /// `release` is paired with, and must stay valid until disposal.
    pub unsafe fn acquire(address: *mut c_void, release: R) -> Result<Self> {
        // SAFETY: forwarded caller contract.
        unsafe { HandleBuilder::new(address).owned(release) }
    }

    /// A handle around an address that was never valid.
    ///
    /// [`is_valid`](Self::is_valid) is `false`, [`address`](Self::address)
    /// fails with [`InteropError::Unbound`], and disposal is a no-op.
    pub fn detached() -> Self {
        Self {
            address: std::ptr::null_mut(),
            release: None,
            owns: false,
            disposed: false,
            byte_size: None,
            pressure: None,
        }
    }

    /// The live address, checked against disposal.
    pub fn address(&self) -> Result<NonNull<c_void>> {
        if self.disposed {
            return Err(InteropError::Disposed { object: "handle" });
        }
        NonNull::new(self.address).ok_or(InteropError::Unbound)
    }

    /// The stored address without any checks. Never dereference it.
    pub fn raw_address(&self) -> *mut c_void {
        self.address
    }

    /// Whether disposal will call the release routine.
    pub fn owns(&self) -> bool {
        self.owns
    }

    /// `true` while the handle wraps a live address.
    pub fn is_valid(&self) -> bool {
        !self.disposed && !self.address.is_null()
    }

    /// `true` once disposal has run.
    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Byte size of the foreign object, when the acquisition reported one.
    pub fn byte_size(&self) -> Option<usize> {
        self.byte_size
    }

    /// Bytes this handle currently contributes to its pressure sink.
    pub fn pressure_bytes(&self) -> usize {
        self.pressure.as_ref().map_or(0, PressureTicket::bytes)
    }

    /// Dispose the handle. Returns `true` if this call ran the release
    /// routine; `false` when already disposed, never valid, or borrowed.
    pub fn dispose(&mut self) -> bool {
        self.dispose_once(DisposePath::Explicit)
    }

    /// Give up ownership without releasing, returning the raw address.
    ///
    /// The handle becomes disposed and its pressure hint is withdrawn; the
    /// caller is now responsible for the paired release call.
    pub fn into_raw(mut self) -> *mut c_void {
        let address = self.address;
        self.release = None;
        self.dispose_once(DisposePath::Explicit);
        address
    }

    fn dispose_once(&mut self, path: DisposePath) -> bool {
        if std::mem::replace(&mut self.disposed, true) {
            return false;
        }
        if let Some(ticket) = self.pressure.take() {
            ticket.withdraw();
        }
        let Some(mut release) = self.release.take() else {
            log::trace!("disposing borrowed handle {:p} ({path})", self.address);
            return false;
        };
        let Some(address) = NonNull::new(self.address) else {
            log::warn!("owning handle has no address to release ({path})");
            return false;
        };
        log::debug!("releasing foreign address {address:p} ({path})");
        // SAFETY: the release routine was taken out of `self`, so this runs
        // at most once, and the acquisition contract guarantees `address`
        // is live until now.
        unsafe { release.release(address) };
        true
    }
}

impl ForeignHandle<NoRelease> {
    /// Observe `address` without taking ownership.
    ///
    /// # Safety
    ///
    /// `address` must stay valid for as long as the handle or any view
    /// derived from it is used.
    pub unsafe fn wrap(address: *mut c_void) -> Result<Self> {
        // SAFETY: forwarded caller contract.
        unsafe { HandleBuilder::new(address).borrowed() }
    }
}

impl<R: Release> Drop for ForeignHandle<R> {
    fn drop(&mut self) {
        self.dispose_once(DisposePath::Drop);
    }
}

impl<R: Release> fmt::Debug for ForeignHandle<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForeignHandle")
            .field("address", &self.address)
            .field("owns", &self.owns)
            .field("disposed", &self.disposed)
            .field("byte_size", &self.byte_size)
            .finish()
    }
}

/// Step-by-step acquisition of a [`ForeignHandle`].
///
/// ```
/// use std::sync::Arc;
/// use tether_core::{HandleBuilder, MemoryPressure};
///
/// let sink = Arc::new(MemoryPressure::new(usize::MAX));
/// let mut storage = [0u8; 1024];
/// let handle = unsafe {
///     HandleBuilder::new(storage.as_mut_ptr().cast())
///         .byte_size(storage.len())
///         .sink(sink.clone())
///         .borrowed()
///         .unwrap()
/// };
/// assert_eq!(handle.byte_size(), Some(1024));
/// // Borrowed handles do not count against the sink.
/// assert_eq!(sink.outstanding(), 0);
/// ```
pub struct HandleBuilder {
    address: *mut c_void,
    byte_size: Option<usize>,
    sink: Option<Arc<dyn PressureSink>>,
    config: InteropConfig,
}

impl HandleBuilder {
    /// Start building a handle around `address`.
    pub fn new(address: *mut c_void) -> Self {
        Self {
            address,
            byte_size: None,
            sink: None,
            config: InteropConfig::new(),
        }
    }

    /// Size of the foreign object in bytes, as reported by the native side.
    pub fn byte_size(mut self, bytes: usize) -> Self {
        self.byte_size = Some(bytes);
        self
    }

    /// Pressure sink to notify instead of the process-wide counter.
    pub fn sink(mut self, sink: Arc<dyn PressureSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Configuration to acquire under.
    pub fn config(mut self, config: InteropConfig) -> Self {
        self.config = config;
        self
    }

    /// Finish as an owning handle paired with `release`.
    ///
    /// Notifies the pressure sink once with the byte size, when one was
    /// given and hints are enabled. Fails on a null address or an invalid
    /// config, in which case `release` is not run and the caller keeps
    /// ownership of `address`.
    ///
    /// # Safety
    ///
    /// Same contract as [`ForeignHandle::acquire`].
    pub unsafe fn owned<R: Release>(self, release: R) -> Result<ForeignHandle<R>> {
        if self.address.is_null() {
            return Err(InteropError::InvalidArgument { what: "null address" });
        }
        self.config.validate()?;
        let pressure = match self.byte_size {
            Some(bytes) if bytes > 0 && self.config.pressure_hints => {
                let sink = self.sink.unwrap_or_else(|| {
                    let global = pressure::global();
                    global.set_log_threshold(self.config.pressure_log_threshold);
                    global as Arc<dyn PressureSink>
                });
                Some(PressureTicket::issue(bytes, sink))
            }
            _ => None,
        };
        log::debug!(
            "acquired foreign address {:p} ({} bytes, owning)",
            self.address,
            self.byte_size.unwrap_or(0)
        );
        Ok(ForeignHandle {
            address: self.address,
            release: Some(release),
            owns: true,
            disposed: false,
            byte_size: self.byte_size,
            pressure,
        })
    }

    /// Finish as a non-owning handle. No pressure is attributed to it.
    ///
    /// # Safety
    ///
    /// Same contract as [`ForeignHandle::wrap`].
    pub unsafe fn borrowed(self) -> Result<ForeignHandle<NoRelease>> {
        if self.address.is_null() {
            return Err(InteropError::InvalidArgument { what: "null address" });
        }
        self.config.validate()?;
        log::trace!("wrapped foreign address {:p} (borrowed)", self.address);
        Ok(ForeignHandle {
            address: self.address,
            release: None,
            owns: false,
            disposed: false,
            byte_size: self.byte_size,
            pressure: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigError;
    use crate::pressure::MemoryPressure;
    use std::cell::Cell;
    use std::rc::Rc;

    fn counting_release(count: &Rc<Cell<usize>>) -> impl FnMut(NonNull<c_void>) {
        let count = count.clone();
        move |_| count.set(count.get() + 1)
    }

    fn some_address(slot: &mut [u8]) -> *mut c_void {
        slot.as_mut_ptr().cast()
    }

    #[test]
    fn dispose_twice_releases_once() {
        let mut slot = [0u8; 1024];
        let count = Rc::new(Cell::new(0));
        let sink = Arc::new(MemoryPressure::new(usize::MAX));
        let mut handle = unsafe {
            HandleBuilder::new(some_address(&mut slot))
                .byte_size(1024)
                .sink(sink.clone())
                .owned(counting_release(&count))
                .unwrap()
        };
        assert_eq!(sink.outstanding(), 1024);
        assert!(handle.dispose());
        assert!(!handle.dispose());
        assert_eq!(count.get(), 1);
        assert_eq!(sink.outstanding(), 0);
        drop(handle);
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn drop_releases_owning_handle() {
        let mut slot = [0u8; 8];
        let count = Rc::new(Cell::new(0));
        {
            let _handle = unsafe {
                ForeignHandle::acquire(some_address(&mut slot), counting_release(&count)).unwrap()
            };
        }
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn borrowed_handle_never_releases() {
        let mut slot = [0u8; 8];
        let mut handle = unsafe { ForeignHandle::wrap(some_address(&mut slot)).unwrap() };
        assert!(!handle.owns());
        assert!(!handle.dispose());
        assert!(handle.is_disposed());
    }

    #[test]
    fn null_address_is_rejected_at_acquisition() {
        let err = unsafe { ForeignHandle::wrap(std::ptr::null_mut()) }.unwrap_err();
        assert_eq!(err, InteropError::InvalidArgument { what: "null address" });
    }

    #[test]
    fn detached_handle_disposes_as_noop() {
        let mut handle: ForeignHandle = ForeignHandle::detached();
        assert!(!handle.is_valid());
        assert_eq!(handle.address(), Err(InteropError::Unbound));
        assert!(!handle.dispose());
    }

    #[test]
    fn address_fails_after_dispose() {
        let mut slot = [0u8; 8];
        let mut handle = unsafe { ForeignHandle::wrap(some_address(&mut slot)).unwrap() };
        assert!(handle.address().is_ok());
        handle.dispose();
        assert!(!handle.is_valid());
        assert_eq!(
            handle.address(),
            Err(InteropError::Disposed { object: "handle" })
        );
    }

    #[test]
    fn into_raw_skips_release() {
        let mut slot = [0u8; 8];
        let count = Rc::new(Cell::new(0));
        let addr = some_address(&mut slot);
        let handle = unsafe { ForeignHandle::acquire(addr, counting_release(&count)).unwrap() };
        assert_eq!(handle.into_raw(), addr);
        assert_eq!(count.get(), 0);
    }

    #[test]
    fn hints_disabled_skip_the_sink() {
        let mut slot = [0u8; 64];
        let sink = Arc::new(MemoryPressure::new(usize::MAX));
        let config = InteropConfig {
            pressure_hints: false,
            ..InteropConfig::new()
        };
        let handle = unsafe {
            HandleBuilder::new(some_address(&mut slot))
                .byte_size(64)
                .sink(sink.clone())
                .config(config)
                .owned(NoRelease)
                .unwrap()
        };
        assert_eq!(handle.pressure_bytes(), 0);
        assert_eq!(sink.notifications(), 0);
    }

    #[test]
    fn invalid_config_is_rejected_before_anything_is_attributed() {
        let mut slot = [0u8; 64];
        let count = Rc::new(Cell::new(0));
        let sink = Arc::new(MemoryPressure::new(usize::MAX));
        let config = InteropConfig {
            max_block_walk: 0,
            ..InteropConfig::new()
        };
        let err = unsafe {
            HandleBuilder::new(some_address(&mut slot))
                .byte_size(64)
                .sink(sink.clone())
                .config(config)
                .owned(counting_release(&count))
        }
        .unwrap_err();
        assert_eq!(err, InteropError::Config(ConfigError::ZeroBlockWalk));
        assert_eq!(count.get(), 0);
        assert_eq!(sink.notifications(), 0);

        let err = unsafe {
            HandleBuilder::new(some_address(&mut slot))
                .config(InteropConfig {
                    pressure_log_threshold: 0,
                    ..InteropConfig::new()
                })
                .borrowed()
        }
        .unwrap_err();
        assert_eq!(err, InteropError::Config(ConfigError::ZeroPressureThreshold));
    }

    #[test]
    fn global_sink_takes_the_configured_threshold() {
        let mut slot = [0u8; 32];
        let config = InteropConfig {
            pressure_log_threshold: 12_345,
            ..InteropConfig::new()
        };
        let mut handle = unsafe {
            HandleBuilder::new(some_address(&mut slot))
                .byte_size(32)
                .config(config)
                .owned(NoRelease)
                .unwrap()
        };
        assert_eq!(pressure::global().log_threshold(), 12_345);
        assert_eq!(handle.pressure_bytes(), 32);
        handle.dispose();
    }

    #[cfg(not(miri))]
    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn any_number_of_disposals_releases_once(n in 1usize..16, owns in any::<bool>()) {
                let mut slot = [0u8; 16];
                let count = Rc::new(Cell::new(0));
                let addr = some_address(&mut slot);
                if owns {
                    let mut handle = unsafe {
                        ForeignHandle::acquire(addr, counting_release(&count)).unwrap()
                    };
                    for _ in 0..n {
                        handle.dispose();
                    }
                    drop(handle);
                    prop_assert_eq!(count.get(), 1);
                } else {
                    let mut handle = unsafe { ForeignHandle::wrap(addr).unwrap() };
                    for _ in 0..n {
                        prop_assert!(!handle.dispose());
                    }
                    prop_assert_eq!(count.get(), 0);
                }
            }
        }
    }
}

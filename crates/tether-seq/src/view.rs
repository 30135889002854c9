//! The binding every container view is built on.
//!
//! A [`Binding`] pairs the header handle with the view's lifecycle state:
//!
//! ```text
//! Uninitialized ──bind──► Bound ──iter──► Enumerating
//!                           ▲                  │
//!                           └──last iter drop──┘
//!        any state ──release──► Released (terminal)
//! ```
//!
//! Every accessor goes through [`Binding::header`], which is where
//! use-before-bind and use-after-release are rejected.

#![allow(unsafe_code)]

use std::cell::Cell;
use std::ffi::c_void;
use std::fmt;
use std::ptr::NonNull;

use tether_core::{ForeignHandle, InteropConfig, InteropError, Release, Result};
use tether_layout::catalog::{self, MAGIC_MASK};
use tether_layout::{RawRecord, RecordLayout};

/// Lifecycle state of a container view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ViewState {
    /// Created without a header; every operation fails with
    /// [`InteropError::Unbound`].
    Uninitialized,
    /// Bound to a live header.
    Bound,
    /// At least one enumerator is alive.
    Enumerating,
    /// Released; every operation fails with [`InteropError::Disposed`].
    Released,
}

impl fmt::Display for ViewState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Bound => write!(f, "bound"),
            Self::Enumerating => write!(f, "enumerating"),
            Self::Released => write!(f, "released"),
        }
    }
}

/// What a bound header must look like.
#[derive(Clone, Copy, Debug)]
pub(crate) struct HeaderCheck {
    pub(crate) layout: &'static RecordLayout,
    /// Field holding the signature word.
    pub(crate) flags_field: &'static str,
    pub(crate) magic: u32,
    /// Extra flag bits that must be set (graph kind).
    pub(crate) required_bits: u32,
}

pub(crate) struct Binding<R: Release> {
    object: &'static str,
    handle: ForeignHandle<R>,
    config: InteropConfig,
    check: HeaderCheck,
    state: Cell<ViewState>,
    enumerators: Cell<u32>,
}

impl<R: Release> Binding<R> {
    pub(crate) fn unbound(object: &'static str, check: HeaderCheck, config: InteropConfig) -> Self {
        Self {
            object,
            handle: ForeignHandle::detached(),
            config,
            check,
            state: Cell::new(ViewState::Uninitialized),
            enumerators: Cell::new(0),
        }
    }

    /// Bind to the header `handle` points at.
    ///
    /// # Safety
    ///
    /// `handle`'s address must be a live header of `check.layout` for as
    /// long as the binding is used.
    pub(crate) unsafe fn bind(&mut self, handle: ForeignHandle<R>) -> Result<()> {
        match self.state.get() {
            ViewState::Uninitialized => {}
            ViewState::Released => return Err(InteropError::Disposed { object: self.object }),
            _ => {
                return Err(InteropError::InvalidArgument {
                    what: "view is already bound",
                })
            }
        }
        self.config.validate()?;
        let address = handle.address()?;
        if self.config.validate_layouts {
            // SAFETY: caller contract.
            let header = unsafe { RawRecord::new(address, self.check.layout) };
            self.validate(&header)?;
        }
        log::debug!("bound {} view to {address:p}", self.object);
        self.handle = handle;
        self.state.set(ViewState::Bound);
        Ok(())
    }

    fn validate(&self, header: &RawRecord<'_>) -> Result<()> {
        let check = self.check;
        let flags = header.read::<i32>(check.flags_field)? as u32;
        if flags & MAGIC_MASK != check.magic || flags & check.required_bits != check.required_bits {
            log::warn!(
                "{} header carries signature {flags:#010x}, expected {:#010x}",
                self.object,
                check.magic | check.required_bits
            );
            return Err(InteropError::KindMismatch {
                record: check.layout.name(),
                expected: check.magic | check.required_bits,
                found: flags,
            });
        }
        if check.layout.field("header_size").is_ok() {
            let reported = header.read::<i32>("header_size")?;
            if reported < 0 || (reported as usize) < check.layout.header_size() {
                log::warn!(
                    "{} header reports {reported} bytes, layout needs {}",
                    self.object,
                    check.layout.header_size()
                );
                return Err(InteropError::LayoutMismatch {
                    record: check.layout.name(),
                    expected: check.layout.header_size(),
                    actual: reported.max(0) as usize,
                });
            }
        }
        if check.layout.field("elem_size").is_ok() && header.read::<i32>("elem_size")? <= 0 {
            return Err(InteropError::LayoutMismatch {
                record: check.layout.name(),
                expected: 1,
                actual: 0,
            });
        }
        Ok(())
    }

    pub(crate) fn state(&self) -> ViewState {
        self.state.get()
    }

    pub(crate) fn config(&self) -> &InteropConfig {
        &self.config
    }

    pub(crate) fn handle(&self) -> &ForeignHandle<R> {
        &self.handle
    }

    /// The live header address, or the state's error.
    pub(crate) fn address(&self) -> Result<NonNull<c_void>> {
        match self.state.get() {
            ViewState::Uninitialized => Err(InteropError::Unbound),
            ViewState::Released => Err(InteropError::Disposed { object: self.object }),
            ViewState::Bound | ViewState::Enumerating => self.handle.address(),
        }
    }

    /// The header overlaid with `layout`.
    pub(crate) fn header(&self) -> Result<RawRecord<'_>> {
        self.header_as(self.check.layout)
    }

    /// The header overlaid with a prefix layout (a graph read as a set).
    pub(crate) fn header_as<'a>(&'a self, layout: &'a RecordLayout) -> Result<RawRecord<'a>> {
        let address = self.address()?;
        // SAFETY: a bound header is live (bind contract) and the prefix
        // layouts are never larger than the bound record.
        Ok(unsafe { RawRecord::new(address, layout) })
    }

    /// Register an enumerator; the returned token restores the state when
    /// dropped.
    pub(crate) fn enter_enumeration(&self) -> Result<EnumerationToken<'_>> {
        self.address()?;
        self.enumerators.set(self.enumerators.get() + 1);
        self.state.set(ViewState::Enumerating);
        Ok(EnumerationToken {
            state: &self.state,
            enumerators: &self.enumerators,
        })
    }

    /// Transition to `Released` and dispose the header handle. Returns
    /// `true` only for the call that made the transition.
    pub(crate) fn release(&mut self) -> bool {
        if self.state.replace(ViewState::Released) == ViewState::Released {
            return false;
        }
        let released = self.handle.dispose();
        log::debug!("released {} view (native release: {released})", self.object);
        true
    }
}

impl<R: Release> fmt::Debug for Binding<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("object", &self.object)
            .field("state", &self.state.get())
            .field("handle", &self.handle)
            .finish()
    }
}

/// Held by every live iterator.
pub(crate) struct EnumerationToken<'a> {
    state: &'a Cell<ViewState>,
    enumerators: &'a Cell<u32>,
}

impl Drop for EnumerationToken<'_> {
    fn drop(&mut self) {
        let left = self.enumerators.get().saturating_sub(1);
        self.enumerators.set(left);
        if left == 0 && self.state.get() == ViewState::Enumerating {
            self.state.set(ViewState::Bound);
        }
    }
}

pub(crate) fn seq_check() -> HeaderCheck {
    HeaderCheck {
        layout: catalog::seq(),
        flags_field: "flags",
        magic: catalog::SEQ_MAGIC,
        required_bits: 0,
    }
}

pub(crate) fn set_check() -> HeaderCheck {
    HeaderCheck {
        layout: catalog::set(),
        flags_field: "flags",
        magic: catalog::SET_MAGIC,
        required_bits: 0,
    }
}

pub(crate) fn graph_check() -> HeaderCheck {
    HeaderCheck {
        layout: catalog::graph(),
        flags_field: "flags",
        magic: catalog::SET_MAGIC,
        required_bits: catalog::KIND_GRAPH,
    }
}

pub(crate) fn sparse_check() -> HeaderCheck {
    HeaderCheck {
        layout: catalog::sparse(),
        flags_field: "type",
        magic: catalog::SPARSE_MAGIC,
        required_bits: 0,
    }
}

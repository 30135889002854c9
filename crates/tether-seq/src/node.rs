//! Borrowed references to native container elements.

#![allow(unsafe_code)]

use std::ffi::c_void;
use std::fmt;
use std::marker::PhantomData;
use std::mem::size_of;
use std::ptr::NonNull;

use bytemuck::Pod;
use tether_core::{InteropError, Result};
use tether_layout::{catalog, raw, RawRecord, RecordLayout};

/// One element of a native container.
///
/// Back-reference only: the node never owns its memory, and it borrows the
/// view it came from, so it cannot outlive the container or survive a
/// mutation through that view.
#[derive(Clone, Copy)]
pub struct NodeRef<'v> {
    address: NonNull<u8>,
    index: usize,
    size: usize,
    _view: PhantomData<&'v ()>,
}

impl<'v> NodeRef<'v> {
    /// # Safety
    ///
    /// `address .. address + size` must be a live element for `'v`.
    pub(crate) unsafe fn new(address: NonNull<u8>, index: usize, size: usize) -> Self {
        Self {
            address,
            index,
            size,
            _view: PhantomData,
        }
    }

    /// Element address.
    pub fn address(&self) -> NonNull<c_void> {
        self.address.cast()
    }

    /// Position the element was resolved at.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Element size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    fn fits(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            end => Err(InteropError::ElementSizeMismatch {
                expected: self.size,
                actual: end.unwrap_or(usize::MAX),
            }),
        }
    }

    /// Read the whole element as `T`; `T` must be exactly the element size.
    pub fn read<T: Pod>(&self) -> Result<T> {
        if size_of::<T>() != self.size {
            return Err(InteropError::ElementSizeMismatch {
                expected: self.size,
                actual: size_of::<T>(),
            });
        }
        // SAFETY: the element holds exactly `size_of::<T>()` bytes.
        Ok(unsafe { raw::load(self.address, 0) })
    }

    /// Overwrite the whole element with `value`.
    pub fn write<T: Pod>(&self, value: T) -> Result<()> {
        if size_of::<T>() != self.size {
            return Err(InteropError::ElementSizeMismatch {
                expected: self.size,
                actual: size_of::<T>(),
            });
        }
        // SAFETY: as for `read`.
        unsafe { raw::store(self.address, 0, value) };
        Ok(())
    }

    /// Read a `T` at `offset` bytes into the element.
    pub fn read_at<T: Pod>(&self, offset: usize) -> Result<T> {
        self.fits(offset, size_of::<T>())?;
        // SAFETY: bounds checked above.
        Ok(unsafe { raw::load(self.address, offset) })
    }

    /// Write a `T` at `offset` bytes into the element.
    pub fn write_at<T: Pod>(&self, offset: usize, value: T) -> Result<()> {
        self.fits(offset, size_of::<T>())?;
        // SAFETY: bounds checked above.
        unsafe { raw::store(self.address, offset, value) };
        Ok(())
    }

    /// Copy `dst.len()` bytes starting `offset` bytes into the element.
    pub fn copy_to(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        self.fits(offset, dst.len())?;
        // SAFETY: bounds checked above; `dst` is Rust-owned.
        unsafe { raw::read_bytes(raw::offset(self.address, offset), dst) };
        Ok(())
    }

    /// Copy of the element's bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.size];
        // SAFETY: the element holds `size` bytes.
        unsafe { raw::read_bytes(self.address, &mut out) };
        out
    }

    /// The element overlaid with a record layout no larger than it.
    pub fn record(&self, layout: &'v RecordLayout) -> Result<RawRecord<'v>> {
        if layout.header_size() > self.size {
            return Err(InteropError::LayoutMismatch {
                record: layout.name(),
                expected: layout.header_size(),
                actual: self.size,
            });
        }
        // SAFETY: the element covers the whole record.
        Ok(unsafe { RawRecord::new(self.address.cast(), layout) })
    }

    /// Whether the element's flag word marks a free set slot.
    pub fn is_free(&self) -> Result<bool> {
        let flags: i32 = self.read_at(0)?;
        Ok(!catalog::is_active(flags))
    }

    /// The set flag word of the element.
    pub fn flags(&self) -> Result<i32> {
        self.read_at(0)
    }
}

impl PartialEq for NodeRef<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for NodeRef<'_> {}

impl fmt::Debug for NodeRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeRef")
            .field("address", &self.address)
            .field("index", &self.index)
            .field("size", &self.size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(slot: &mut [u64; 2]) -> NodeRef<'_> {
        let address = NonNull::from(slot).cast();
        // SAFETY: `slot` is 16 live bytes for the borrow.
        unsafe { NodeRef::new(address, 0, 16) }
    }

    #[test]
    fn offsets_inside_the_element_are_accessible() {
        let mut slot = [0u64; 2];
        let n = node(&mut slot);
        n.write_at(8, 7u64).unwrap();
        assert_eq!(n.read_at::<u64>(8).unwrap(), 7);
        assert_eq!(
            n.read_at::<u64>(9).unwrap_err(),
            InteropError::ElementSizeMismatch {
                expected: 16,
                actual: 17
            }
        );
    }

    #[test]
    fn offsets_near_the_address_limit_are_refused() {
        let mut slot = [0u64; 2];
        let n = node(&mut slot);
        assert_eq!(
            n.read_at::<u32>(usize::MAX - 1).unwrap_err(),
            InteropError::ElementSizeMismatch {
                expected: 16,
                actual: usize::MAX
            }
        );
        let mut buf = [0u8; 4];
        assert!(n.copy_to(usize::MAX, &mut buf).is_err());
    }
}

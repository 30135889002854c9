//! Two-dimensional typed view through a row-pointer table.
//!
//! Native 2D data is addressed as `T**`: an array of row pointers, each
//! pointing at one row of elements. Rows need not be contiguous.

#![allow(unsafe_code)]

use std::ffi::c_void;
use std::fmt;
use std::marker::PhantomData;
use std::mem::size_of;
use std::ptr::NonNull;

use bytemuck::Pod;
use smallvec::SmallVec;
use tether_core::{InteropError, Result, TypedView};
use tether_layout::raw;

use crate::array::ArrayPtr;

/// An owned table of row pointers, laid out as the native `T**` expects.
///
/// Not `Clone`: a view borrows its table mutably, and a copy would let two
/// views reach the same rows.
pub struct RowTable {
    rows: SmallVec<[*mut c_void; 8]>,
}

impl RowTable {
    /// Build a table over `rows` rows starting at `base`, each
    /// `row_stride` bytes after the previous.
    ///
    /// # Safety
    ///
    /// Every computed row address must lie inside the allocation at `base`.
    pub unsafe fn from_strided(base: *mut c_void, rows: usize, row_stride: usize) -> Result<Self> {
        let base = NonNull::new(base.cast::<u8>())
            .ok_or(InteropError::InvalidArgument { what: "null address" })?;
        let rows = (0..rows)
            // SAFETY: in-bounds per caller contract.
            .map(|r| unsafe { raw::offset(base, r * row_stride) }.as_ptr().cast::<c_void>())
            .collect();
        Ok(Self { rows })
    }

    /// Build a table from individually allocated rows.
    ///
    /// # Safety
    ///
    /// Every row must be a live allocation, valid for as long as any view
    /// over this table is used.
    pub unsafe fn from_rows(rows: impl IntoIterator<Item = *mut c_void>) -> Result<Self> {
        let rows: SmallVec<[*mut c_void; 8]> = rows.into_iter().collect();
        if rows.iter().any(|r| r.is_null()) {
            return Err(InteropError::InvalidArgument { what: "null row pointer" });
        }
        Ok(Self { rows })
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the table has no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Address of the table itself, for native calls that take `T**`.
    pub fn as_ptr(&self) -> *const *mut c_void {
        self.rows.as_ptr()
    }
}

impl fmt::Debug for RowTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.rows.iter()).finish()
    }
}

/// A row-pointer table read as a 2D array of `T`.
///
/// `get(r, c)` loads row pointer `r` from the table, then element `c` of
/// that row.
pub struct ArrayPtr2D<'a, T> {
    table: NonNull<u8>,
    rows: Option<usize>,
    cols: Option<usize>,
    _borrow: PhantomData<(&'a (), *mut T)>,
}

impl<'a, T: Pod> ArrayPtr2D<'a, T> {
    /// View the rows of `table`, each `cols` elements wide when known.
    ///
    /// The table stays mutably borrowed for `'a`, so no other view over
    /// its rows can exist meanwhile.
    pub fn from_table(table: &'a mut RowTable, cols: Option<usize>) -> Self {
        Self {
            // A `SmallVec` never hands out a null data pointer.
            table: NonNull::from(&table.rows[..]).cast(),
            rows: Some(table.len()),
            cols,
            _borrow: PhantomData,
        }
    }

    /// View a native row-pointer table.
    ///
    /// # Safety
    ///
    /// `table` must hold at least `rows` valid row pointers (when given),
    /// each pointing at at least `cols` elements (when given), for `'a`.
    pub unsafe fn from_raw(
        table: *mut *mut c_void,
        rows: Option<usize>,
        cols: Option<usize>,
    ) -> Result<Self> {
        let table = NonNull::new(table.cast::<u8>())
            .ok_or(InteropError::InvalidArgument { what: "null address" })?;
        Ok(Self {
            table,
            rows,
            cols,
            _borrow: PhantomData,
        })
    }

    /// Row and column counts, where known.
    pub fn shape(&self) -> (Option<usize>, Option<usize>) {
        (self.rows, self.cols)
    }

    unsafe fn row_base(&self, r: usize) -> NonNull<u8> {
        // SAFETY: row `r` is in the table (caller contract).
        let row = unsafe { raw::load_ptr(self.table, r * size_of::<*mut c_void>()) };
        // SAFETY: table entries are non-null (constructor contracts).
        unsafe { NonNull::new_unchecked(row.cast()) }
    }

    /// Read element `(r, c)` without bounds checks.
    ///
    /// # Safety
    ///
    /// Row `r` must exist and have at least `c + 1` elements.
    pub unsafe fn get(&self, r: usize, c: usize) -> T {
        // SAFETY: caller contract.
        unsafe { raw::load(self.row_base(r), c * size_of::<T>()) }
    }

    /// Write element `(r, c)` without bounds checks.
    ///
    /// # Safety
    ///
    /// As for [`get`](Self::get).
    pub unsafe fn set(&self, r: usize, c: usize, value: T) {
        // SAFETY: caller contract.
        unsafe { raw::store(self.row_base(r), c * size_of::<T>(), value) }
    }

    fn check(&self, r: usize, c: usize) -> Result<()> {
        let (Some(rows), Some(cols)) = (self.rows, self.cols) else {
            return Err(InteropError::UnknownLength);
        };
        if r >= rows {
            return Err(InteropError::OutOfRange {
                index: r as isize,
                len: rows,
            });
        }
        if c >= cols {
            return Err(InteropError::OutOfRange {
                index: c as isize,
                len: cols,
            });
        }
        Ok(())
    }

    /// Bounds-checked read.
    pub fn get_checked(&self, r: usize, c: usize) -> Result<T> {
        self.check(r, c)?;
        // SAFETY: both indices are inside the known shape.
        Ok(unsafe { self.get(r, c) })
    }

    /// Bounds-checked write.
    pub fn set_checked(&mut self, r: usize, c: usize, value: T) -> Result<()> {
        self.check(r, c)?;
        // SAFETY: both indices are inside the known shape.
        unsafe { self.set(r, c, value) };
        Ok(())
    }

    /// Row `r` as a 1D view, `cols` elements long when known.
    ///
    /// Borrows `self` mutably: the row view can write, and while it lives
    /// neither this view nor another row view can touch the same elements.
    pub fn row(&mut self, r: usize) -> Result<ArrayPtr<'_, T>> {
        let rows = self.rows.ok_or(InteropError::UnknownLength)?;
        if r >= rows {
            return Err(InteropError::OutOfRange {
                index: r as isize,
                len: rows,
            });
        }
        // SAFETY: `r < rows`, the row holds `cols` elements, and the
        // exclusive borrow of `self` keeps every other writer away.
        unsafe { ArrayPtr::from_raw(self.row_base(r).as_ptr().cast(), self.cols) }
    }
}

impl<T: Pod> TypedView for ArrayPtr2D<'_, T> {
    type Elem = T;

    fn known_len(&self) -> Option<usize> {
        Some(self.rows? * self.cols?)
    }
}

impl<T> fmt::Debug for ArrayPtr2D<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArrayPtr2D")
            .field("table", &self.table)
            .field("rows", &self.rows)
            .field("cols", &self.cols)
            .finish()
    }
}

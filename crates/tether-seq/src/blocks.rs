//! Index resolution through a sequence's block directory.
//!
//! Elements live in blocks of varying size linked into a ring through
//! `prev`/`next`. Nothing about how the native allocator sizes blocks is
//! assumed here: both lookup and enumeration use only each block's
//! recorded `count` and `data`, plus the header's `total` and `first`.

#![allow(unsafe_code)]

use std::ptr::NonNull;

use smallvec::SmallVec;
use tether_core::{InteropError, Result};
use tether_layout::{catalog, raw, RawRecord};

/// One block of a sequence, as recorded in native memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockInfo {
    /// Index of the block's first element, as recorded by the allocator.
    pub start_index: i32,
    /// Elements stored in the block.
    pub count: usize,
    /// Address of the block's first element.
    pub data: NonNull<u8>,
}

/// The sequence fields a walk needs, read once.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SeqHeader {
    pub(crate) total: usize,
    pub(crate) elem_size: usize,
    pub(crate) first: Option<NonNull<u8>>,
}

impl SeqHeader {
    pub(crate) fn read(header: &RawRecord<'_>) -> Result<Self> {
        let total = header.read::<i32>("total")?;
        let elem_size = header.read::<i32>("elem_size")?;
        let (Ok(total), Ok(elem_size)) = (usize::try_from(total), usize::try_from(elem_size))
        else {
            return Err(InteropError::BrokenLink { record: "Seq" });
        };
        let first = NonNull::new(header.read_ptr("first")?.cast::<u8>());
        if first.is_none() && total != 0 {
            return Err(InteropError::BrokenLink { record: "Seq" });
        }
        Ok(Self {
            total,
            elem_size,
            first,
        })
    }

    /// Normalise a possibly negative index against `total`.
    pub(crate) fn normalize(&self, index: isize) -> Result<usize> {
        let len = self.total;
        let resolved = if index < 0 {
            index + len as isize
        } else {
            index
        };
        if resolved < 0 || resolved as usize >= len {
            return Err(InteropError::OutOfRange { index, len });
        }
        Ok(resolved as usize)
    }
}

fn block(address: NonNull<u8>) -> RawRecord<'static> {
    // SAFETY: block addresses come from a bound header's ring, and the
    // sequence outlives every walk over it (view borrow).
    unsafe { RawRecord::new(address.cast(), catalog::seq_block()) }
}

fn link(record: &RawRecord<'_>, field: &str) -> Result<NonNull<u8>> {
    NonNull::new(record.read_ptr(field)?.cast::<u8>())
        .ok_or(InteropError::BrokenLink { record: "SeqBlock" })
}

fn count_of(record: &RawRecord<'_>) -> Result<usize> {
    usize::try_from(record.read::<i32>("count")?)
        .map_err(|_| InteropError::BrokenLink { record: "SeqBlock" })
}

/// Address of element `index` (already normalised, `< total`).
///
/// Walks forward from `first` when the index lies in the first half and
/// backward from the last block otherwise. At most `max_walk` blocks are
/// visited.
pub(crate) fn resolve(seq: &SeqHeader, index: usize, max_walk: usize) -> Result<NonNull<u8>> {
    let first = seq.first.ok_or(InteropError::BrokenLink { record: "Seq" })?;
    let mut steps = 0usize;
    let mut step = || {
        steps += 1;
        if steps > max_walk {
            log::warn!("block walk exceeded {max_walk} blocks");
            Err(InteropError::BrokenLink { record: "SeqBlock" })
        } else {
            Ok(())
        }
    };

    let (data, offset) = if index * 2 <= seq.total {
        let mut current = block(first);
        let mut index = index;
        loop {
            step()?;
            let count = count_of(&current)?;
            if index < count {
                break (link(&current, "data")?, index);
            }
            index -= count;
            current = block(link(&current, "next")?);
        }
    } else {
        let mut current = block(first);
        let mut remaining = seq.total;
        loop {
            step()?;
            current = block(link(&current, "prev")?);
            let count = count_of(&current)?;
            remaining = remaining
                .checked_sub(count)
                .ok_or(InteropError::BrokenLink { record: "SeqBlock" })?;
            if index >= remaining {
                break (link(&current, "data")?, index - remaining);
            }
        }
    };
    log::trace!("resolved index {index} after {steps} block(s)");
    // SAFETY: `offset < count`, so the element lies inside the block.
    Ok(unsafe { raw::offset(data, offset * seq.elem_size) })
}

/// Forward walk over every element address, first to last.
pub(crate) struct BlockWalk {
    elem_size: usize,
    first: Option<NonNull<u8>>,
    block: Option<NonNull<u8>>,
    data: Option<NonNull<u8>>,
    in_block: usize,
    count: usize,
    remaining: usize,
    blocks_left: usize,
}

impl BlockWalk {
    pub(crate) fn new(seq: &SeqHeader, max_walk: usize) -> Self {
        Self {
            elem_size: seq.elem_size,
            first: seq.first,
            block: None,
            data: None,
            in_block: 0,
            count: 0,
            remaining: seq.total,
            blocks_left: max_walk,
        }
    }

    fn enter(&mut self, address: NonNull<u8>) -> Result<()> {
        self.blocks_left = self
            .blocks_left
            .checked_sub(1)
            .ok_or(InteropError::BrokenLink { record: "SeqBlock" })?;
        let record = block(address);
        self.block = Some(address);
        self.data = Some(link(&record, "data")?);
        self.count = count_of(&record)?;
        self.in_block = 0;
        Ok(())
    }

    /// Next element address, `Ok(None)` once `total` elements were seen.
    pub(crate) fn next_address(&mut self) -> Result<Option<NonNull<u8>>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        loop {
            match (self.block, self.data) {
                (Some(_), Some(data)) if self.in_block < self.count => {
                    // SAFETY: `in_block < count` keeps the element inside
                    // the block.
                    let address = unsafe { raw::offset(data, self.in_block * self.elem_size) };
                    self.in_block += 1;
                    self.remaining -= 1;
                    return Ok(Some(address));
                }
                (Some(current), _) => {
                    let next = link(&block(current), "next")?;
                    if Some(next) == self.first {
                        // Back at the start with elements still owed.
                        return Err(InteropError::BrokenLink { record: "Seq" });
                    }
                    self.enter(next)?;
                }
                (None, _) => {
                    let first = self.first.ok_or(InteropError::BrokenLink { record: "Seq" })?;
                    self.enter(first)?;
                }
            }
        }
    }
}

/// Every block in ring order, checking that counts add up to `total`.
pub(crate) fn directory(
    seq: &SeqHeader,
    max_walk: usize,
) -> Result<SmallVec<[BlockInfo; 8]>> {
    let mut blocks = SmallVec::new();
    let Some(first) = seq.first else {
        return Ok(blocks);
    };
    let mut current = first;
    let mut seen = 0usize;
    loop {
        if blocks.len() >= max_walk {
            return Err(InteropError::BrokenLink { record: "SeqBlock" });
        }
        let record = block(current);
        let count = count_of(&record)?;
        blocks.push(BlockInfo {
            start_index: record.read::<i32>("start_index")?,
            count,
            data: link(&record, "data")?,
        });
        seen += count;
        current = link(&record, "next")?;
        if current == first {
            break;
        }
    }
    if seen != seq.total {
        return Err(InteropError::BrokenLink { record: "Seq" });
    }
    Ok(blocks)
}

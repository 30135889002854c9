//! Benchmark profiles for the Tether container views.
//!
//! Builders that fill a freshly created container with a deterministic
//! pattern, shared by the benches so every run measures the same shape:
//!
//! - [`fill_seq`]: `n` consecutive `i32`s
//! - [`fill_set`]: `n` elements with every `hole_every`-th one removed
//! - [`fill_sparse`]: a diagonal band of `f64`s in a square matrix

#![forbid(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

use tether_core::{Release, Result};
use tether_seq::{NativeSeqApi, SeqView, SetView, SparseView};

/// Element counts used by the lookup and enumeration benches.
pub const SEQ_SIZES: [usize; 3] = [64, 1_024, 16_384];

/// Push `0..n` onto `seq`, which must hold 4-byte elements.
pub fn fill_seq<N, R>(seq: &mut SeqView<'_, N, R>, n: usize) -> Result<()>
where
    N: NativeSeqApi + ?Sized,
    R: Release,
{
    for v in 0..n as i32 {
        seq.push_value(&v)?;
    }
    Ok(())
}

/// Add `n` elements to `set`, then remove every `hole_every`-th so that
/// enumeration has free slots to skip.
pub fn fill_set<N, R>(set: &mut SetView<'_, N, R>, n: usize, hole_every: usize) -> Result<()>
where
    N: NativeSeqApi + ?Sized,
    R: Release,
{
    for v in 0..n as i64 {
        set.add_value(&v)?;
    }
    if hole_every > 0 {
        for i in (0..n).step_by(hole_every) {
            set.remove(i as isize)?;
        }
    }
    Ok(())
}

/// Store `(i + j) as f64` at every `[i, j]` with `|i - j| <= band` in a
/// `size` by `size` matrix. Returns the number of stored elements.
pub fn fill_sparse<N, R>(mat: &mut SparseView<'_, N, R>, size: usize, band: usize) -> Result<usize>
where
    N: NativeSeqApi + ?Sized,
    R: Release,
{
    let mut stored = 0;
    for i in 0..size {
        let lo = i.saturating_sub(band);
        let hi = (i + band + 1).min(size);
        for j in lo..hi {
            mat.set(&[i, j], (i + j) as f64)?;
            stored += 1;
        }
    }
    Ok(stored)
}

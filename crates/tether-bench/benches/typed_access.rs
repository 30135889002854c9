//! Criterion micro-benchmarks for typed pointer views and named field
//! access over plain buffers.

use std::ffi::c_void;
use std::hint::black_box;
use std::ptr::NonNull;

use criterion::{criterion_group, criterion_main, Criterion};
use tether_layout::{catalog, RawRecord};
use tether_view::ArrayPtr;

const LEN: usize = 10_000;

/// Benchmark: sum 10K `f32`s through checked and unchecked reads.
fn bench_array_reads(c: &mut Criterion) {
    let mut buffer: Vec<f32> = (0..LEN).map(|i| i as f32).collect();
    // SAFETY: `buffer` outlives the view and holds `LEN` elements.
    let view: ArrayPtr<'_, f32> =
        unsafe { ArrayPtr::from_raw(buffer.as_mut_ptr().cast(), Some(LEN)) }.unwrap();

    c.bench_function("array_get_checked_10k", |b| {
        b.iter(|| {
            let sum: f32 = (0..LEN).map(|i| view.get_checked(i).unwrap()).sum();
            black_box(sum);
        });
    });
    c.bench_function("array_get_unchecked_10k", |b| {
        b.iter(|| {
            // SAFETY: every index is below `LEN`.
            let sum: f32 = (0..LEN).map(|i| unsafe { view.get(i) }).sum();
            black_box(sum);
        });
    });
    c.bench_function("array_as_slice_10k", |b| {
        b.iter(|| black_box(view.as_slice().unwrap().iter().sum::<f32>()));
    });
}

/// Benchmark: read header fields by name through the record catalogue.
fn bench_record_fields(c: &mut Criterion) {
    let layout = catalog::seq();
    let mut header = vec![0u64; layout.header_size().div_ceil(8)];
    let address = NonNull::new(header.as_mut_ptr().cast::<c_void>()).unwrap();
    // SAFETY: `header` is zeroed, aligned for the record and large enough.
    let record = unsafe { RawRecord::new(address, layout) };
    record.write::<i32>("total", 42).unwrap();
    record.write::<i32>("elem_size", 8).unwrap();

    c.bench_function("record_read_by_name", |b| {
        b.iter(|| {
            let total = record.read::<i32>(black_box("total")).unwrap();
            let elem = record.read::<i32>(black_box("elem_size")).unwrap();
            black_box(total * elem);
        });
    });
}

criterion_group!(benches, bench_array_reads, bench_record_fields);
criterion_main!(benches);

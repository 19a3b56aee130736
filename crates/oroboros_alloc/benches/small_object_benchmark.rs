//! # Small Object Allocator Benchmark
//!
//! Compares bucket allocation against the global allocator for the
//! object sizes a frame churns through.
//!
//! Run with: `cargo bench --package oroboros_alloc`

#![allow(missing_docs)]

use std::alloc::Layout;
use std::ptr::NonNull;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use oroboros_alloc::{AllocatorConfig, FixedAllocator, SmallObjectAllocator};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Objects allocated per iteration.
const BATCH: usize = 10_000;

/// Benchmark: allocate then free a batch from one bucket.
fn bench_fixed_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("fixed_batch");
    group.throughput(Throughput::Elements(BATCH as u64));

    for block_size in [8usize, 64, 256] {
        group.bench_with_input(BenchmarkId::from_parameter(block_size), &block_size, |b, &size| {
            let mut allocator = FixedAllocator::new(size, 4096).unwrap();
            let mut ptrs: Vec<NonNull<u8>> = Vec::with_capacity(BATCH);
            b.iter(|| {
                for _ in 0..BATCH {
                    ptrs.push(allocator.allocate().unwrap());
                }
                for p in ptrs.drain(..) {
                    allocator.deallocate(p, None).unwrap();
                }
                black_box(allocator.chunk_count())
            });
        });
    }

    group.finish();
}

/// Benchmark: mixed sizes, random free order.
fn bench_mixed_churn(c: &mut Criterion) {
    let mut rng = ChaCha8Rng::seed_from_u64(0xBEEF);
    let sizes: Vec<usize> = (0..BATCH).map(|_| rng.gen_range(1..=128)).collect();
    let mut order: Vec<usize> = (0..BATCH).collect();
    for i in (1..BATCH).rev() {
        order.swap(i, rng.gen_range(0..=i));
    }

    let mut group = c.benchmark_group("mixed_churn");
    group.throughput(Throughput::Elements(BATCH as u64));

    group.bench_function("small_object_allocator", |b| {
        let mut allocator = SmallObjectAllocator::new(&AllocatorConfig::default()).unwrap();
        let mut ptrs: Vec<NonNull<u8>> = Vec::with_capacity(BATCH);
        b.iter(|| {
            ptrs.extend(sizes.iter().map(|&size| allocator.allocate(size).unwrap()));
            for &i in &order {
                allocator.deallocate(ptrs[i].as_ptr(), sizes[i]).unwrap();
            }
            ptrs.clear();
        });
    });

    group.bench_function("global_allocator", |b| {
        let mut boxes: Vec<Option<Box<[u8]>>> = Vec::with_capacity(BATCH);
        b.iter(|| {
            boxes.extend(sizes.iter().map(|&size| Some(vec![0u8; size].into_boxed_slice())));
            for &i in &order {
                black_box(boxes[i].take());
            }
            boxes.clear();
        });
    });

    group.finish();
}

/// Benchmark: typed allocation through layouts.
fn bench_layout_api(c: &mut Criterion) {
    let layout = Layout::new::<[f32; 4]>();
    c.bench_function("layout_alloc_free_vec4", |b| {
        let mut allocator = SmallObjectAllocator::new(&AllocatorConfig::particles()).unwrap();
        b.iter(|| {
            let p = allocator.allocate_layout(black_box(layout)).unwrap();
            allocator.deallocate_layout(p, layout).unwrap();
        });
    });
}

criterion_group!(benches, bench_fixed_batch, bench_mixed_churn, bench_layout_api);

criterion_main!(benches);

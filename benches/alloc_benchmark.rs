/*!
 * Backing Allocator Benchmarks
 *
 * Compare heap fallback against file-backed allocation, and measure the
 * map/unmap churn of locking under a tight mapped-bytes ceiling
 */

use backing_store::{BackingAllocator, Config};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

const PAGE: usize = 4096;

fn small_config() -> Config {
    Config::with_ceiling_bytes(64 * PAGE)
        .page_size(PAGE)
        .min_file_size(256 * PAGE)
        .max_files(4)
}

fn bench_alloc_free(c: &mut Criterion) {
    let mut group = c.benchmark_group("alloc_free");

    for size in [256usize, PAGE, 16 * PAGE] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let mut allocator = BackingAllocator::new(small_config());
            b.iter(|| {
                let alloc = allocator.allocate(black_box(size)).unwrap();
                allocator.free(alloc);
            });
        });
    }

    group.finish();
}

fn bench_heap_fallback(c: &mut Criterion) {
    let mut group = c.benchmark_group("heap_fallback");

    // Negative ceiling disables file backing entirely
    group.bench_function("pure_heap_page", |b| {
        let mut allocator = BackingAllocator::new(Config::with_ceiling_mb(-1));
        b.iter(|| {
            let alloc = allocator.allocate(black_box(PAGE)).unwrap();
            allocator.free(alloc);
        });
    });

    group.finish();
}

fn bench_lock_release(c: &mut Criterion) {
    let mut group = c.benchmark_group("lock_release");

    // Resident: the mapping stays alive between locks
    group.bench_function("resident", |b| {
        let mut allocator = BackingAllocator::new(small_config());
        let mut alloc = allocator.allocate(PAGE).unwrap();
        b.iter(|| {
            let ptr = allocator.get_pointer(&mut alloc).unwrap();
            black_box(ptr);
            allocator.weak_release(&alloc);
        });
        allocator.free(alloc);
    });

    // Churning: a two-page ceiling forces evict + remap on every round
    group.bench_function("map_churn", |b| {
        let config = Config::with_ceiling_bytes(2 * PAGE)
            .page_size(PAGE)
            .min_file_size(64 * PAGE)
            .max_files(1);
        let mut allocator = BackingAllocator::new(config);
        let mut allocs: Vec<_> = (0..4)
            .map(|_| allocator.allocate(PAGE).unwrap())
            .collect();
        b.iter(|| {
            for alloc in allocs.iter_mut() {
                let ptr = allocator.get_pointer(alloc).unwrap();
                black_box(ptr);
                allocator.strong_release(alloc);
            }
        });
        for alloc in allocs {
            allocator.free(alloc);
        }
    });

    group.finish();
}

fn bench_worker_free(c: &mut Criterion) {
    let mut group = c.benchmark_group("worker_free");

    // Enqueue from the owner side and reconcile, measuring queue overhead
    group.bench_function("enqueue_drain_32", |b| {
        let mut allocator = BackingAllocator::new(small_config());
        b.iter(|| {
            let queue = allocator.worker_queue();
            let allocs: Vec<_> = (0..32)
                .map(|_| allocator.allocate(PAGE).unwrap())
                .collect();
            for alloc in allocs {
                queue.free_from_worker(alloc);
            }
            allocator.flush();
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_alloc_free,
    bench_heap_fallback,
    bench_lock_release,
    bench_worker_free
);
criterion_main!(benches);

/*!
 * Deferred Release Tests
 * Worker-thread frees reconciled through the owner's flush points
 */

use backing_store::{BackingAllocator, Config};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::thread;

const PAGE: usize = 4096;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn test_worker_frees_reconcile_at_flush() {
    init_logging();
    let config = Config::with_ceiling_bytes(64 * PAGE)
        .page_size(PAGE)
        .min_file_size(64 * PAGE);
    let mut allocator = BackingAllocator::new(config);

    let count = 32;
    let allocs: Vec<_> = (0..count)
        .map(|_| allocator.allocate(PAGE).expect("Failed to allocate"))
        .collect();
    assert_eq!(allocator.stats().allocated_bytes, count * PAGE);

    let queue = allocator.worker_queue();
    let handle = thread::spawn(move || {
        for alloc in allocs {
            queue.free_from_worker(alloc);
        }
    });
    handle.join().unwrap();

    // Nothing moves until the owner reaches a flush point
    assert_eq!(allocator.stats().allocated_bytes, count * PAGE);

    allocator.flush();
    let stats = allocator.stats();
    assert_eq!(stats.allocated_bytes, 0, "every queued free must land once");
    assert_eq!(stats.free_regions, 1, "freed regions must coalesce");
    assert!(allocator.verify_integrity());
}

#[test]
fn test_concurrent_enqueue_and_drain_stress() {
    init_logging();
    let config = Config::with_ceiling_bytes(16 * PAGE)
        .page_size(PAGE)
        .min_file_size(256 * PAGE);
    let mut allocator = BackingAllocator::new(config);
    let mut rng = StdRng::seed_from_u64(0x5eed);

    let workers = 4;
    let per_worker = 64;
    let mut batches: Vec<Vec<_>> = Vec::new();
    for _ in 0..workers {
        let batch: Vec<_> = (0..per_worker)
            .map(|_| {
                // Mix of file-backed and heap allocations
                let size = if rng.gen_bool(0.5) { PAGE } else { 64 };
                allocator.allocate(size).expect("Failed to allocate")
            })
            .collect();
        batches.push(batch);
    }
    let expected: usize = batches
        .iter()
        .flatten()
        .map(|alloc| alloc.size())
        .sum();
    assert_eq!(allocator.stats().allocated_bytes, expected);

    let handles: Vec<_> = batches
        .into_iter()
        .map(|batch| {
            let queue = allocator.worker_queue();
            thread::spawn(move || {
                for alloc in batch {
                    queue.free_from_worker(alloc);
                    thread::yield_now();
                }
            })
        })
        .collect();

    // Drain concurrently with the enqueues; allocate() is itself a
    // flush point, so churn while the workers run
    while handles.iter().any(|handle| !handle.is_finished()) {
        let churn = allocator.allocate(PAGE).expect("Failed to allocate");
        allocator.free(churn);
    }
    for handle in handles {
        handle.join().unwrap();
    }

    allocator.flush();
    let stats = allocator.stats();
    assert_eq!(
        stats.allocated_bytes, 0,
        "exactly one release per queued free: no loss, no duplication"
    );
    assert_eq!(stats.free_regions, 1);
    assert!(allocator.verify_integrity());
}

#[test]
fn test_children_enqueued_before_parents_drain_cleanly() {
    init_logging();
    let config = Config::with_ceiling_bytes(16 * PAGE)
        .page_size(PAGE)
        .min_file_size(16 * PAGE);
    let mut allocator = BackingAllocator::new(config);

    let parent = allocator.allocate(2 * PAGE).expect("Failed to allocate");
    let sub = allocator.suballocate(&parent, PAGE);

    let queue = allocator.worker_queue();
    let handle = thread::spawn(move || {
        // FIFO drain order: the child must land before its parent
        queue.free_from_worker(sub);
        queue.free_from_worker(parent);
    });
    handle.join().unwrap();

    allocator.flush();
    let stats = allocator.stats();
    assert_eq!(stats.allocated_bytes, 0);
    assert!(allocator.verify_integrity());
}

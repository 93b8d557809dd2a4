//! Benchmark: Card Logging and Buffer Refinement Throughput
//!
//! Measures the write-barrier fast path, the hand-off of full buffers to the
//! shared queue, and the cost of refining a buffer.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use card_refine::{
    Card, CardBufferQueue, CardQueueSet, CardTable, RefineConfig, RefinementStats,
    RemSetScanner, Safepoint,
};
use std::hint::black_box;
use std::sync::Arc;
use std::thread;

const NUM_CARDS: usize = 1 << 16;

struct CleaningScanner {
    table: Arc<CardTable>,
}

impl RemSetScanner for CleaningScanner {
    fn clean_card_before_refine(&self, card: &mut Card) -> bool {
        if !self.table.is_dirty(*card) {
            return false;
        }
        self.table.mark_clean(*card);
        true
    }

    fn refine_card_concurrently(&self, card: Card, _worker_id: u32) {
        black_box(card);
    }
}

fn setup(buffer_capacity: usize) -> (Arc<CardTable>, Arc<CardQueueSet>) {
    let table = Arc::new(CardTable::with_cards(NUM_CARDS));
    let scanner = Arc::new(CleaningScanner {
        table: Arc::clone(&table),
    });
    let qset = Arc::new(CardQueueSet::new(
        &RefineConfig::default().with_buffer_capacity(buffer_capacity),
        Arc::clone(&table),
        scanner,
        Arc::new(Safepoint::new()),
    ));
    (table, qset)
}

/// Drain the backlog so the next iteration starts empty.
fn drain(qset: &CardQueueSet) {
    let mut stats = RefinementStats::new();
    while qset.refine_completed_buffer_concurrently(0, 0, &mut stats) {}
}

fn bench_enqueue(c: &mut Criterion) {
    let mut group = c.benchmark_group("enqueue");
    for capacity in [64, 256, 1024] {
        let (_table, qset) = setup(capacity);
        group.throughput(Throughput::Elements(NUM_CARDS as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(capacity),
            &capacity,
            |b, _| {
                b.iter(|| {
                    let mut queue = CardBufferQueue::new(Arc::clone(&qset));
                    for i in 0..NUM_CARDS {
                        queue.enqueue(Card::new(black_box(i)));
                    }
                    queue.flush();
                    drain(&qset);
                });
            },
        );
    }
    group.finish();
}

fn bench_post_write_filtering(c: &mut Criterion) {
    let (table, qset) = setup(256);
    let card_size = table.card_size();
    c.bench_function("post_write_already_dirty", |b| {
        let mut queue = CardBufferQueue::new(Arc::clone(&qset));
        for i in 0..NUM_CARDS {
            queue.post_write(i * card_size);
        }
        b.iter(|| {
            for i in 0..NUM_CARDS {
                black_box(queue.post_write(black_box(i * card_size)));
            }
        });
    });
}

fn bench_refine_buffer(c: &mut Criterion) {
    let (table, qset) = setup(256);
    c.bench_function("refine_256_dirty_cards", |b| {
        b.iter(|| {
            let mut buffer = qset.allocator().allocate();
            // Scattered cards so the sort has work to do.
            for i in 0..256 {
                let card = Card::new((i * 7919) % NUM_CARDS);
                table.mark_dirty(card);
                assert!(buffer.try_push(card));
            }
            let mut stats = RefinementStats::new();
            black_box(qset.refine_buffer(&mut buffer, 0, &mut stats));
            qset.allocator().release(buffer);
        });
    });
}

fn bench_concurrent_enqueue(c: &mut Criterion) {
    let (_table, qset) = setup(256);
    c.bench_function("concurrent_enqueue_4_threads", |b| {
        b.iter(|| {
            let handles: Vec<_> = (0..4)
                .map(|t| {
                    let qset = Arc::clone(&qset);
                    thread::spawn(move || {
                        let mut queue = CardBufferQueue::new(qset);
                        for i in 0..NUM_CARDS / 4 {
                            queue.enqueue(Card::new(t * (NUM_CARDS / 4) + i));
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }
            drain(&qset);
        });
    });
}

criterion_group!(
    benches,
    bench_enqueue,
    bench_post_write_filtering,
    bench_refine_buffer,
    bench_concurrent_enqueue
);
criterion_main!(benches);

//! End-to-end: mutators dirty cards through the write barrier while the
//! refinement threads, inline mutator refinement and periodic safepoints all
//! run at once. Every card must be refined exactly once.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use card_refine::{
    Card, CardBufferQueue, CardQueueSet, CardTable, FixedRatePolicy, RefineConfig,
    RefineThreadPool, RemSetScanner, Safepoint,
};

const MUTATORS: usize = 4;
const CARDS_PER_MUTATOR: usize = 1000;

/// Cleans dirty cards before refinement and counts refinements per card.
struct CountingScanner {
    table: Arc<CardTable>,
    counts: Vec<AtomicU32>,
}

impl RemSetScanner for CountingScanner {
    fn clean_card_before_refine(&self, card: &mut Card) -> bool {
        if !self.table.is_dirty(*card) {
            return false;
        }
        self.table.mark_clean(*card);
        true
    }

    fn refine_card_concurrently(&self, card: Card, _worker_id: u32) {
        self.counts[card.index()].fetch_add(1, Ordering::Relaxed);
    }
}

fn all_refined_once(scanner: &CountingScanner) -> bool {
    scanner
        .counts
        .iter()
        .all(|count| count.load(Ordering::Relaxed) == 1)
}

#[test]
fn test_every_card_refined_exactly_once() {
    let num_cards = MUTATORS * CARDS_PER_MUTATOR;
    let table = Arc::new(CardTable::with_cards(num_cards));
    let scanner = Arc::new(CountingScanner {
        table: Arc::clone(&table),
        counts: (0..num_cards).map(|_| AtomicU32::new(0)).collect(),
    });
    let safepoint = Arc::new(Safepoint::new());
    let config = RefineConfig::default()
        .with_buffer_capacity(64)
        .with_max_refinement_threads(3)
        .with_adjust_threads_period(Duration::from_millis(2))
        .with_initial_pending_cards_target(0);
    let qset = Arc::new(CardQueueSet::new(
        &config,
        Arc::clone(&table),
        Arc::clone(&scanner) as Arc<dyn RemSetScanner>,
        Arc::clone(&safepoint),
    ));
    // Plenty of time left but threads so slow that even a single card needs
    // more of them than exist: every thread stays wanted and mutators help.
    let policy = FixedRatePolicy::new()
        .with_available_bytes(Some(1 << 30))
        .with_alloc_rate_ms(1.0)
        .with_dirtied_cards_rate_ms(0.0)
        .with_concurrent_refine_rate_ms(1e-9);
    let pool = RefineThreadPool::new(Arc::clone(&qset), Arc::new(policy), &config).unwrap();

    let start = Arc::new(Barrier::new(MUTATORS + 1));
    let mutators: Vec<_> = (0..MUTATORS)
        .map(|m| {
            let qset = Arc::clone(&qset);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                let mut queue = CardBufferQueue::new(Arc::clone(&qset));
                let card_size = qset.card_table().card_size();
                start.wait();
                for i in 0..CARDS_PER_MUTATOR {
                    let addr = (m * CARDS_PER_MUTATOR + i) * card_size;
                    assert!(queue.post_write(addr));
                }
            })
        })
        .collect();

    let stop_pausing = Arc::new(AtomicBool::new(false));
    let collector = {
        let safepoint = Arc::clone(&safepoint);
        let stop_pausing = Arc::clone(&stop_pausing);
        thread::spawn(move || {
            let mut pauses = 0u64;
            while !stop_pausing.load(Ordering::Acquire) {
                let guard = safepoint.begin();
                thread::sleep(Duration::from_micros(200));
                drop(guard);
                pauses += 1;
                thread::sleep(Duration::from_millis(1));
            }
            pauses
        })
    };

    start.wait();
    for mutator in mutators {
        mutator.join().unwrap();
    }
    stop_pausing.store(true, Ordering::Release);
    let pauses = collector.join().unwrap();
    assert!(pauses > 0);

    let deadline = Instant::now() + Duration::from_secs(20);
    while !(qset.num_cards() == 0 && all_refined_once(&scanner)) {
        assert!(
            Instant::now() < deadline,
            "{} cards still pending",
            qset.num_cards()
        );
        thread::sleep(Duration::from_millis(1));
    }
    drop(pool);

    for (index, count) in scanner.counts.iter().enumerate() {
        assert_eq!(count.load(Ordering::Relaxed), 1, "card {index}");
    }
    assert!(table.dirty_cards().next().is_none());
}

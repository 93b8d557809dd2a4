//! Integration tests for the refinement tracing feature.
//!
//! Events emitted on the calling thread are captured through a
//! `tracing-subscriber` formatter writing into a shared buffer.

#![cfg(feature = "tracing")]

use std::io;
use std::sync::Arc;

use card_refine::{
    Card, CardBufferQueue, CardQueueSet, CardTable, ConcurrentRefine, FixedRatePolicy,
    RefineConfig, RefinePolicy, RefineThreadPool, RemSetScanner, Safepoint,
};
use parking_lot::Mutex;

struct KeepAll;

impl RemSetScanner for KeepAll {
    fn clean_card_before_refine(&self, _card: &mut Card) -> bool {
        true
    }

    fn refine_card_concurrently(&self, _card: Card, _worker_id: u32) {}
}

#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Captured {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl io::Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn capture(f: impl FnOnce()) -> String {
    let captured = Captured::default();
    let writer = captured.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();
    tracing::subscriber::with_default(subscriber, f);
    captured.text()
}

fn qset(config: &RefineConfig) -> Arc<CardQueueSet> {
    Arc::new(CardQueueSet::new(
        config,
        Arc::new(CardTable::with_cards(64)),
        Arc::new(KeepAll),
        Arc::new(Safepoint::new()),
    ))
}

#[test]
fn test_pending_cards_target_is_logged() {
    let config = RefineConfig::default().with_buffer_capacity(4);
    let policy: Arc<dyn RefinePolicy> = Arc::new(FixedRatePolicy::new());
    let cr = ConcurrentRefine::new(qset(&config), policy, &config);
    let output = capture(|| cr.adjust_after_gc(10.0, 1000, 0, 5.0));
    assert!(output.contains("pending_cards_target"), "{output}");
    assert!(output.contains("new_target=500"), "{output}");
}

#[test]
fn test_threads_wanted_is_logged() {
    let config = RefineConfig::default().with_initial_pending_cards_target(0);
    let policy: Arc<dyn RefinePolicy> = Arc::new(FixedRatePolicy::new());
    let cr = ConcurrentRefine::new(qset(&config), policy, &config);
    cr.record_thread_adjustment_needed();
    let output = capture(|| assert!(cr.adjust_threads_periodically()));
    assert!(output.contains("threads_wanted"), "{output}");
    assert!(output.contains("new_wanted=0"), "{output}");
}

#[test]
fn test_mutator_refinement_is_logged() {
    let config = RefineConfig::default().with_buffer_capacity(2);
    let qset = qset(&config);
    qset.set_mutator_refinement_threshold(0);
    let output = capture(|| {
        let mut queue = CardBufferQueue::new(Arc::clone(&qset));
        for i in 0..3 {
            queue.enqueue(Card::new(i));
        }
    });
    assert!(output.contains("mutator_refinement"), "{output}");
    assert!(output.contains("refined_cards=2"), "{output}");
}

#[test]
fn test_pool_runs_with_tracing() {
    let config = RefineConfig::default()
        .with_buffer_capacity(4)
        .with_max_refinement_threads(2);
    let qset = qset(&config);
    let mut pool =
        RefineThreadPool::new(Arc::clone(&qset), Arc::new(FixedRatePolicy::new()), &config)
            .unwrap();
    let mut queue = CardBufferQueue::new(Arc::clone(&qset));
    for i in 0..4 {
        queue.enqueue(Card::new(i));
    }
    queue.flush();
    pool.activate(1);
    pool.stop();
}

//! Thread-local staging of dirty cards.

use std::fmt;
use std::sync::Arc;

use crate::buffer::CardBuffer;
use crate::card::Card;
use crate::qset::CardQueueSet;
use crate::stats::RefinementStats;

/// What kind of thread owns a [`CardBufferQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThreadKind {
    /// An application thread. May be asked to refine a buffer inline when
    /// the backlog grows past the mutator threshold.
    #[default]
    Mutator,
    /// A collector or runtime thread. Never refines inline.
    Service,
}

/// A thread's buffer of dirty cards.
///
/// Cards accumulate in the current buffer until it is full, at which point
/// the buffer is handed to the shared [`CardQueueSet`] and a fresh one takes
/// its place. Dropping the queue flushes any partial buffer and hands the
/// thread's statistics over to the set.
pub struct CardBufferQueue {
    qset: Arc<CardQueueSet>,
    buffer: Option<CardBuffer>,
    stats: RefinementStats,
    kind: ThreadKind,
}

impl CardBufferQueue {
    /// Create a mutator queue feeding `qset`.
    #[must_use]
    pub fn new(qset: Arc<CardQueueSet>) -> Self {
        Self::with_kind(qset, ThreadKind::Mutator)
    }

    /// Create a queue for a thread of the given kind.
    #[must_use]
    pub const fn with_kind(qset: Arc<CardQueueSet>, kind: ThreadKind) -> Self {
        Self {
            qset,
            buffer: None,
            stats: RefinementStats::new(),
            kind,
        }
    }

    /// The set this queue feeds.
    #[must_use]
    pub const fn qset(&self) -> &Arc<CardQueueSet> {
        &self.qset
    }

    /// The owning thread's kind.
    #[must_use]
    pub const fn kind(&self) -> ThreadKind {
        self.kind
    }

    /// Statistics of this thread since they were last harvested.
    #[must_use]
    pub const fn stats(&self) -> &RefinementStats {
        &self.stats
    }

    /// Cards in the current buffer.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.as_ref().map_or(0, CardBuffer::len)
    }

    /// Whether the current buffer holds no cards.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Log a dirty card.
    pub fn enqueue(&mut self, card: Card) {
        if !self.try_enqueue(card) {
            self.handle_zero_index();
            let enqueued = self.try_enqueue(card);
            debug_assert!(enqueued, "fresh buffer rejected a card");
        }
    }

    fn try_enqueue(&mut self, card: Card) -> bool {
        self.buffer
            .as_mut()
            .is_some_and(|buffer| buffer.try_push(card))
    }

    /// Swap the full (or missing) buffer for a fresh one, handing the full
    /// one to the set.
    fn handle_zero_index(&mut self) {
        debug_assert!(self.buffer.as_ref().is_none_or(CardBuffer::is_full));
        let fresh = self.qset.allocator().allocate();
        if let Some(full) = self.buffer.replace(fresh) {
            self.stats.dirtied_cards += full.capacity();
            self.qset
                .handle_completed_buffer(full, self.kind, &mut self.stats);
        }
    }

    /// Post-write barrier for a store into the heap word at `field_addr`.
    ///
    /// Dirties the covering card and logs it unless the card was already
    /// dirty, young, or outside the covered heap. Returns whether the card
    /// was logged.
    pub fn post_write(&mut self, field_addr: usize) -> bool {
        let Some(card) = self.qset.card_table().card_for(field_addr) else {
            return false;
        };
        if !self.qset.card_table().try_mark_dirty(card) {
            return false;
        }
        self.enqueue(card);
        true
    }

    /// Hand the current buffer to the set.
    pub fn flush(&mut self) {
        let qset = Arc::clone(&self.qset);
        qset.flush_queue(self);
    }

    pub(crate) fn take_buffer(&mut self) -> Option<CardBuffer> {
        self.buffer.take()
    }

    pub(crate) fn buffer_mut(&mut self) -> Option<&mut CardBuffer> {
        self.buffer.as_mut()
    }

    pub(crate) fn stats_mut(&mut self) -> &mut RefinementStats {
        &mut self.stats
    }
}

impl Drop for CardBufferQueue {
    fn drop(&mut self) {
        let qset = Arc::clone(&self.qset);
        qset.flush_queue(self);
        qset.record_detached_refinement_stats(&mut self.stats);
    }
}

impl fmt::Debug for CardBufferQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CardBufferQueue")
            .field("kind", &self.kind)
            .field("len", &self.len())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::card::CardTable;
    use crate::config::RefineConfig;
    use crate::refiner::RemSetScanner;
    use crate::safepoint::Safepoint;

    struct NoopScanner;

    impl RemSetScanner for NoopScanner {
        fn clean_card_before_refine(&self, _card: &mut Card) -> bool {
            true
        }

        fn refine_card_concurrently(&self, _card: Card, _worker_id: u32) {}
    }

    fn qset(capacity: usize) -> Arc<CardQueueSet> {
        Arc::new(CardQueueSet::new(
            &RefineConfig::default().with_buffer_capacity(capacity),
            Arc::new(CardTable::with_cards(64)),
            Arc::new(NoopScanner),
            Arc::new(Safepoint::new()),
        ))
    }

    #[test]
    fn test_full_buffer_is_handed_off() {
        let qset = qset(4);
        let mut queue = CardBufferQueue::new(Arc::clone(&qset));
        for i in 0..4 {
            queue.enqueue(Card::new(i));
        }
        assert_eq!(queue.len(), 4);
        assert_eq!(qset.num_cards(), 0);

        queue.enqueue(Card::new(4));
        assert_eq!(queue.len(), 1);
        assert_eq!(qset.num_cards(), 4);
        assert_eq!(queue.stats().dirtied_cards, 4);
    }

    #[test]
    fn test_flush_hands_off_partial_buffer() {
        let qset = qset(8);
        let mut queue = CardBufferQueue::new(Arc::clone(&qset));
        queue.flush();
        assert_eq!(qset.num_cards(), 0);
        assert_eq!(queue.stats().dirtied_cards, 0);

        queue.enqueue(Card::new(1));
        queue.enqueue(Card::new(2));
        queue.flush();
        assert!(queue.is_empty());
        assert_eq!(qset.num_cards(), 2);
        assert_eq!(queue.stats().dirtied_cards, 2);
    }

    #[test]
    fn test_post_write_logs_each_card_once() {
        let qset = qset(8);
        let mut queue = CardBufferQueue::new(Arc::clone(&qset));
        let card_size = qset.card_table().card_size();

        assert!(queue.post_write(3 * card_size + 8));
        assert!(!queue.post_write(3 * card_size + 16));
        assert!(queue.post_write(5 * card_size));
        assert!(!queue.post_write(usize::MAX));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_drop_flushes_and_detaches_stats() {
        let qset = qset(2);
        {
            let mut queue = CardBufferQueue::new(Arc::clone(&qset));
            for i in 0..3 {
                queue.enqueue(Card::new(i));
            }
        }
        assert_eq!(qset.num_cards(), 3);
        let _guard = qset.safepoint().begin();
        qset.update_refinement_stats(RefinementStats::new());
        assert_eq!(qset.concatenated_refinement_stats().dirtied_cards, 3);
    }
}

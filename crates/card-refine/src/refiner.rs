//! Draining a single card buffer into the remembered sets.
//!
//! Refinement of a buffer runs in three steps:
//!
//! 1. **Clean.** Each live card is offered to
//!    [`RemSetScanner::clean_card_before_refine`]. Cards it rejects need no
//!    further work; the kept cards are compacted to the high end of the
//!    buffer with a two-finger partition.
//! 2. **Order.** After a full fence, the kept cards are sorted by decreasing
//!    address, which measured faster than both unsorted and ascending order.
//! 3. **Refine.** Each kept card goes to
//!    [`RemSetScanner::refine_card_concurrently`]. Before every card the
//!    yield signal is polled; if it is raised, every card not yet refined is
//!    dirtied again in the card table so a later pass rediscovers it, and the
//!    buffer's index is left at the first unrefined card.

use std::time::Instant;

use crate::buffer::CardBuffer;
use crate::card::{Card, CardTable};
use crate::safepoint::{Safepoint, SuspendibleGuard};
use crate::stats::RefinementStats;
use crate::sync::atomic::{fence, Ordering};

/// The remembered-set side of refinement.
pub trait RemSetScanner: Send + Sync {
    /// Decide whether `card` still needs refinement.
    ///
    /// Returns `true` to keep the card. The scanner may rewrite the slot, for
    /// example to point at a different card of the same object.
    fn clean_card_before_refine(&self, card: &mut Card) -> bool;

    /// Record the cross-region references found in `card`.
    fn refine_card_concurrently(&self, card: Card, worker_id: u32);
}

/// A cooperative request to stop refining.
pub trait YieldSignal {
    /// Whether refinement should stop at the next card boundary.
    fn should_yield(&self) -> bool;
}

impl<F: Fn() -> bool + ?Sized> YieldSignal for F {
    fn should_yield(&self) -> bool {
        self()
    }
}

impl YieldSignal for Safepoint {
    fn should_yield(&self) -> bool {
        Self::should_yield(self)
    }
}

impl YieldSignal for SuspendibleGuard<'_> {
    fn should_yield(&self) -> bool {
        Self::should_yield(self)
    }
}

/// Refines buffers on behalf of one worker.
pub struct BufferRefiner<'a, S: ?Sized, Y: ?Sized> {
    scanner: &'a S,
    card_table: &'a CardTable,
    yield_signal: &'a Y,
    worker_id: u32,
}

impl<'a, S, Y> BufferRefiner<'a, S, Y>
where
    S: RemSetScanner + ?Sized,
    Y: YieldSignal + ?Sized,
{
    /// Create a refiner for `worker_id`. Unrefined cards are redirtied in
    /// `card_table` when `yield_signal` fires.
    pub const fn new(
        scanner: &'a S,
        card_table: &'a CardTable,
        yield_signal: &'a Y,
        worker_id: u32,
    ) -> Self {
        Self {
            scanner,
            card_table,
            yield_signal,
            worker_id,
        }
    }

    /// Refine the live cards of `buffer`.
    ///
    /// Returns `true` if every card was handled, leaving the buffer empty.
    /// Returns `false` if the yield signal interrupted refinement; the buffer
    /// then holds exactly the cards still to be refined.
    pub fn refine(&self, buffer: &mut CardBuffer, stats: &mut RefinementStats) -> bool {
        let start = Instant::now();
        let result = self.refine_buffer(buffer, stats);
        stats.refinement_time += start.elapsed();
        result
    }

    fn refine_buffer(&self, buffer: &mut CardBuffer, stats: &mut RefinementStats) -> bool {
        let capacity = buffer.capacity();
        let first_kept = self.clean_cards(buffer, stats);
        if first_kept == capacity {
            buffer.set_index(capacity);
            return true;
        }

        // Region metadata read by the scanner must not be observed before the
        // card reads of the clean phase.
        fence(Ordering::SeqCst);
        buffer.slots_mut()[first_kept..].sort_unstable_by(|a, b| b.cmp(a));
        self.refine_cleaned_cards(buffer, first_kept, stats)
    }

    /// Partition the live cards so the kept ones occupy `[first_kept,
    /// capacity)`, returning `first_kept`.
    fn clean_cards(&self, buffer: &mut CardBuffer, stats: &mut RefinementStats) -> usize {
        let start = buffer.index();
        let slots = buffer.slots_mut();
        let mut src = start;
        let mut dst = slots.len();

        while src < dst {
            if self.scanner.clean_card_before_refine(&mut slots[src]) {
                // A keeper. Find a discard from the top to trade places with.
                loop {
                    dst -= 1;
                    if src >= dst {
                        break;
                    }
                    if !self.scanner.clean_card_before_refine(&mut slots[dst]) {
                        slots[dst] = slots[src];
                        break;
                    }
                }
            }
            src += 1;
        }

        let discarded = dst - start;
        stats.refined_cards += discarded;
        stats.precleaned_cards += discarded;
        dst
    }

    fn refine_cleaned_cards(
        &self,
        buffer: &mut CardBuffer,
        start: usize,
        stats: &mut RefinementStats,
    ) -> bool {
        let capacity = buffer.capacity();
        let mut completed = true;
        let mut next = start;
        while next < capacity {
            if self.yield_signal.should_yield() {
                self.redirty_unrefined_cards(&buffer.slots_mut()[next..]);
                completed = false;
                break;
            }
            let card = buffer.slots_mut()[next];
            self.scanner.refine_card_concurrently(card, self.worker_id);
            next += 1;
        }
        buffer.set_index(next);
        stats.refined_cards += next - start;
        completed
    }

    fn redirty_unrefined_cards(&self, cards: &[Card]) {
        for &card in cards {
            self.card_table.mark_dirty(card);
        }
    }
}

impl<S: ?Sized, Y: ?Sized> std::fmt::Debug for BufferRefiner<'_, S, Y> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferRefiner")
            .field("worker_id", &self.worker_id)
            .finish_non_exhaustive()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::buffer::BufferAllocator;
    use parking_lot::Mutex;
    use std::cell::Cell;

    /// Keeps dirty cards and cleans them, like a card-table based scanner.
    struct RecordingScanner<'a> {
        table: &'a CardTable,
        refined: Mutex<Vec<Card>>,
    }

    impl RemSetScanner for RecordingScanner<'_> {
        fn clean_card_before_refine(&self, card: &mut Card) -> bool {
            if !self.table.is_dirty(*card) {
                return false;
            }
            self.table.mark_clean(*card);
            true
        }

        fn refine_card_concurrently(&self, card: Card, _worker_id: u32) {
            self.refined.lock().push(card);
        }
    }

    fn filled(allocator: &BufferAllocator, cards: &[usize]) -> CardBuffer {
        let mut buffer = allocator.allocate();
        for &index in cards {
            assert!(buffer.try_push(Card::new(index)));
        }
        buffer
    }

    #[test]
    fn test_refines_in_decreasing_order() {
        let table = CardTable::with_cards(32);
        let scanner = RecordingScanner {
            table: &table,
            refined: Mutex::new(Vec::new()),
        };
        let allocator = BufferAllocator::new(8);
        let cards = [5, 17, 2, 9, 30];
        for &index in &cards {
            table.mark_dirty(Card::new(index));
        }
        let mut buffer = filled(&allocator, &cards);

        let never = || false;
        let refiner = BufferRefiner::new(&scanner, &table, &never, 0);
        let mut stats = RefinementStats::new();
        assert!(refiner.refine(&mut buffer, &mut stats));

        let refined: Vec<usize> = scanner.refined.lock().iter().map(|c| c.index()).collect();
        assert_eq!(refined, vec![30, 17, 9, 5, 2]);
        assert_eq!(stats.refined_cards, 5);
        assert_eq!(stats.precleaned_cards, 0);
        assert!(buffer.is_empty());
        allocator.release(buffer);
    }

    #[test]
    fn test_clean_cards_are_discarded() {
        let table = CardTable::with_cards(32);
        let scanner = RecordingScanner {
            table: &table,
            refined: Mutex::new(Vec::new()),
        };
        let allocator = BufferAllocator::new(8);
        let cards = [1, 2, 3, 4, 5, 6];
        for index in [2, 5] {
            table.mark_dirty(Card::new(index));
        }
        let mut buffer = filled(&allocator, &cards);

        let never = || false;
        let refiner = BufferRefiner::new(&scanner, &table, &never, 3);
        let mut stats = RefinementStats::new();
        assert!(refiner.refine(&mut buffer, &mut stats));

        let refined: Vec<usize> = scanner.refined.lock().iter().map(|c| c.index()).collect();
        assert_eq!(refined, vec![5, 2]);
        assert_eq!(stats.refined_cards, 6);
        assert_eq!(stats.precleaned_cards, 4);
        allocator.release(buffer);
    }

    #[test]
    fn test_all_clean_buffer() {
        let table = CardTable::with_cards(8);
        let scanner = RecordingScanner {
            table: &table,
            refined: Mutex::new(Vec::new()),
        };
        let allocator = BufferAllocator::new(4);
        let mut buffer = filled(&allocator, &[0, 1, 2]);

        let never = || false;
        let refiner = BufferRefiner::new(&scanner, &table, &never, 0);
        let mut stats = RefinementStats::new();
        assert!(refiner.refine(&mut buffer, &mut stats));
        assert!(scanner.refined.lock().is_empty());
        assert_eq!(stats.precleaned_cards, 3);
        assert!(buffer.is_empty());
        allocator.release(buffer);
    }

    #[test]
    fn test_yield_redirties_remaining_cards() {
        let table = CardTable::with_cards(16);
        let scanner = RecordingScanner {
            table: &table,
            refined: Mutex::new(Vec::new()),
        };
        let allocator = BufferAllocator::new(8);
        let cards = [1, 3, 5, 7, 9];
        for &index in &cards {
            table.mark_dirty(Card::new(index));
        }
        let mut buffer = filled(&allocator, &cards);

        // Allow two cards, then ask to yield.
        let polls = Cell::new(0);
        let yield_after_two = || {
            polls.set(polls.get() + 1);
            polls.get() > 2
        };
        let refiner = BufferRefiner::new(&scanner, &table, &yield_after_two, 0);
        let mut stats = RefinementStats::new();
        assert!(!refiner.refine(&mut buffer, &mut stats));

        let refined: Vec<usize> = scanner.refined.lock().drain(..).map(|c| c.index()).collect();
        assert_eq!(refined, vec![9, 7]);
        assert_eq!(stats.refined_cards, 2);
        assert_eq!(buffer.len(), 3);
        let dirty: Vec<usize> = table.dirty_cards().map(Card::index).collect();
        assert_eq!(dirty, vec![1, 3, 5]);

        // A second pass picks up exactly the cards left behind.
        let never = || false;
        let refiner = BufferRefiner::new(&scanner, &table, &never, 0);
        assert!(refiner.refine(&mut buffer, &mut stats));
        let refined: Vec<usize> = scanner.refined.lock().iter().map(|c| c.index()).collect();
        assert_eq!(refined, vec![5, 3, 1]);
        allocator.release(buffer);
    }
}

//! Card table and card handles.
//!
//! The heap covered by a [`CardTable`] is split into fixed-size, aligned
//! cards. Each card has one byte in the table recording whether the range
//! has been written through since it was last refined.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Card value written by the post-write barrier.
pub const DIRTY_CARD: u8 = 0;

/// Card value for a card with no pending cross-region stores.
pub const CLEAN_CARD: u8 = 0xff;

/// Card value for cards covering young regions. Stores into young regions
/// never need refinement, so the barrier filters them out.
pub const YOUNG_CARD: u8 = 2;

/// Default number of heap bytes covered by one card.
pub const DEFAULT_CARD_SIZE: usize = 512;

/// A card in a [`CardTable`], identified by its position in the table.
///
/// Cards compare by heap address: a higher card covers a higher address
/// range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Card(usize);

impl Card {
    /// Create a card handle from a table index.
    #[must_use]
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    /// Position of this card in its table.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for Card {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "card#{}", self.0)
    }
}

/// Byte-per-card table covering a contiguous heap range.
///
/// All card updates are single-byte atomic stores, so the table can be
/// shared freely between mutators and refinement threads.
pub struct CardTable {
    cards: Box<[AtomicU8]>,
    heap_base: usize,
    card_shift: u32,
}

impl CardTable {
    /// Create a table covering `[heap_base, heap_base + heap_size)` with
    /// every card clean.
    ///
    /// # Panics
    ///
    /// Panics if `card_size` is not a power of two or `heap_base` is not
    /// aligned to `card_size`.
    #[must_use]
    pub fn new(heap_base: usize, heap_size: usize, card_size: usize) -> Self {
        assert!(
            card_size.is_power_of_two(),
            "card_size must be a power of 2"
        );
        assert!(
            heap_base % card_size == 0,
            "heap_base must be card aligned"
        );

        let num_cards = heap_size.div_ceil(card_size);
        let cards = (0..num_cards).map(|_| AtomicU8::new(CLEAN_CARD)).collect();

        Self {
            cards,
            heap_base,
            card_shift: card_size.trailing_zeros(),
        }
    }

    /// Create a table of `num_cards` clean cards of the default size, based
    /// at address zero.
    #[must_use]
    pub fn with_cards(num_cards: usize) -> Self {
        Self::new(0, num_cards * DEFAULT_CARD_SIZE, DEFAULT_CARD_SIZE)
    }

    /// Number of cards in the table.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cards.len()
    }

    /// Whether the table covers no cards.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }

    /// Heap bytes covered by one card.
    #[must_use]
    pub const fn card_size(&self) -> usize {
        1 << self.card_shift
    }

    /// The card covering `addr`, if the address is inside the covered range.
    #[must_use]
    pub fn card_for(&self, addr: usize) -> Option<Card> {
        let offset = addr.checked_sub(self.heap_base)?;
        let index = offset >> self.card_shift;
        (index < self.cards.len()).then_some(Card(index))
    }

    /// First heap address covered by `card`.
    #[must_use]
    pub const fn addr_for(&self, card: Card) -> usize {
        self.heap_base + (card.0 << self.card_shift)
    }

    /// Whether `card` belongs to this table.
    #[must_use]
    pub fn contains(&self, card: Card) -> bool {
        card.0 < self.cards.len()
    }

    /// Current value of `card`.
    #[must_use]
    pub fn value(&self, card: Card) -> u8 {
        self.cards[card.0].load(Ordering::Relaxed)
    }

    /// Overwrite the value of `card`.
    pub fn set_value(&self, card: Card, value: u8) {
        self.cards[card.0].store(value, Ordering::Relaxed);
    }

    /// Whether `card` is dirty.
    #[must_use]
    pub fn is_dirty(&self, card: Card) -> bool {
        self.value(card) == DIRTY_CARD
    }

    /// Whether `card` is clean.
    #[must_use]
    pub fn is_clean(&self, card: Card) -> bool {
        self.value(card) == CLEAN_CARD
    }

    /// Mark `card` dirty.
    pub fn mark_dirty(&self, card: Card) {
        self.set_value(card, DIRTY_CARD);
    }

    /// Mark `card` clean.
    pub fn mark_clean(&self, card: Card) {
        self.set_value(card, CLEAN_CARD);
    }

    /// Mark `card` as belonging to a young region.
    pub fn mark_young(&self, card: Card) {
        self.set_value(card, YOUNG_CARD);
    }

    /// Dirty `card` unless it is young or already dirty.
    ///
    /// Returns `true` if this call transitioned the card to dirty, in which
    /// case the caller must log it for refinement.
    pub fn try_mark_dirty(&self, card: Card) -> bool {
        let slot = &self.cards[card.0];
        let mut current = slot.load(Ordering::Relaxed);
        loop {
            if current == DIRTY_CARD || current == YOUNG_CARD {
                return false;
            }
            match slot.compare_exchange_weak(
                current,
                DIRTY_CARD,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Reset every card to clean.
    pub fn clear(&self) {
        for card in &*self.cards {
            card.store(CLEAN_CARD, Ordering::Relaxed);
        }
    }

    /// Iterate over the cards currently dirty.
    pub fn dirty_cards(&self) -> impl Iterator<Item = Card> + '_ {
        self.cards
            .iter()
            .enumerate()
            .filter(|(_, value)| value.load(Ordering::Relaxed) == DIRTY_CARD)
            .map(|(index, _)| Card(index))
    }
}

impl fmt::Debug for CardTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CardTable")
            .field("heap_base", &self.heap_base)
            .field("card_size", &self.card_size())
            .field("len", &self.cards.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_table_is_clean() {
        let table = CardTable::with_cards(16);
        assert_eq!(table.len(), 16);
        assert!((0..16).all(|i| table.is_clean(Card::new(i))));
        assert_eq!(table.dirty_cards().count(), 0);
    }

    #[test]
    fn test_card_for_address() {
        let table = CardTable::new(0x1_0000, 0x1000, 512);
        assert_eq!(table.card_for(0x1_0000), Some(Card::new(0)));
        assert_eq!(table.card_for(0x1_01ff), Some(Card::new(0)));
        assert_eq!(table.card_for(0x1_0200), Some(Card::new(1)));
        assert_eq!(table.card_for(0x1_0fff), Some(Card::new(7)));
        assert_eq!(table.card_for(0x1_1000), None);
        assert_eq!(table.card_for(0xffff), None);
        assert_eq!(table.addr_for(Card::new(3)), 0x1_0600);
    }

    #[test]
    fn test_try_mark_dirty_only_once() {
        let table = CardTable::with_cards(4);
        let card = Card::new(2);
        assert!(table.try_mark_dirty(card));
        assert!(!table.try_mark_dirty(card));
        assert!(table.is_dirty(card));

        table.mark_clean(card);
        assert!(table.try_mark_dirty(card));
    }

    #[test]
    fn test_young_cards_are_filtered() {
        let table = CardTable::with_cards(4);
        let card = Card::new(1);
        table.mark_young(card);
        assert!(!table.try_mark_dirty(card));
        assert_eq!(table.value(card), YOUNG_CARD);
    }

    #[test]
    fn test_cards_order_by_address() {
        let table = CardTable::with_cards(8);
        let low = Card::new(1);
        let high = Card::new(6);
        assert!(low < high);
        assert!(table.addr_for(low) < table.addr_for(high));
    }

    #[test]
    #[should_panic(expected = "card_size must be a power of 2")]
    fn test_rejects_odd_card_size() {
        let _ = CardTable::new(0, 4096, 500);
    }
}

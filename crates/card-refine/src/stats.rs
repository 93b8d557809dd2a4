//! Refinement statistics.

use std::ops::{Add, AddAssign, Sub};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Counters collected while refining cards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefinementStats {
    /// Time spent refining buffers.
    pub refinement_time: Duration,
    /// Cards refined, including those discarded by the clean phase.
    pub refined_cards: usize,
    /// Cards found already clean and discarded before refinement.
    pub precleaned_cards: usize,
    /// Cards logged by the write barrier.
    pub dirtied_cards: usize,
}

impl RefinementStats {
    /// All counters zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            refinement_time: Duration::ZERO,
            refined_cards: 0,
            precleaned_cards: 0,
            dirtied_cards: 0,
        }
    }

    /// Refined cards per millisecond, or zero if no time was recorded.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn refinement_rate_ms(&self) -> f64 {
        let ms = self.refinement_time.as_secs_f64() * 1000.0;
        if ms > 0.0 {
            self.refined_cards as f64 / ms
        } else {
            0.0
        }
    }

    /// Reset every counter.
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

impl Add for RefinementStats {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            refinement_time: self.refinement_time + rhs.refinement_time,
            refined_cards: self.refined_cards + rhs.refined_cards,
            precleaned_cards: self.precleaned_cards + rhs.precleaned_cards,
            dirtied_cards: self.dirtied_cards + rhs.dirtied_cards,
        }
    }
}

impl AddAssign for RefinementStats {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

/// Difference between two snapshots. Saturates at zero.
impl Sub for RefinementStats {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self {
            refinement_time: self.refinement_time.saturating_sub(rhs.refinement_time),
            refined_cards: self.refined_cards.saturating_sub(rhs.refined_cards),
            precleaned_cards: self.precleaned_cards.saturating_sub(rhs.precleaned_cards),
            dirtied_cards: self.dirtied_cards.saturating_sub(rhs.dirtied_cards),
        }
    }
}

/// Statistics cells updated by one thread and read by others.
///
/// Each field is updated independently, so a concurrent snapshot may mix
/// counts from before and after an update.
#[derive(Debug, Default)]
pub struct SharedRefinementStats {
    refinement_nanos: AtomicU64,
    refined_cards: AtomicUsize,
    precleaned_cards: AtomicUsize,
    dirtied_cards: AtomicUsize,
}

impl SharedRefinementStats {
    /// All counters zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            refinement_nanos: AtomicU64::new(0),
            refined_cards: AtomicUsize::new(0),
            precleaned_cards: AtomicUsize::new(0),
            dirtied_cards: AtomicUsize::new(0),
        }
    }

    /// Accumulate `stats`.
    #[allow(clippy::cast_possible_truncation)]
    pub fn add(&self, stats: &RefinementStats) {
        self.refinement_nanos
            .fetch_add(stats.refinement_time.as_nanos() as u64, Ordering::Relaxed);
        self.refined_cards
            .fetch_add(stats.refined_cards, Ordering::Relaxed);
        self.precleaned_cards
            .fetch_add(stats.precleaned_cards, Ordering::Relaxed);
        self.dirtied_cards
            .fetch_add(stats.dirtied_cards, Ordering::Relaxed);
    }

    /// Current totals.
    #[must_use]
    pub fn snapshot(&self) -> RefinementStats {
        RefinementStats {
            refinement_time: Duration::from_nanos(self.refinement_nanos.load(Ordering::Relaxed)),
            refined_cards: self.refined_cards.load(Ordering::Relaxed),
            precleaned_cards: self.precleaned_cards.load(Ordering::Relaxed),
            dirtied_cards: self.dirtied_cards.load(Ordering::Relaxed),
        }
    }

    /// Current totals, resetting every counter to zero.
    pub fn take(&self) -> RefinementStats {
        RefinementStats {
            refinement_time: Duration::from_nanos(self.refinement_nanos.swap(0, Ordering::Relaxed)),
            refined_cards: self.refined_cards.swap(0, Ordering::Relaxed),
            precleaned_cards: self.precleaned_cards.swap(0, Ordering::Relaxed),
            dirtied_cards: self.dirtied_cards.swap(0, Ordering::Relaxed),
        }
    }
}

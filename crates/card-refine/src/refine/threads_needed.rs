//! Prediction of how many refinement threads should be running.

use std::time::Duration;

use crate::policy::RefinePolicy;

const ONE_HOUR_MS: f64 = 60.0 * 60.0 * 1000.0;

/// Remaining adjustment periods above which the thread estimate is rounded
/// down rather than up.
const ROUND_DOWN_PERIODS: f64 = 5.0;

/// Estimates the refinement threads needed to bring the pending cards down
/// to the target by the next pause.
#[derive(Debug, Clone, PartialEq)]
pub struct ThreadsNeeded {
    update_period_ms: f64,
    threads_needed: u32,
    predicted_time_until_next_gc_ms: f64,
    predicted_cards_at_next_gc: usize,
}

impl ThreadsNeeded {
    /// Create a predictor that is re-evaluated every `update_period`.
    #[must_use]
    pub fn new(update_period: Duration) -> Self {
        Self {
            update_period_ms: update_period.as_secs_f64() * 1000.0,
            threads_needed: 0,
            predicted_time_until_next_gc_ms: 0.0,
            predicted_cards_at_next_gc: 0,
        }
    }

    /// Threads needed as of the last update.
    #[must_use]
    pub const fn threads_needed(&self) -> u32 {
        self.threads_needed
    }

    /// Predicted milliseconds until the next pause, zero if unknown.
    #[must_use]
    pub const fn predicted_time_until_next_gc_ms(&self) -> f64 {
        self.predicted_time_until_next_gc_ms
    }

    /// Predicted pending cards when the next pause starts.
    #[must_use]
    pub const fn predicted_cards_at_next_gc(&self) -> usize {
        self.predicted_cards_at_next_gc
    }

    /// Recompute the estimate.
    ///
    /// `active_threads` is the number currently wanted, `num_cards` the
    /// current backlog and `target_num_cards` the backlog the pool should
    /// leave behind at the next pause.
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn update(
        &mut self,
        policy: &dyn RefinePolicy,
        active_threads: u32,
        available_bytes: usize,
        num_cards: usize,
        target_num_cards: usize,
    ) {
        // Time until the next pause from the remaining allocation budget.
        // Without an allocation rate there is no telling, so assume none.
        let alloc_bytes_rate = policy.predict_alloc_rate_ms();
        self.predicted_time_until_next_gc_ms = if alloc_bytes_rate > 0.0 {
            // Large heaps with slow allocation could otherwise predict times
            // big enough to overflow later arithmetic.
            (available_bytes as f64 / alloc_bytes_rate).min(ONE_HOUR_MS)
        } else {
            0.0
        };

        // No incoming cards when time is short: mutator refinement holds the
        // backlog on target for the final stretch.
        let time_ms = self.predicted_time_until_next_gc_ms;
        let incoming_cards = if time_ms > self.update_period_ms {
            (policy.predict_dirtied_cards_rate_ms() * time_ms) as usize
        } else {
            0
        };
        let total_cards = num_cards.saturating_add(incoming_cards);
        self.predicted_cards_at_next_gc = total_cards;

        if total_cards <= target_num_cards {
            self.threads_needed = 0;
            return;
        }

        // Estimates are unstable when time is short. Keep what is running,
        // counting the primary thread as running.
        if time_ms <= self.update_period_ms {
            self.threads_needed = active_threads.max(1);
            return;
        }

        let cards_needed = total_cards - target_num_cards;
        let refine_rate = policy.predict_concurrent_refine_rate_ms();
        if refine_rate <= 0.0 {
            // Excess cards but no idea how fast a thread goes. Start with one.
            self.threads_needed = 1;
            return;
        }

        let thread_capacity = refine_rate * time_ms;
        let mut nthreads = cards_needed as f64 / thread_capacity;
        // Delay refinement while there is plenty of time, but do not fall
        // short when the pause is near.
        if time_ms > ROUND_DOWN_PERIODS * self.update_period_ms {
            nthreads = nthreads.floor();
        } else {
            nthreads = nthreads.ceil();
        }
        self.threads_needed = nthreads.min(f64::from(u32::MAX)) as u32;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::FixedRatePolicy;

    fn predictor() -> ThreadsNeeded {
        ThreadsNeeded::new(Duration::from_millis(50))
    }

    #[test]
    fn test_below_target_needs_no_threads() {
        let policy = FixedRatePolicy::new()
            .with_alloc_rate_ms(1000.0)
            .with_dirtied_cards_rate_ms(1.0);
        let mut needed = predictor();
        // 100ms until GC, 100 incoming cards.
        needed.update(&policy, 2, 100_000, 50, 1000);
        assert_eq!(needed.threads_needed(), 0);
        assert!((needed.predicted_time_until_next_gc_ms() - 100.0).abs() < 1e-9);
        assert_eq!(needed.predicted_cards_at_next_gc(), 150);
    }

    #[test]
    fn test_unknown_time_keeps_active_threads() {
        let policy = FixedRatePolicy::new();
        let mut needed = predictor();
        needed.update(&policy, 3, 1 << 20, 500, 100);
        assert_eq!(needed.threads_needed(), 3);
        needed.update(&policy, 0, 1 << 20, 500, 100);
        assert_eq!(needed.threads_needed(), 1);
        assert_eq!(needed.predicted_cards_at_next_gc(), 500);
    }

    #[test]
    fn test_unknown_refine_rate_requests_one_thread() {
        let policy = FixedRatePolicy::new().with_alloc_rate_ms(1.0);
        let mut needed = predictor();
        needed.update(&policy, 0, 1_000, 500, 100);
        assert_eq!(needed.threads_needed(), 1);
    }

    #[test]
    fn test_rounding_depends_on_time_left() {
        // 2000 excess cards, 1 card/ms per thread.
        let policy = FixedRatePolicy::new()
            .with_alloc_rate_ms(1.0)
            .with_concurrent_refine_rate_ms(1.0);
        let mut needed = predictor();

        // 800ms left: 2.5 threads, plenty of time, round down.
        needed.update(&policy, 0, 800, 2100, 100);
        assert_eq!(needed.threads_needed(), 2);

        // 200ms left: 10 threads exactly.
        needed.update(&policy, 0, 200, 2100, 100);
        assert_eq!(needed.threads_needed(), 10);

        // 160ms left: 12.5 threads, close to the pause, round up.
        needed.update(&policy, 0, 160, 2100, 100);
        assert_eq!(needed.threads_needed(), 13);
    }

    #[test]
    fn test_time_capped_at_one_hour() {
        let policy = FixedRatePolicy::new().with_alloc_rate_ms(1e-6);
        let mut needed = predictor();
        needed.update(&policy, 0, usize::MAX, 0, 0);
        assert!((needed.predicted_time_until_next_gc_ms() - ONE_HOUR_MS).abs() < 1e-6);
    }
}

//! Refinement configuration.

use std::num::NonZeroUsize;
use std::thread;
use std::time::Duration;

/// Default number of cards per buffer.
pub const DEFAULT_BUFFER_CAPACITY: usize = 256;

/// Default size of the refinement thread pool.
pub const DEFAULT_MAX_REFINEMENT_THREADS: u32 = 4;

/// Default interval between thread-count adjustments.
pub const DEFAULT_ADJUST_THREADS_PERIOD: Duration = Duration::from_millis(50);

/// Tuning for the refinement engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefineConfig {
    /// Cards per buffer.
    pub buffer_capacity: usize,
    /// Refinement threads, the primary included.
    pub max_refinement_threads: u32,
    /// How often the primary thread re-evaluates the wanted thread count.
    pub adjust_threads_period: Duration,
    /// Whether refinement threads run at all. When off, refinement happens
    /// only in mutators and at pauses.
    pub use_concurrent_refinement: bool,
    /// Pending-cards target before the first pause has measured one.
    pub initial_pending_cards_target: Option<usize>,
    /// Ids available to mutators refining inline, which caps how many of
    /// them refine at once.
    pub mutator_id_count: u32,
}

impl Default for RefineConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            max_refinement_threads: DEFAULT_MAX_REFINEMENT_THREADS,
            adjust_threads_period: DEFAULT_ADJUST_THREADS_PERIOD,
            use_concurrent_refinement: true,
            initial_pending_cards_target: None,
            mutator_id_count: default_mutator_id_count(),
        }
    }
}

fn default_mutator_id_count() -> u32 {
    thread::available_parallelism()
        .map_or(1, NonZeroUsize::get)
        .try_into()
        .unwrap_or(u32::MAX)
}

impl RefineConfig {
    /// Set the cards per buffer.
    #[must_use]
    pub const fn with_buffer_capacity(mut self, buffer_capacity: usize) -> Self {
        self.buffer_capacity = buffer_capacity;
        self
    }

    /// Set the size of the refinement thread pool.
    #[must_use]
    pub const fn with_max_refinement_threads(mut self, threads: u32) -> Self {
        self.max_refinement_threads = threads;
        self
    }

    /// Set the thread-count adjustment interval.
    #[must_use]
    pub const fn with_adjust_threads_period(mut self, period: Duration) -> Self {
        self.adjust_threads_period = period;
        self
    }

    /// Enable or disable refinement threads.
    #[must_use]
    pub const fn with_concurrent_refinement(mut self, enabled: bool) -> Self {
        self.use_concurrent_refinement = enabled;
        self
    }

    /// Set the pending-cards target used until the first pause.
    #[must_use]
    pub const fn with_initial_pending_cards_target(mut self, target: usize) -> Self {
        self.initial_pending_cards_target = Some(target);
        self
    }

    /// Set the number of mutator refinement ids.
    #[must_use]
    pub const fn with_mutator_id_count(mut self, count: u32) -> Self {
        self.mutator_id_count = count;
        self
    }

    /// Number of refinement threads actually started.
    #[must_use]
    pub const fn refinement_threads(&self) -> u32 {
        if self.use_concurrent_refinement {
            self.max_refinement_threads
        } else {
            0
        }
    }

    /// Check the configuration for nonsensical values.
    ///
    /// # Panics
    ///
    /// Panics if the buffer capacity, the mutator id count, or the
    /// adjustment period is zero.
    pub fn validate(&self) {
        assert!(self.buffer_capacity > 0, "buffer_capacity must be non-zero");
        assert!(self.mutator_id_count > 0, "mutator_id_count must be non-zero");
        assert!(
            !self.adjust_threads_period.is_zero(),
            "adjust_threads_period must be non-zero"
        );
    }
}

//! Concurrent refinement control.
//!
//! [`ConcurrentRefine`] decides how many refinement threads should run. The
//! primary thread (worker 0) periodically asks the [`RefinePolicy`] how much
//! allocation remains before the next pause and how fast cards arrive and
//! are refined, then sets the wanted thread count so the backlog reaches the
//! pending-cards target by the time the pause starts. Secondary workers are
//! activated as the wanted count grows and deactivate themselves once it
//! drops below their id.
//!
//! When even every thread cannot keep up, or the pause is imminent, the
//! mutator refinement threshold is lowered to the target so application
//! threads help out.

pub mod thread;
pub mod threads_needed;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::RefineConfig;
use crate::policy::RefinePolicy;
use crate::qset::CardQueueSet;
use crate::stats::RefinementStats;

pub use thread::RefineThreadPool;
pub use threads_needed::ThreadsNeeded;

use thread::RefineWorker;

/// Pending-cards target before the first pause has produced one.
const UNINITIALIZED_TARGET: usize = usize::MAX;

#[derive(Debug)]
struct AdjustState {
    last_adjust: Instant,
    threads_needed: ThreadsNeeded,
}

/// Controller sizing the refinement thread pool.
pub struct ConcurrentRefine {
    qset: Arc<CardQueueSet>,
    policy: Arc<dyn RefinePolicy>,
    use_concurrent_refinement: bool,
    adjust_threads_period: Duration,
    pending_cards_target: AtomicUsize,
    threads_wanted: AtomicU32,
    needs_adjust: AtomicBool,
    adjust: Mutex<AdjustState>,
    workers: Box<[RefineWorker]>,
}

impl ConcurrentRefine {
    /// Create the controller and the state of its workers. No threads are
    /// started; see [`RefineThreadPool`].
    ///
    /// # Panics
    ///
    /// Panics if `config` fails [`RefineConfig::validate`].
    #[must_use]
    pub fn new(
        qset: Arc<CardQueueSet>,
        policy: Arc<dyn RefinePolicy>,
        config: &RefineConfig,
    ) -> Self {
        config.validate();
        let workers = (0..config.refinement_threads())
            .map(RefineWorker::new)
            .collect();
        Self {
            qset,
            policy,
            use_concurrent_refinement: config.use_concurrent_refinement,
            adjust_threads_period: config.adjust_threads_period,
            pending_cards_target: AtomicUsize::new(
                config
                    .initial_pending_cards_target
                    .unwrap_or(UNINITIALIZED_TARGET),
            ),
            threads_wanted: AtomicU32::new(0),
            needs_adjust: AtomicBool::new(false),
            adjust: Mutex::new(AdjustState {
                last_adjust: Instant::now(),
                threads_needed: ThreadsNeeded::new(config.adjust_threads_period),
            }),
            workers,
        }
    }

    /// The queue set being refined.
    #[must_use]
    pub const fn qset(&self) -> &Arc<CardQueueSet> {
        &self.qset
    }

    /// The prediction source.
    #[must_use]
    pub fn policy(&self) -> &dyn RefinePolicy {
        &*self.policy
    }

    /// Size of the worker pool.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn max_num_threads(&self) -> u32 {
        // The pool was built from a `u32` count.
        self.workers.len() as u32
    }

    /// Interval between periodic thread-count adjustments.
    #[must_use]
    pub const fn adjust_threads_period(&self) -> Duration {
        self.adjust_threads_period
    }

    pub(crate) fn worker(&self, worker_id: u32) -> &RefineWorker {
        &self.workers[worker_id as usize]
    }

    pub(crate) fn workers(&self) -> &[RefineWorker] {
        &self.workers
    }

    /// Backlog the pool aims to leave behind at the next pause.
    #[must_use]
    pub fn pending_cards_target(&self) -> usize {
        self.pending_cards_target.load(Ordering::Relaxed)
    }

    /// Whether a target has been configured or measured.
    #[must_use]
    pub fn is_pending_cards_target_initialized(&self) -> bool {
        self.pending_cards_target() != UNINITIALIZED_TARGET
    }

    /// Number of workers that should currently be running.
    #[must_use]
    pub fn threads_wanted(&self) -> u32 {
        self.threads_wanted.load(Ordering::Relaxed)
    }

    /// Whether worker `worker_id` should keep running.
    #[must_use]
    pub fn is_thread_wanted(&self, worker_id: u32) -> bool {
        worker_id < self.threads_wanted()
    }

    /// Whether a thread-count adjustment is pending.
    #[must_use]
    pub fn is_thread_adjustment_needed(&self) -> bool {
        self.needs_adjust.load(Ordering::Acquire)
    }

    /// Ask for an adjustment at the primary thread's next step.
    pub fn record_thread_adjustment_needed(&self) {
        self.needs_adjust.store(true, Ordering::Release);
    }

    /// Latest prediction of the time until the next pause.
    #[must_use]
    pub fn predicted_time_until_next_gc_ms(&self) -> f64 {
        self.adjust.lock().threads_needed.predicted_time_until_next_gc_ms()
    }

    /// Latest prediction of the pending cards at the next pause.
    #[must_use]
    pub fn predicted_cards_at_next_gc(&self) -> usize {
        self.adjust.lock().threads_needed.predicted_cards_at_next_gc()
    }

    fn minimum_pending_cards_target(&self) -> usize {
        (self.max_num_threads() as usize).saturating_mul(self.qset.buffer_capacity())
    }

    /// How long the idle primary thread waits before re-evaluating, or
    /// `None` to wait until explicitly activated.
    #[must_use]
    pub fn adjust_threads_wait(&self) -> Option<Duration> {
        // Before a target exists there is nothing to aim for, so the primary
        // sleeps until the first pause activates it.
        self.is_pending_cards_target_initialized()
            .then_some(self.adjust_threads_period)
    }

    /// Adjust the wanted thread count if an adjustment is pending or the
    /// period has elapsed.
    ///
    /// Returns `true` if an adjustment was made. Called by the primary
    /// thread.
    pub fn adjust_threads_periodically(&self) -> bool {
        let mut adjust = self.adjust.lock();
        if !self.is_thread_adjustment_needed()
            && adjust.last_adjust.elapsed() >= self.adjust_threads_period
        {
            self.record_thread_adjustment_needed();
        }
        if !self.is_thread_adjustment_needed() {
            return false;
        }
        // The policy may be unable to answer without blocking. Refine a bit
        // and retry on the next step rather than wait.
        let Some(available_bytes) = self.policy.available_bytes() else {
            return false;
        };
        self.adjust_threads_wanted(&mut adjust, available_bytes);
        self.needs_adjust.store(false, Ordering::Release);
        adjust.last_adjust = Instant::now();
        true
    }

    fn adjust_threads_wanted(&self, adjust: &mut AdjustState, available_bytes: usize) {
        let num_cards = self.qset.num_cards();
        let target = self.pending_cards_target();
        let old_wanted = self.threads_wanted();
        let max_threads = self.max_num_threads();

        adjust.threads_needed.update(
            &*self.policy,
            old_wanted,
            available_bytes,
            num_cards,
            target,
        );
        let mut new_wanted = adjust.threads_needed.threads_needed();
        let mut mutator_threshold = usize::MAX;
        if new_wanted > max_threads {
            // All threads together cannot reach the goal. Have mutators help,
            // using the target as threshold to get back under it fastest.
            mutator_threshold = target;
            new_wanted = max_threads;
        } else if self.in_last_adjustment_period(&adjust.threads_needed) {
            // Hold the backlog on target until the pause even as workers
            // deactivate.
            mutator_threshold = target;
        }
        self.threads_wanted.store(new_wanted, Ordering::Relaxed);
        self.qset.set_mutator_refinement_threshold(mutator_threshold);

        #[cfg(feature = "tracing")]
        crate::tracing::internal::log_threads_wanted(
            old_wanted,
            new_wanted,
            num_cards,
            target,
            mutator_threshold,
        );

        // The primary is running this, so it is already active.
        for worker_id in old_wanted.max(1)..new_wanted {
            self.activate(worker_id);
        }
    }

    fn in_last_adjustment_period(&self, threads_needed: &ThreadsNeeded) -> bool {
        threads_needed.predicted_time_until_next_gc_ms()
            <= self.adjust_threads_period.as_secs_f64() * 1000.0
    }

    /// Whether the next pause is predicted within one adjustment period.
    #[must_use]
    pub fn is_in_last_adjustment_period(&self) -> bool {
        self.in_last_adjustment_period(&self.adjust.lock().threads_needed)
    }

    /// Drop one wanted thread after the primary found the backlog on target.
    /// Called by the primary thread.
    pub fn reduce_threads_wanted(&self) {
        // A pending adjustment will decide for itself.
        if self.is_thread_adjustment_needed() {
            return;
        }
        let wanted = self.threads_wanted();
        if wanted > 0 {
            self.threads_wanted.store(wanted - 1, Ordering::Relaxed);
        }
        if self.is_in_last_adjustment_period() {
            self.qset
                .set_mutator_refinement_threshold(self.pending_cards_target());
        }
    }

    /// Refine one buffer for `worker_id` if the backlog exceeds `stop_at`.
    pub fn try_refinement_step(
        &self,
        worker_id: u32,
        stop_at: usize,
        stats: &mut RefinementStats,
    ) -> bool {
        self.qset
            .refine_completed_buffer_concurrently(worker_id, stop_at, stats)
    }

    /// Wake worker `worker_id`.
    ///
    /// # Panics
    ///
    /// Panics if there is no such worker.
    pub fn activate(&self, worker_id: u32) {
        self.worker(worker_id).activate();
    }

    /// Update the pending-cards target from the last pause and restart
    /// adjustment. Does nothing when concurrent refinement is disabled.
    ///
    /// `logged_cards_time_ms` is how long the pause spent on the
    /// `processed_logged_cards` cards left in the queues,
    /// `predicted_thread_buffer_cards` the cards expected to sit in thread
    /// buffers at the next pause, and `goal_ms` the pause time budget for
    /// logged cards.
    pub fn adjust_after_gc(
        &self,
        logged_cards_time_ms: f64,
        processed_logged_cards: usize,
        predicted_thread_buffer_cards: usize,
        goal_ms: f64,
    ) {
        if !self.use_concurrent_refinement {
            return;
        }
        self.update_pending_cards_target(
            logged_cards_time_ms,
            processed_logged_cards,
            predicted_thread_buffer_cards,
            goal_ms,
        );
        if self.max_num_threads() == 0 {
            // Mutators are the only refiners.
            self.qset
                .set_mutator_refinement_threshold(self.pending_cards_target());
        } else {
            // Card state may have changed drastically. Leave mutators alone
            // until the primary has re-evaluated, and wake it in case it
            // sleeps.
            self.qset.set_mutator_refinement_threshold(usize::MAX);
            self.record_thread_adjustment_needed();
            if self.is_pending_cards_target_initialized() {
                self.activate(0);
            }
        }
    }

    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    fn update_pending_cards_target(
        &self,
        logged_cards_time_ms: f64,
        processed_logged_cards: usize,
        predicted_thread_buffer_cards: usize,
        goal_ms: f64,
    ) {
        let minimum = self.minimum_pending_cards_target();
        if processed_logged_cards < minimum || logged_cards_time_ms <= 0.0 {
            return;
        }

        let old_target = self.pending_cards_target();
        let rate = processed_logged_cards as f64 / logged_cards_time_ms;
        let mut new_target = (goal_ms * rate) as usize;
        // Cards in thread buffers at the pause are not in the queues.
        new_target -= new_target.min(predicted_thread_buffer_cards);
        if self.is_pending_cards_target_initialized() {
            // Hysteresis: average with the previous target.
            new_target = new_target / 2 + old_target / 2 + (new_target & old_target & 1);
        }
        new_target = new_target.max(minimum);
        self.pending_cards_target
            .store(new_target, Ordering::Relaxed);

        #[cfg(feature = "tracing")]
        crate::tracing::internal::log_pending_cards_target(
            old_target,
            new_target,
            processed_logged_cards,
        );
    }

    /// Sum and reset the statistics of every worker.
    pub fn get_and_reset_refinement_stats(&self) -> RefinementStats {
        self.workers
            .iter()
            .fold(RefinementStats::new(), |total, worker| {
                total + worker.stats().take()
            })
    }
}

impl fmt::Debug for ConcurrentRefine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrentRefine")
            .field("max_num_threads", &self.max_num_threads())
            .field("threads_wanted", &self.threads_wanted())
            .field("pending_cards_target", &self.pending_cards_target())
            .field("needs_adjust", &self.is_thread_adjustment_needed())
            .finish_non_exhaustive()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::card::{Card, CardTable};
    use crate::policy::FixedRatePolicy;
    use crate::refiner::RemSetScanner;
    use crate::safepoint::Safepoint;

    struct KeepAll;

    impl RemSetScanner for KeepAll {
        fn clean_card_before_refine(&self, _card: &mut Card) -> bool {
            true
        }

        fn refine_card_concurrently(&self, _card: Card, _worker_id: u32) {}
    }

    fn controller(config: &RefineConfig, policy: Arc<dyn RefinePolicy>) -> ConcurrentRefine {
        let qset = Arc::new(CardQueueSet::new(
            config,
            Arc::new(CardTable::with_cards(64)),
            Arc::new(KeepAll),
            Arc::new(Safepoint::new()),
        ));
        ConcurrentRefine::new(qset, policy, config)
    }

    #[test]
    fn test_target_starts_uninitialized() {
        let config = RefineConfig::default();
        let cr = controller(&config, Arc::new(FixedRatePolicy::new()));
        assert!(!cr.is_pending_cards_target_initialized());
        assert_eq!(cr.adjust_threads_wait(), None);
        assert_eq!(cr.max_num_threads(), 4);
    }

    #[test]
    fn test_configured_target() {
        let config = RefineConfig::default().with_initial_pending_cards_target(100);
        let cr = controller(&config, Arc::new(FixedRatePolicy::new()));
        assert_eq!(cr.pending_cards_target(), 100);
        assert_eq!(cr.adjust_threads_wait(), Some(config.adjust_threads_period));
    }

    #[test]
    fn test_periodic_adjustment_waits_for_policy() {
        let config = RefineConfig::default().with_initial_pending_cards_target(0);
        let policy = Arc::new(FixedRatePolicy::new().with_available_bytes(None));
        let cr = controller(&config, Arc::clone(&policy) as Arc<dyn RefinePolicy>);
        cr.record_thread_adjustment_needed();
        assert!(!cr.adjust_threads_periodically());
        assert!(cr.is_thread_adjustment_needed());

        policy.set_available_bytes(Some(0));
        assert!(cr.adjust_threads_periodically());
        assert!(!cr.is_thread_adjustment_needed());
        assert_eq!(cr.threads_wanted(), 0);
    }

    #[test]
    fn test_reduce_threads_wanted_defers_to_adjustment() {
        let config = RefineConfig::default();
        let cr = controller(&config, Arc::new(FixedRatePolicy::new()));
        cr.threads_wanted.store(2, Ordering::Relaxed);
        cr.record_thread_adjustment_needed();
        cr.reduce_threads_wanted();
        assert_eq!(cr.threads_wanted(), 2);

        cr.needs_adjust.store(false, Ordering::Relaxed);
        cr.reduce_threads_wanted();
        assert_eq!(cr.threads_wanted(), 1);
        assert!(cr.is_thread_wanted(0));
        assert!(!cr.is_thread_wanted(1));
    }
}

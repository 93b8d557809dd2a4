//! Refinement worker threads.
//!
//! Worker 0 is the primary. It wakes at least once per adjustment period
//! (once a pending-cards target exists), re-evaluates the wanted thread
//! count, and refines only down to the target. Secondary workers sleep
//! until activated and then refine until the backlog is empty or they are
//! no longer wanted.
//!
//! Activation is a flag under each worker's own mutex. A worker deciding to
//! go idle reads and clears the flag in one critical section, so an
//! activation that races with deactivation keeps the worker running.

use std::fmt;
use std::io;
use std::panic;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

use super::ConcurrentRefine;
use crate::config::RefineConfig;
use crate::policy::RefinePolicy;
use crate::qset::CardQueueSet;
use crate::stats::{RefinementStats, SharedRefinementStats};

/// Per-worker activation state.
pub(crate) struct RefineWorker {
    id: u32,
    requested_active: Mutex<bool>,
    notifier: Condvar,
    should_terminate: AtomicBool,
    stats: SharedRefinementStats,
    activations: AtomicUsize,
}

impl RefineWorker {
    pub(crate) fn new(id: u32) -> Self {
        Self {
            id,
            requested_active: Mutex::new(false),
            notifier: Condvar::new(),
            should_terminate: AtomicBool::new(false),
            stats: SharedRefinementStats::new(),
            activations: AtomicUsize::new(0),
        }
    }

    const fn is_primary(&self) -> bool {
        self.id == 0
    }

    pub(crate) const fn stats(&self) -> &SharedRefinementStats {
        &self.stats
    }

    fn should_terminate(&self) -> bool {
        self.should_terminate.load(Ordering::Acquire)
    }

    /// Request the worker run. Redundant requests skip the notification,
    /// except after termination was requested.
    pub(crate) fn activate(&self) {
        let mut requested = self.requested_active.lock();
        if !*requested || self.should_terminate() {
            *requested = true;
            self.notifier.notify_one();
        }
    }

    fn request_terminate(&self) {
        self.should_terminate.store(true, Ordering::Release);
        self.activate();
    }

    /// Block until there is work. Returns `false` if the worker should exit.
    fn wait_for_completed_buffers(&self, cr: &ConcurrentRefine) -> bool {
        let mut requested = self.requested_active.lock();
        if self.is_primary() {
            if !*requested && !self.should_terminate() {
                // Spurious wakeups count as timeouts.
                match cr.adjust_threads_wait() {
                    Some(timeout) => {
                        self.notifier.wait_for(&mut requested, timeout);
                    }
                    None => self.notifier.wait(&mut requested),
                }
            }
            drop(requested);
            // Every wakeup of the primary re-evaluates the thread count.
            cr.record_thread_adjustment_needed();
        } else {
            while !*requested && !self.should_terminate() {
                self.notifier.wait(&mut requested);
            }
        }
        !self.should_terminate()
    }

    /// Decide whether to go idle.
    fn maybe_deactivate(&self, cr: &ConcurrentRefine) -> bool {
        // The primary stays up while an adjustment is pending.
        if self.is_primary() && cr.is_thread_adjustment_needed() {
            return false;
        }
        if cr.is_thread_wanted(self.id) {
            return false;
        }
        let mut requested = self.requested_active.lock();
        let was_requested = *requested;
        *requested = false;
        // Stay active if someone asked since the last check.
        !was_requested
    }

    fn do_refinement_step(&self, cr: &ConcurrentRefine, stats: &mut RefinementStats) {
        let before = *stats;
        if self.is_primary() {
            // An adjustment takes the place of refinement this round, so a
            // primary that just woke with nothing to do goes back to sleep
            // without premature refinement.
            if !cr.adjust_threads_periodically()
                && !cr.try_refinement_step(self.id, cr.pending_cards_target(), stats)
            {
                // Backlog is at or below target.
                cr.reduce_threads_wanted();
            }
        } else {
            // Secondaries ignore the target and drive the backlog down. The
            // primary notices when the target is reached and drops them.
            cr.try_refinement_step(self.id, 0, stats);
        }
        self.stats.add(&(*stats - before));
    }

    fn run(&self, cr: &ConcurrentRefine) {
        #[cfg(feature = "tracing")]
        let _span = crate::tracing::internal::trace_refine_worker(self.id).entered();

        let safepoint = Arc::clone(cr.qset().safepoint());
        let mut stats = RefinementStats::new();
        while self.wait_for_completed_buffers(cr) {
            let sts = safepoint.join();
            let mut active_start = stats;
            self.activations.fetch_add(1, Ordering::Relaxed);
            #[cfg(feature = "tracing")]
            crate::tracing::internal::log_activated(self.id, cr.qset().num_cards());

            while !self.should_terminate() {
                if sts.should_yield() {
                    #[cfg(feature = "tracing")]
                    crate::tracing::internal::log_paused(self.id, &(stats - active_start));
                    sts.yield_now();
                    // Restart the window rather than accumulate across
                    // pauses.
                    active_start = stats;
                    #[cfg(feature = "tracing")]
                    crate::tracing::internal::log_resumed(self.id);
                } else if self.maybe_deactivate(cr) {
                    break;
                } else {
                    self.do_refinement_step(cr, &mut stats);
                }
            }

            #[cfg(feature = "tracing")]
            crate::tracing::internal::log_deactivated(
                self.id,
                cr.qset().num_cards(),
                &(stats - active_start),
            );
            #[cfg(not(feature = "tracing"))]
            let _ = active_start;
            drop(sts);
        }
    }
}

impl fmt::Debug for RefineWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefineWorker")
            .field("id", &self.id)
            .field("requested_active", &*self.requested_active.lock())
            .field("should_terminate", &self.should_terminate())
            .finish_non_exhaustive()
    }
}

/// The refinement threads and their controller.
///
/// Threads are started on construction and stopped by [`stop`](Self::stop)
/// or on drop.
pub struct RefineThreadPool {
    controller: Arc<ConcurrentRefine>,
    handles: Vec<JoinHandle<()>>,
}

impl RefineThreadPool {
    /// Start the refinement threads for `qset`.
    ///
    /// No threads are started if concurrent refinement is disabled.
    ///
    /// # Errors
    ///
    /// Returns the error of a failed thread spawn. Threads started before
    /// the failure are stopped again.
    ///
    /// # Panics
    ///
    /// Panics if `config` fails [`RefineConfig::validate`].
    pub fn new(
        qset: Arc<CardQueueSet>,
        policy: Arc<dyn RefinePolicy>,
        config: &RefineConfig,
    ) -> io::Result<Self> {
        let controller = Arc::new(ConcurrentRefine::new(qset, policy, config));
        let mut pool = Self {
            controller,
            handles: Vec::new(),
        };
        for worker_id in 0..pool.controller.max_num_threads() {
            let controller = Arc::clone(&pool.controller);
            let handle = thread::Builder::new()
                .name(format!("card-refine-{worker_id}"))
                .spawn(move || controller.worker(worker_id).run(&controller))?;
            pool.handles.push(handle);
        }
        Ok(pool)
    }

    /// The controller deciding how many threads run.
    #[must_use]
    pub const fn controller(&self) -> &Arc<ConcurrentRefine> {
        &self.controller
    }

    /// Number of threads in the pool.
    #[must_use]
    pub fn max_num_threads(&self) -> u32 {
        self.controller.max_num_threads()
    }

    /// Wake worker `worker_id`.
    ///
    /// # Panics
    ///
    /// Panics if there is no such worker.
    pub fn activate(&self, worker_id: u32) {
        self.controller.activate(worker_id);
    }

    /// See [`ConcurrentRefine::adjust_after_gc`].
    pub fn adjust_after_gc(
        &self,
        logged_cards_time_ms: f64,
        processed_logged_cards: usize,
        predicted_thread_buffer_cards: usize,
        goal_ms: f64,
    ) {
        self.controller.adjust_after_gc(
            logged_cards_time_ms,
            processed_logged_cards,
            predicted_thread_buffer_cards,
            goal_ms,
        );
    }

    /// Sum and reset the statistics of every worker.
    pub fn get_and_reset_refinement_stats(&self) -> RefinementStats {
        self.controller.get_and_reset_refinement_stats()
    }

    /// Number of times worker `worker_id` has gone from idle to active.
    ///
    /// # Panics
    ///
    /// Panics if there is no such worker.
    #[must_use]
    pub fn activation_count(&self, worker_id: u32) -> usize {
        self.controller
            .worker(worker_id)
            .activations
            .load(Ordering::Relaxed)
    }

    /// Stop and join every thread.
    ///
    /// A thread parked at a safepoint exits once the safepoint ends.
    ///
    /// # Panics
    ///
    /// Re-raises the panic of the first worker that panicked, once every
    /// thread has been joined. Nothing is re-raised while the calling thread
    /// is already unwinding.
    pub fn stop(&mut self) {
        for worker in self.controller.workers() {
            worker.request_terminate();
        }
        let mut first_panic = None;
        for handle in self.handles.drain(..) {
            if let Err(payload) = handle.join() {
                #[cfg(feature = "tracing")]
                crate::tracing::internal::log_worker_panicked(payload.as_ref());
                first_panic.get_or_insert(payload);
            }
        }
        if let Some(payload) = first_panic {
            if !thread::panicking() {
                panic::resume_unwind(payload);
            }
        }
    }
}

impl Drop for RefineThreadPool {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for RefineThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefineThreadPool")
            .field("controller", &self.controller)
            .field("running", &self.handles.len())
            .finish()
    }
}

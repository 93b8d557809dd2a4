//! Refinement tracing support.
//!
//! When the `tracing` feature is enabled, this module provides structured
//! spans and events for worker activity and thread-count adjustments. Call
//! sites are gated on the feature.

#[cfg(feature = "tracing")]
pub(crate) mod internal {
    use tracing::{span, Level};

    use crate::stats::RefinementStats;

    /// Create a span covering the lifetime of a refinement worker.
    pub fn trace_refine_worker(worker_id: u32) -> span::Span {
        span!(Level::DEBUG, "refine_worker", worker_id = worker_id)
    }

    /// Log a worker starting to refine.
    pub fn log_activated(worker_id: u32, num_cards: usize) {
        tracing::debug!(worker_id, num_cards, "activated");
    }

    /// Log a worker going idle, with the work done while active.
    pub fn log_deactivated(worker_id: u32, num_cards: usize, delta: &RefinementStats) {
        tracing::debug!(
            worker_id,
            num_cards,
            refined = delta.refined_cards,
            precleaned = delta.precleaned_cards,
            dirtied = delta.dirtied_cards,
            time_us = u64::try_from(delta.refinement_time.as_micros()).unwrap_or(u64::MAX),
            "deactivated"
        );
    }

    /// Log a worker stopping for a safepoint.
    pub fn log_paused(worker_id: u32, delta: &RefinementStats) {
        tracing::debug!(
            worker_id,
            refined = delta.refined_cards,
            precleaned = delta.precleaned_cards,
            dirtied = delta.dirtied_cards,
            "paused"
        );
    }

    /// Log a worker resuming after a safepoint.
    pub fn log_resumed(worker_id: u32) {
        tracing::trace!(worker_id, "resumed");
    }

    /// Log a change in the wanted thread count.
    pub fn log_threads_wanted(
        old_wanted: u32,
        new_wanted: u32,
        num_cards: usize,
        pending_cards_target: usize,
        mutator_threshold: usize,
    ) {
        tracing::debug!(
            old_wanted,
            new_wanted,
            num_cards,
            pending_cards_target,
            mutator_threshold,
            "threads_wanted"
        );
    }

    /// Log a new pending-cards target computed after a pause.
    pub fn log_pending_cards_target(old_target: usize, new_target: usize, processed_cards: usize) {
        tracing::debug!(old_target, new_target, processed_cards, "pending_cards_target");
    }

    /// Log a worker that ended in a panic.
    pub fn log_worker_panicked(payload: &(dyn std::any::Any + Send)) {
        let message = payload
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
            .unwrap_or("<non-string panic payload>");
        tracing::error!(message, "refine_worker_panicked");
    }

    /// Log a mutator refining a buffer inline.
    pub fn log_mutator_refinement(worker_id: u32, refined_cards: usize, fully_processed: bool) {
        tracing::trace!(worker_id, refined_cards, fully_processed, "mutator_refinement");
    }
}

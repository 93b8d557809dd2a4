//! The shared set of completed card buffers.
//!
//! [`CardQueueSet`] owns the backlog of full buffers waiting for refinement,
//! the paused buffers parked across safepoints, and the accounting that
//! drives concurrent refinement. It is created once per heap and shared by
//! every thread through an `Arc`.
//!
//! # Accounting
//!
//! `num_cards` is an upper bound on the cards in the completed queue plus
//! the paused lists. It is raised before a buffer becomes reachable and
//! lowered only after a buffer has been removed, so concurrent readers never
//! see an undercount.
//!
//! # Safepoint-only operations
//!
//! Methods documented as safepoint-only assert that the set's [`Safepoint`]
//! is active. They also rely on every mutator being at rest, which the
//! caller must ensure.

use std::fmt;
use std::iter::FusedIterator;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::epoch;
use crossbeam::utils::{Backoff, CachePadded};
use parking_lot::Mutex;

use crate::buffer::{BufferAllocator, BufferNode, CardBuffer};
use crate::card::CardTable;
use crate::config::RefineConfig;
use crate::free_id::FreeIdSet;
use crate::local::{CardBufferQueue, ThreadKind};
use crate::queue::{Chain, Contended, NonblockingQueue, PausedBuffers};
use crate::refiner::{BufferRefiner, RemSetScanner, YieldSignal};
use crate::safepoint::Safepoint;
use crate::stats::RefinementStats;

/// Global backlog of dirty-card buffers.
pub struct CardQueueSet {
    allocator: BufferAllocator,
    card_table: Arc<CardTable>,
    scanner: Arc<dyn RemSetScanner>,
    safepoint: Arc<Safepoint>,
    completed: NonblockingQueue<BufferNode>,
    paused: PausedBuffers<BufferNode>,
    num_cards: CachePadded<AtomicUsize>,
    mutator_refinement_threshold: AtomicUsize,
    mutator_refined_cards: AtomicUsize,
    free_ids: FreeIdSet,
    concatenated_stats: Mutex<RefinementStats>,
    detached_stats: Mutex<RefinementStats>,
}

impl CardQueueSet {
    /// Create a set with its own buffer allocator.
    ///
    /// # Panics
    ///
    /// Panics if `config` fails [`RefineConfig::validate`].
    #[must_use]
    pub fn new(
        config: &RefineConfig,
        card_table: Arc<CardTable>,
        scanner: Arc<dyn RemSetScanner>,
        safepoint: Arc<Safepoint>,
    ) -> Self {
        config.validate();
        let allocator = BufferAllocator::new(config.buffer_capacity);
        Self::with_allocator(allocator, config, card_table, scanner, safepoint)
    }

    /// Create a set drawing buffers from `allocator`, so its buffers can be
    /// merged with other sets using the same pool.
    ///
    /// # Panics
    ///
    /// Panics if `config` fails [`RefineConfig::validate`].
    #[must_use]
    pub fn with_allocator(
        allocator: BufferAllocator,
        config: &RefineConfig,
        card_table: Arc<CardTable>,
        scanner: Arc<dyn RemSetScanner>,
        safepoint: Arc<Safepoint>,
    ) -> Self {
        config.validate();
        // Refinement threads use ids below the pool size; mutators get the
        // ids after them.
        let free_ids = FreeIdSet::new(config.max_refinement_threads, config.mutator_id_count);
        Self {
            allocator,
            card_table,
            scanner,
            safepoint,
            completed: NonblockingQueue::new(),
            paused: PausedBuffers::new(),
            num_cards: CachePadded::new(AtomicUsize::new(0)),
            mutator_refinement_threshold: AtomicUsize::new(usize::MAX),
            mutator_refined_cards: AtomicUsize::new(0),
            free_ids,
            concatenated_stats: Mutex::new(RefinementStats::new()),
            detached_stats: Mutex::new(RefinementStats::new()),
        }
    }

    /// The buffer pool.
    #[must_use]
    pub const fn allocator(&self) -> &BufferAllocator {
        &self.allocator
    }

    /// The card table the cards index into.
    #[must_use]
    pub fn card_table(&self) -> &CardTable {
        &self.card_table
    }

    /// The remembered-set scanner refinement reports to.
    #[must_use]
    pub fn scanner(&self) -> &dyn RemSetScanner {
        &*self.scanner
    }

    /// The safepoint coordinating refinement threads.
    #[must_use]
    pub fn safepoint(&self) -> &Arc<Safepoint> {
        &self.safepoint
    }

    /// Cards per buffer.
    #[must_use]
    pub fn buffer_capacity(&self) -> usize {
        self.allocator.buffer_capacity()
    }

    /// Upper bound on the cards waiting in completed and paused buffers.
    #[must_use]
    pub fn num_cards(&self) -> usize {
        self.num_cards.load(Ordering::Acquire)
    }

    /// Cards waiting for refinement. Same as [`num_cards`](Self::num_cards).
    #[must_use]
    pub fn total_pending_cards(&self) -> usize {
        self.num_cards()
    }

    /// Cards refined inline by mutators since the set was created.
    #[must_use]
    pub fn total_mutator_refined_cards(&self) -> usize {
        self.mutator_refined_cards.load(Ordering::Relaxed)
    }

    /// Backlog above which mutators refine inline. `usize::MAX` disables
    /// mutator refinement.
    #[must_use]
    pub fn mutator_refinement_threshold(&self) -> usize {
        self.mutator_refinement_threshold.load(Ordering::Relaxed)
    }

    /// Set the mutator refinement threshold.
    pub fn set_mutator_refinement_threshold(&self, value: usize) {
        self.mutator_refinement_threshold
            .store(value, Ordering::Relaxed);
    }

    fn add_num_cards(&self, cards: usize) {
        self.num_cards.fetch_add(cards, Ordering::AcqRel);
    }

    fn sub_num_cards(&self, cards: usize) {
        let old = self.num_cards.fetch_sub(cards, Ordering::AcqRel);
        debug_assert!(old >= cards, "num_cards underflow: {old} - {cards}");
    }

    fn assert_at_safepoint(&self) {
        assert!(
            self.safepoint.is_at_safepoint(),
            "operation requires a safepoint"
        );
    }

    /// Add a completed buffer to the backlog.
    pub fn enqueue_completed_buffer(&self, buffer: CardBuffer) {
        // Count first so a racing pop never drives the count negative.
        self.add_num_cards(buffer.len());
        let node = buffer.into_raw();
        // The old tail may be popped and released while we link to it.
        let _guard = epoch::pin();
        // SAFETY: The node came from a unique handle, so it is unlinked, and
        // released nodes are recycled only after the epoch advances past us.
        unsafe { self.completed.push(node) };
    }

    /// Enqueue a buffer filled by a thread of `kind`, refining one buffer
    /// inline if the calling mutator pushed the backlog past the threshold.
    pub fn handle_completed_buffer(
        &self,
        buffer: CardBuffer,
        kind: ThreadKind,
        stats: &mut RefinementStats,
    ) {
        self.enqueue_completed_buffer(buffer);

        if self.num_cards() <= self.mutator_refinement_threshold() {
            return;
        }
        // A buffer refined now would only be paused at once.
        if self.safepoint.should_yield() {
            return;
        }
        if kind != ThreadKind::Mutator {
            return;
        }

        let sts = self.safepoint.join();
        let Some(mut buffer) = self.get_completed_buffer(0) else {
            return;
        };
        let refined_before = stats.refined_cards;
        let worker_id = self.free_ids.claim();
        let fully_processed = self.refine_buffer_with(&mut buffer, worker_id.id(), &sts, stats);
        #[cfg(feature = "tracing")]
        crate::tracing::internal::log_mutator_refinement(
            worker_id.id(),
            stats.refined_cards - refined_before,
            fully_processed,
        );
        // Release the id before parking the buffer so another mutator can
        // use it.
        drop(worker_id);
        self.mutator_refined_cards
            .fetch_add(stats.refined_cards - refined_before, Ordering::Relaxed);
        self.handle_refined_buffer(buffer, fully_processed);
        drop(sts);
    }

    /// Remove a buffer from the backlog, unless it holds `stop_at` cards or
    /// fewer.
    ///
    /// Buffers paused in an earlier epoch are folded back first. May return
    /// `None` while buffers exist if another thread is mid-operation.
    pub fn get_completed_buffer(&self, stop_at: usize) -> Option<CardBuffer> {
        if self.num_cards() <= stop_at {
            return None;
        }
        self.enqueue_previous_paused_buffers();
        let buffer = self.dequeue_completed_buffer()?;
        self.sub_num_cards(buffer.len());
        Some(buffer)
    }

    fn dequeue_completed_buffer(&self) -> Option<CardBuffer> {
        let backoff = Backoff::new();
        loop {
            let guard = epoch::pin();
            match self.completed.try_pop() {
                // SAFETY: A popped node is owned by the popper alone.
                Ok(node) => return node.map(|node| unsafe { CardBuffer::from_raw(node) }),
                Err(Contended) => {
                    drop(guard);
                    backoff.spin();
                }
            }
        }
    }

    /// Refine one buffer from the backlog on behalf of refinement worker
    /// `worker_id`, if the backlog exceeds `stop_at`.
    ///
    /// Returns whether a buffer was processed. The caller must be a member of
    /// the set's suspendible thread set.
    pub fn refine_completed_buffer_concurrently(
        &self,
        worker_id: u32,
        stop_at: usize,
        stats: &mut RefinementStats,
    ) -> bool {
        let Some(mut buffer) = self.get_completed_buffer(stop_at) else {
            return false;
        };
        let fully_processed = self.refine_buffer(&mut buffer, worker_id, stats);
        self.handle_refined_buffer(buffer, fully_processed);
        true
    }

    /// Refine `buffer`, stopping early if the safepoint asks to yield.
    pub fn refine_buffer(
        &self,
        buffer: &mut CardBuffer,
        worker_id: u32,
        stats: &mut RefinementStats,
    ) -> bool {
        self.refine_buffer_with(buffer, worker_id, &*self.safepoint, stats)
    }

    fn refine_buffer_with<Y: YieldSignal + ?Sized>(
        &self,
        buffer: &mut CardBuffer,
        worker_id: u32,
        yield_signal: &Y,
        stats: &mut RefinementStats,
    ) -> bool {
        BufferRefiner::new(&*self.scanner, &self.card_table, yield_signal, worker_id)
            .refine(buffer, stats)
    }

    fn handle_refined_buffer(&self, buffer: CardBuffer, fully_processed: bool) {
        if fully_processed {
            debug_assert!(buffer.is_empty(), "refined buffer not fully consumed");
            self.allocator.release(buffer);
        } else {
            debug_assert!(!buffer.is_empty(), "paused buffer fully consumed");
            self.record_paused_buffer(buffer);
        }
    }

    /// Park a partially refined buffer until the pending safepoint is over.
    ///
    /// The caller must be a member of the suspendible thread set, so the
    /// epoch cannot advance during the call.
    pub fn record_paused_buffer(&self, buffer: CardBuffer) {
        debug_assert!(!self.safepoint.is_at_safepoint());
        // At most one paused list may exist, and it must be this epoch's.
        self.enqueue_previous_paused_buffers();
        // Paused cards stay counted so the backlog still reflects them.
        self.add_num_cards(buffer.len());
        // SAFETY: The node came from a unique handle and is unlinked.
        unsafe {
            self.paused
                .add(buffer.into_raw(), self.safepoint.safepoint_id());
        }
    }

    fn append_paused(&self, chain: Option<Chain<BufferNode>>) {
        if let Some((head, tail)) = chain {
            // Paused cards were never uncounted, so only the queue changes.
            let _guard = epoch::pin();
            // SAFETY: The chain was detached from the paused list, so we own
            // every node in it and it is null-terminated.
            unsafe { self.completed.append(head, tail) };
        }
    }

    /// Fold buffers paused in an earlier epoch back into the backlog.
    pub fn enqueue_previous_paused_buffers(&self) {
        self.append_paused(self.paused.take_previous(self.safepoint.safepoint_id()));
    }

    /// Fold every paused buffer back into the backlog. Safepoint-only.
    pub fn enqueue_all_paused_buffers(&self) {
        self.assert_at_safepoint();
        // SAFETY: At a safepoint nothing else touches the paused lists.
        self.append_paused(unsafe { self.paused.take_all() });
    }

    /// Detach every completed and paused buffer. Safepoint-only.
    #[must_use = "dropping the list releases its buffers"]
    pub fn take_all_completed_buffers(&self) -> BufferList {
        self.enqueue_all_paused_buffers();
        self.verify_num_cards();
        // SAFETY: At a safepoint nothing else touches the completed queue.
        let chain = unsafe { self.completed.take_all() };
        let num_cards = self.num_cards.swap(0, Ordering::AcqRel);
        BufferList::new(chain, num_cards, self.allocator.clone())
    }

    /// Release every completed and paused buffer. Safepoint-only.
    pub fn abandon_completed_buffers(&self) {
        for buffer in self.take_all_completed_buffers() {
            self.allocator.release(buffer);
        }
    }

    /// Move every buffer of `src` into this set. Safepoint-only.
    ///
    /// # Panics
    ///
    /// Panics if the sets do not share a buffer pool.
    pub fn merge_bufferlists(&self, src: &Self) {
        assert!(
            self.allocator.same_pool(&src.allocator),
            "merged queue sets must share an allocator"
        );
        self.assert_at_safepoint();
        let mut from = src.take_all_completed_buffers();
        if let Some((head, tail)) = from.take_chain() {
            self.add_num_cards(from.entry_count());
            let _guard = epoch::pin();
            // SAFETY: The chain was detached from `src`, so we own every node
            // and it is null-terminated.
            unsafe { self.completed.append(head, tail) };
        }
    }

    /// Hand the current buffer of `queue` to the backlog, or release it if
    /// it holds no cards. The handed-off cards count as dirtied by `queue`.
    pub fn flush_queue(&self, queue: &mut CardBufferQueue) {
        if let Some(buffer) = queue.take_buffer() {
            if buffer.is_empty() {
                self.allocator.release(buffer);
            } else {
                queue.stats_mut().dirtied_cards += buffer.len();
                self.enqueue_completed_buffer(buffer);
            }
        }
    }

    /// Discard the cards of `queue`, keeping its buffer for reuse.
    pub fn reset_queue(&self, queue: &mut CardBufferQueue) {
        if let Some(buffer) = queue.buffer_mut() {
            buffer.set_index(buffer.capacity());
        }
    }

    /// Drop all logged cards and statistics, as when a full collection makes
    /// them stale. Safepoint-only.
    ///
    /// `queues` must yield every live [`CardBufferQueue`] of this set.
    pub fn abandon_logs_and_stats<'q>(
        &self,
        queues: impl IntoIterator<Item = &'q mut CardBufferQueue>,
    ) {
        self.assert_at_safepoint();
        // Stay off until concurrent refinement decides otherwise.
        self.set_mutator_refinement_threshold(usize::MAX);
        for queue in queues {
            self.reset_queue(queue);
            queue.stats_mut().reset();
        }
        self.enqueue_all_paused_buffers();
        self.abandon_completed_buffers();
        self.detached_stats.lock().reset();
    }

    /// Flush `queue` and harvest its statistics. Safepoint-only.
    pub fn concatenate_log_and_stats(&self, queue: &mut CardBufferQueue) -> RefinementStats {
        self.assert_at_safepoint();
        // Flush before harvesting, since flushing may update the stats.
        if !queue.is_empty() {
            self.flush_queue(queue);
        }
        let stats = *queue.stats();
        queue.stats_mut().reset();
        stats
    }

    /// Flush every queue, harvest their statistics, and record the total
    /// with [`update_refinement_stats`](Self::update_refinement_stats).
    /// Safepoint-only.
    pub fn concatenate_logs_and_stats<'q>(
        &self,
        queues: impl IntoIterator<Item = &'q mut CardBufferQueue>,
    ) -> RefinementStats {
        self.assert_at_safepoint();
        // No inline refinement until the pause has re-tuned the threshold.
        self.set_mutator_refinement_threshold(usize::MAX);
        let mut total = RefinementStats::new();
        for queue in queues {
            total += self.concatenate_log_and_stats(queue);
        }
        self.update_refinement_stats(total);
        self.concatenated_refinement_stats()
    }

    /// Record the statistics harvested from live threads, fold in those of
    /// exited threads, and reclaim paused buffers. Safepoint-only.
    pub fn update_refinement_stats(&self, stats: RefinementStats) {
        self.assert_at_safepoint();
        self.enqueue_all_paused_buffers();
        self.verify_num_cards();
        let detached = std::mem::take(&mut *self.detached_stats.lock());
        *self.concatenated_stats.lock() = stats + detached;
    }

    /// Add the statistics of an exiting thread, resetting them.
    pub fn record_detached_refinement_stats(&self, stats: &mut RefinementStats) {
        *self.detached_stats.lock() += *stats;
        stats.reset();
    }

    /// Statistics recorded by the last
    /// [`update_refinement_stats`](Self::update_refinement_stats).
    #[must_use]
    pub fn concatenated_refinement_stats(&self) -> RefinementStats {
        *self.concatenated_stats.lock()
    }

    /// Check `num_cards` against the queue contents. Debug builds only.
    fn verify_num_cards(&self) {
        if cfg!(debug_assertions) {
            let mut actual = 0;
            // SAFETY: Only called at a safepoint with paused buffers folded
            // back, so nothing else touches the queue.
            unsafe { self.completed.for_each(|node| actual += node.size()) };
            let recorded = self.num_cards();
            debug_assert_eq!(actual, recorded, "num_cards out of sync with the queue");
        }
    }
}

impl Drop for CardQueueSet {
    fn drop(&mut self) {
        // SAFETY: `&mut self` gives exclusive access to both lists.
        let paused = unsafe { self.paused.take_all() };
        // SAFETY: As above.
        let completed = unsafe { self.completed.take_all() };
        for chain in [paused, completed] {
            drop(BufferList::new(chain, 0, self.allocator.clone()));
        }
        self.num_cards.store(0, Ordering::Relaxed);
    }
}

impl fmt::Debug for CardQueueSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CardQueueSet")
            .field("num_cards", &self.num_cards())
            .field(
                "mutator_refinement_threshold",
                &self.mutator_refinement_threshold(),
            )
            .field("allocator", &self.allocator)
            .finish_non_exhaustive()
    }
}

/// Buffers detached from a [`CardQueueSet`] at a safepoint.
///
/// Iterating yields each buffer. Buffers left in the list when it is dropped
/// are released to the pool.
pub struct BufferList {
    head: *mut BufferNode,
    tail: *mut BufferNode,
    entry_count: usize,
    allocator: BufferAllocator,
}

// SAFETY: The list owns its nodes exclusively.
unsafe impl Send for BufferList {}

impl BufferList {
    fn new(chain: Option<Chain<BufferNode>>, entry_count: usize, allocator: BufferAllocator) -> Self {
        let (head, tail) = chain.map_or((ptr::null_mut(), ptr::null_mut()), |(head, tail)| {
            (head.as_ptr(), tail.as_ptr())
        });
        Self {
            head,
            tail,
            entry_count,
            allocator,
        }
    }

    /// Cards recorded for the buffers when they were detached.
    #[must_use]
    pub const fn entry_count(&self) -> usize {
        self.entry_count
    }

    /// Whether no buffers remain.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    fn take_chain(&mut self) -> Option<Chain<BufferNode>> {
        let head = NonNull::new(std::mem::replace(&mut self.head, ptr::null_mut()))?;
        let tail = NonNull::new(std::mem::replace(&mut self.tail, ptr::null_mut()))?;
        Some((head, tail))
    }
}

impl Iterator for BufferList {
    type Item = CardBuffer;

    fn next(&mut self) -> Option<CardBuffer> {
        let node = NonNull::new(self.head)?;
        // SAFETY: The list owns every node it links.
        let node_ref = unsafe { node.as_ref() };
        self.head = node_ref.next();
        if self.head.is_null() {
            self.tail = ptr::null_mut();
        }
        node_ref.set_next(ptr::null_mut());
        // SAFETY: Unlinked above, and the list was its only owner.
        Some(unsafe { CardBuffer::from_raw(node) })
    }
}

impl FusedIterator for BufferList {}

impl Drop for BufferList {
    fn drop(&mut self) {
        while let Some(buffer) = self.next() {
            self.allocator.release(buffer);
        }
    }
}

impl fmt::Debug for BufferList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferList")
            .field("entry_count", &self.entry_count)
            .field("is_empty", &self.is_empty())
            .finish()
    }
}

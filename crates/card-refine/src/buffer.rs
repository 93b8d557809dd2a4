//! Card buffers and their pooled allocator.
//!
//! A [`BufferNode`] is a fixed-capacity array of cards plus an intrusive
//! link. Buffers fill from the top down: the live cards of a buffer are the
//! slots `[index, capacity)`, so a fresh buffer has `index == capacity` and a
//! full one has `index == 0`. Refinement consumes cards by raising `index`.
//!
//! Outside a queue a node is owned through a [`CardBuffer`], a move-only
//! handle. A node is therefore held by exactly one of: a thread-local queue,
//! the completed queue, a paused list, or the allocator's free list.

use std::cell::UnsafeCell;
use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicU32};
use std::sync::Arc;

use crossbeam::epoch;
use crossbeam_queue::SegQueue;

use crate::card::Card;
use crate::queue::QueueLink;
use crate::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

/// A fixed-capacity card buffer with an intrusive queue link.
pub struct BufferNode {
    next: AtomicPtr<BufferNode>,
    index: AtomicUsize,
    generation: AtomicU32,
    in_use: AtomicBool,
    slots: UnsafeCell<Box<[Card]>>,
}

// SAFETY: `slots` is only touched through the unique `CardBuffer` handle (or
// with exclusive access at a safepoint). Every other field is atomic.
unsafe impl Send for BufferNode {}

// SAFETY: See Send impl. Shared references are only used for `next` by the
// queues and for the atomic bookkeeping fields.
unsafe impl Sync for BufferNode {}

// SAFETY: `next_link` always returns the `next` field, which only queues and
// paused lists write.
unsafe impl QueueLink for BufferNode {
    fn next_link(&self) -> &AtomicPtr<Self> {
        &self.next
    }
}

impl BufferNode {
    fn new(capacity: usize) -> Self {
        Self {
            next: AtomicPtr::new(ptr::null_mut()),
            index: AtomicUsize::new(capacity),
            generation: AtomicU32::new(0),
            in_use: AtomicBool::new(false),
            slots: UnsafeCell::new(vec![Card::default(); capacity].into_boxed_slice()),
        }
    }

    /// Number of card slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        // SAFETY: The slot array is never reallocated, only its elements are
        // written, so reading the length is always sound.
        unsafe { (&*self.slots.get()).len() }
    }

    /// First live slot.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index.load(Ordering::Relaxed)
    }

    /// Number of live cards.
    #[must_use]
    pub fn size(&self) -> usize {
        self.capacity() - self.index()
    }

    pub(crate) fn next(&self) -> *mut Self {
        self.next.load(Ordering::Relaxed)
    }

    pub(crate) fn set_next(&self, next: *mut Self) {
        self.next.store(next, Ordering::Relaxed);
    }
}

impl fmt::Debug for BufferNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferNode")
            .field("index", &self.index())
            .field("capacity", &self.capacity())
            .field("generation", &self.generation.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Unique owner of a [`BufferNode`] outside of any queue.
///
/// The handle records the node generation it was issued for; debug builds
/// check it on release to catch stale handles. Dropping a handle without
/// releasing it leaks the node.
#[must_use = "a CardBuffer must be enqueued or released"]
pub struct CardBuffer {
    node: NonNull<BufferNode>,
    generation: u32,
}

// SAFETY: The handle is the only owner of the node's card slots.
unsafe impl Send for CardBuffer {}

impl CardBuffer {
    fn node(&self) -> &BufferNode {
        // SAFETY: The handle keeps the node allocated.
        unsafe { self.node.as_ref() }
    }

    /// Number of card slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.node().capacity()
    }

    /// First live slot.
    #[must_use]
    pub fn index(&self) -> usize {
        self.node().index()
    }

    /// Set the first live slot.
    ///
    /// # Panics
    ///
    /// Panics if `index` exceeds the capacity.
    pub fn set_index(&mut self, index: usize) {
        assert!(index <= self.capacity(), "buffer index out of range");
        self.node().index.store(index, Ordering::Relaxed);
    }

    /// Number of live cards.
    #[must_use]
    pub fn len(&self) -> usize {
        self.node().size()
    }

    /// Whether the buffer holds no live cards.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index() == self.capacity()
    }

    /// Whether no further card can be added.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.index() == 0
    }

    /// Generation of the node when this handle was issued.
    #[must_use]
    pub const fn generation(&self) -> u32 {
        self.generation
    }

    /// Add `card` below the live range. Returns `false` if the buffer is full.
    pub fn try_push(&mut self, card: Card) -> bool {
        let index = self.index();
        if index == 0 {
            return false;
        }
        let index = index - 1;
        self.slots_mut()[index] = card;
        self.node().index.store(index, Ordering::Relaxed);
        true
    }

    /// The live cards.
    #[must_use]
    pub fn cards(&self) -> &[Card] {
        let index = self.index();
        // SAFETY: The handle is the unique owner of the slots, and no `&mut`
        // to them can coexist with this `&self` borrow.
        let slots: &[Card] = unsafe { &*self.node().slots.get() };
        &slots[index..]
    }

    /// Every slot, live or not.
    pub fn slots_mut(&mut self) -> &mut [Card] {
        // SAFETY: The handle is the unique owner of the slots, and `&mut self`
        // rules out other borrows through it. Queues never touch the slots.
        let slots: &mut Box<[Card]> = unsafe { &mut *self.node().slots.get() };
        slots
    }

    /// Give up the handle, leaving the node to be owned by a queue or list.
    pub(crate) fn into_raw(self) -> NonNull<BufferNode> {
        self.node
    }

    /// Reclaim ownership of a node taken out of a queue or list.
    ///
    /// # Safety
    ///
    /// `node` must come from [`into_raw`](Self::into_raw) and the caller must
    /// be its only owner.
    pub(crate) unsafe fn from_raw(node: NonNull<BufferNode>) -> Self {
        // SAFETY: Caller guarantees the node is live.
        let generation = unsafe { node.as_ref() }.generation.load(Ordering::Relaxed);
        Self { node, generation }
    }
}

impl fmt::Debug for CardBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CardBuffer")
            .field("index", &self.index())
            .field("capacity", &self.capacity())
            .field("generation", &self.generation)
            .finish()
    }
}

/// A node pointer parked on the free list.
struct FreeNode(NonNull<BufferNode>);

// SAFETY: Free nodes are owned by the free list alone.
unsafe impl Send for FreeNode {}

struct AllocatorInner {
    buffer_capacity: usize,
    free_list: SegQueue<FreeNode>,
    free_count: AtomicUsize,
    pending_count: AtomicUsize,
    allocated_count: AtomicUsize,
}

impl AllocatorInner {
    fn push_free(&self, node: FreeNode) {
        self.free_list.push(node);
        self.free_count.fetch_add(1, Ordering::Relaxed);
        self.pending_count.fetch_sub(1, Ordering::Relaxed);
    }
}

impl Drop for AllocatorInner {
    fn drop(&mut self) {
        while let Some(FreeNode(node)) = self.free_list.pop() {
            // SAFETY: Nodes on the free list came from `Box::into_raw` in
            // `allocate` and nothing else references them anymore.
            drop(unsafe { Box::from_raw(node.as_ptr()) });
        }
    }
}

/// Pooled allocator of card buffers.
///
/// Released buffers return to the free list only after a `crossbeam-epoch`
/// grace period, so a thread still inside a queue operation that observed the
/// node can never see it reused. The allocator is a cheap clonable handle;
/// all clones share one pool.
///
/// Buffer memory comes from the global allocator, which aborts the process
/// on exhaustion. Losing card data is never an option, so there is no
/// fallible path.
#[derive(Clone)]
pub struct BufferAllocator {
    inner: Arc<AllocatorInner>,
}

impl BufferAllocator {
    /// Create an allocator of buffers with `buffer_capacity` card slots.
    ///
    /// # Panics
    ///
    /// Panics if `buffer_capacity` is zero.
    #[must_use]
    pub fn new(buffer_capacity: usize) -> Self {
        assert!(buffer_capacity > 0, "buffer capacity must be non-zero");
        Self {
            inner: Arc::new(AllocatorInner {
                buffer_capacity,
                free_list: SegQueue::new(),
                free_count: AtomicUsize::new(0),
                pending_count: AtomicUsize::new(0),
                allocated_count: AtomicUsize::new(0),
            }),
        }
    }

    /// Card slots per buffer.
    #[must_use]
    pub fn buffer_capacity(&self) -> usize {
        self.inner.buffer_capacity
    }

    /// Buffers ready for reuse.
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.inner.free_count.load(Ordering::Relaxed)
    }

    /// Released buffers still waiting out their grace period.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.pending_count.load(Ordering::Relaxed)
    }

    /// Buffers ever created and not yet destroyed.
    #[must_use]
    pub fn allocated_count(&self) -> usize {
        self.inner.allocated_count.load(Ordering::Relaxed)
    }

    /// Whether two handles share one pool.
    #[must_use]
    pub fn same_pool(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Hand out an empty buffer, reusing a free one when available.
    pub fn allocate(&self) -> CardBuffer {
        let node = if let Some(FreeNode(node)) = self.inner.free_list.pop() {
            self.inner.free_count.fetch_sub(1, Ordering::Relaxed);
            node
        } else {
            self.inner.allocated_count.fetch_add(1, Ordering::Relaxed);
            let boxed = Box::new(BufferNode::new(self.inner.buffer_capacity));
            // SAFETY: `Box::into_raw` never returns null.
            unsafe { NonNull::new_unchecked(Box::into_raw(boxed)) }
        };

        // SAFETY: The node is either fresh or came off the free list, so we
        // are its only owner.
        let node_ref = unsafe { node.as_ref() };
        let was_in_use = node_ref.in_use.swap(true, Ordering::Relaxed);
        debug_assert!(!was_in_use, "buffer node handed out while still owned");
        debug_assert!(node_ref.next().is_null(), "free buffer node still linked");

        node_ref.index.store(node_ref.capacity(), Ordering::Relaxed);
        let generation = node_ref
            .generation
            .fetch_add(1, Ordering::Relaxed)
            .wrapping_add(1);
        CardBuffer { node, generation }
    }

    /// Return `buffer` to the pool once every concurrent queue operation that
    /// might still observe it has finished.
    pub fn release(&self, buffer: CardBuffer) {
        let node_ref = buffer.node();
        debug_assert_eq!(
            buffer.generation,
            node_ref.generation.load(Ordering::Relaxed),
            "stale CardBuffer handle released"
        );
        let was_in_use = node_ref.in_use.swap(false, Ordering::Relaxed);
        debug_assert!(was_in_use, "buffer node released twice");
        node_ref.set_next(ptr::null_mut());

        let node = FreeNode(buffer.into_raw());
        let inner = Arc::clone(&self.inner);
        inner.pending_count.fetch_add(1, Ordering::Relaxed);

        let guard = epoch::pin();
        guard.defer(move || inner.push_free(node));
        guard.flush();
    }
}

impl fmt::Debug for BufferAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferAllocator")
            .field("buffer_capacity", &self.buffer_capacity())
            .field("free", &self.free_count())
            .field("pending", &self.pending_count())
            .field("nodes", &self.allocated_count())
            .finish()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_buffer_is_empty() {
        let allocator = BufferAllocator::new(8);
        let buffer = allocator.allocate();
        assert_eq!(buffer.capacity(), 8);
        assert_eq!(buffer.index(), 8);
        assert!(buffer.is_empty());
        assert!(!buffer.is_full());
        assert!(buffer.cards().is_empty());
        allocator.release(buffer);
    }

    #[test]
    fn test_push_fills_downward() {
        let allocator = BufferAllocator::new(3);
        let mut buffer = allocator.allocate();
        assert!(buffer.try_push(Card::new(10)));
        assert!(buffer.try_push(Card::new(11)));
        assert!(buffer.try_push(Card::new(12)));
        assert!(buffer.is_full());
        assert!(!buffer.try_push(Card::new(13)));

        assert_eq!(buffer.cards(), &[Card::new(12), Card::new(11), Card::new(10)]);
        assert_eq!(buffer.len(), 3);
        allocator.release(buffer);
    }

    #[test]
    fn test_generation_advances_per_allocation() {
        let allocator = BufferAllocator::new(4);
        let first = allocator.allocate();
        let second = allocator.allocate();
        assert_eq!(first.generation(), 1);
        assert_eq!(second.generation(), 1);
        assert_eq!(allocator.allocated_count(), 2);
        allocator.release(first);
        allocator.release(second);
        assert_eq!(
            allocator.pending_count() + allocator.free_count(),
            2,
            "released buffers are either pending or free"
        );
    }

    #[test]
    fn test_reused_buffer_is_reset() {
        let allocator = BufferAllocator::new(4);
        let mut buffer = allocator.allocate();
        buffer.try_push(Card::new(1));
        allocator.release(buffer);

        // Drive the epoch until the release is published to the free list.
        for _ in 0..1024 {
            if allocator.free_count() > 0 {
                break;
            }
            epoch::pin().flush();
        }

        let buffer = allocator.allocate();
        assert!(buffer.is_empty());
        if allocator.allocated_count() == 1 {
            assert_eq!(buffer.generation(), 2, "reused node gets a new generation");
        }
        allocator.release(buffer);
    }

    #[test]
    #[should_panic(expected = "buffer index out of range")]
    fn test_set_index_bounds() {
        let allocator = BufferAllocator::new(4);
        let mut buffer = allocator.allocate();
        buffer.set_index(5);
    }
}

//! Side lists for buffers whose refinement was interrupted by a safepoint.
//!
//! A partially refined buffer cannot go straight back to the completed
//! queue: the thread that paused would likely pop it again immediately,
//! before the safepoint it is yielding to has run. Instead it is parked on a
//! list tagged with the current safepoint epoch. Any running thread may fold
//! a list back into the completed queue once the epoch has moved on; at a
//! safepoint every list is folded back regardless of epoch.
//!
//! At most one list exists at a time. Lists from earlier epochs are taken by
//! a compare-exchange on the list pointer, and the list itself is reclaimed
//! through `crossbeam-epoch` because a concurrent taker may still be reading
//! its epoch tag.

use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::atomic::Ordering as StdOrdering;

use crossbeam::epoch::{self, Atomic, Owned};

use super::nonblocking::QueueLink;
use crate::sync::atomic::{AtomicPtr, Ordering};

/// A null-terminated chain of elements, first to last.
pub type Chain<T> = (NonNull<T>, NonNull<T>);

struct PausedList<T: QueueLink> {
    head: AtomicPtr<T>,
    tail: AtomicPtr<T>,
    epoch: u64,
}

// SAFETY: The list only links elements handed over by their owners.
unsafe impl<T: QueueLink + Send> Send for PausedList<T> {}

// SAFETY: All shared state is atomic.
unsafe impl<T: QueueLink + Send> Sync for PausedList<T> {}

impl<T: QueueLink> PausedList<T> {
    fn new(epoch: u64) -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            tail: AtomicPtr::new(ptr::null_mut()),
            epoch,
        }
    }

    /// Push `node` at the front.
    ///
    /// # Safety
    ///
    /// `node` must be valid, owned by the caller, and have a null link.
    unsafe fn add(&self, node: NonNull<T>) {
        let old_head = self.head.swap(node.as_ptr(), Ordering::AcqRel);
        if old_head.is_null() {
            debug_assert!(self.tail.load(Ordering::Relaxed).is_null());
            self.tail.store(node.as_ptr(), Ordering::Release);
        } else {
            // SAFETY: Caller guarantees `node` is valid.
            unsafe { node.as_ref() }
                .next_link()
                .store(old_head, Ordering::Release);
        }
    }

    /// Detach the chain.
    ///
    /// Only called once the list is unreachable, so no add can be racing.
    fn take(&self) -> Option<Chain<T>> {
        let head = self.head.swap(ptr::null_mut(), Ordering::AcqRel);
        let tail = self.tail.swap(ptr::null_mut(), Ordering::AcqRel);
        Some((NonNull::new(head)?, NonNull::new(tail)?))
    }
}

impl<T: QueueLink> Drop for PausedList<T> {
    fn drop(&mut self) {
        debug_assert!(
            self.head.load(Ordering::Relaxed).is_null(),
            "paused list dropped with buffers"
        );
    }
}

/// Epoch-tagged holding area for paused buffers.
pub struct PausedBuffers<T: QueueLink> {
    list: Atomic<PausedList<T>>,
}

impl<T: QueueLink + Send> PausedBuffers<T> {
    /// Create an empty holding area.
    #[must_use]
    pub fn new() -> Self {
        Self {
            list: Atomic::null(),
        }
    }

    /// Whether no list is installed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        let guard = epoch::pin();
        self.list.load(StdOrdering::Acquire, &guard).is_null()
    }

    /// Park `node` in the list for `current_epoch`, installing one if needed.
    ///
    /// The caller must have already taken any list from an earlier epoch
    /// (see [`take_previous`](Self::take_previous)) and must keep the epoch
    /// from advancing until this returns.
    ///
    /// # Safety
    ///
    /// `node` must be valid, owned by the caller, and have a null link.
    /// Ownership passes to the paused list.
    pub unsafe fn add(&self, node: NonNull<T>, current_epoch: u64) {
        let guard = epoch::pin();
        let mut current = self.list.load(StdOrdering::Acquire, &guard);
        if current.is_null() {
            let fresh = Owned::new(PausedList::new(current_epoch));
            match self.list.compare_exchange(
                current,
                fresh,
                StdOrdering::AcqRel,
                StdOrdering::Acquire,
                &guard,
            ) {
                Ok(installed) => current = installed,
                // Another thread installed a list first; ours is dropped.
                Err(err) => current = err.current,
            }
        }

        // SAFETY: Non-null, and protected by the guard from reclamation.
        let list = unsafe { current.deref() };
        debug_assert_eq!(
            list.epoch, current_epoch,
            "paused list from an earlier epoch was not folded back"
        );
        // SAFETY: Forwarded caller contract.
        unsafe { list.add(node) };
    }

    /// Take the list if it was parked in an epoch before `current_epoch`.
    ///
    /// Several threads may race here; exactly one of them gets the chain.
    pub fn take_previous(&self, current_epoch: u64) -> Option<Chain<T>> {
        let guard = epoch::pin();
        let previous = self.list.load(StdOrdering::Acquire, &guard);
        // SAFETY: Protected by the guard from reclamation.
        let list = unsafe { previous.as_ref() }?;
        if list.epoch == current_epoch {
            return None;
        }
        debug_assert!(list.epoch < current_epoch, "paused list from the future");

        self.list
            .compare_exchange(
                previous,
                epoch::Shared::null(),
                StdOrdering::AcqRel,
                StdOrdering::Acquire,
                &guard,
            )
            .ok()?;

        // We own the list now. Other takers may still be reading its epoch,
        // so the list itself lives until they unpin.
        let chain = list.take();
        // SAFETY: Unlinked above, so no new reader can reach it.
        unsafe { guard.defer_destroy(previous) };
        chain
    }

    /// Take the list regardless of epoch.
    ///
    /// # Safety
    ///
    /// No other operation on this holding area may run concurrently, as at a
    /// safepoint.
    pub unsafe fn take_all(&self) -> Option<Chain<T>> {
        // SAFETY: Exclusive access, so nothing can observe the list after it
        // is swapped out.
        let guard = unsafe { epoch::unprotected() };
        let list = self
            .list
            .swap(epoch::Shared::null(), StdOrdering::AcqRel, guard);
        if list.is_null() {
            return None;
        }
        // SAFETY: Exclusive access and the pointer is no longer shared.
        let owned = unsafe { list.into_owned() };
        owned.take()
    }
}

impl<T: QueueLink + Send> Default for PausedBuffers<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: QueueLink> Drop for PausedBuffers<T> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` gives exclusive access.
        let guard = unsafe { epoch::unprotected() };
        let list = self
            .list
            .swap(epoch::Shared::null(), StdOrdering::Relaxed, guard);
        if !list.is_null() {
            // SAFETY: Exclusive access.
            drop(unsafe { list.into_owned() });
        }
    }
}

impl<T: QueueLink> fmt::Debug for PausedBuffers<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = epoch::pin();
        let list = self.list.load(StdOrdering::Acquire, &guard);
        // SAFETY: Protected by the guard from reclamation.
        let epoch = unsafe { list.as_ref() }.map(|list| list.epoch);
        f.debug_struct("PausedBuffers")
            .field("epoch", &epoch)
            .finish()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    struct Node {
        value: usize,
        next: AtomicPtr<Node>,
    }

    unsafe impl QueueLink for Node {
        fn next_link(&self) -> &AtomicPtr<Self> {
            &self.next
        }
    }

    fn node(value: usize) -> NonNull<Node> {
        NonNull::from(Box::leak(Box::new(Node {
            value,
            next: AtomicPtr::new(ptr::null_mut()),
        })))
    }

    fn drain(chain: Option<Chain<Node>>) -> Vec<usize> {
        let mut values = Vec::new();
        let Some((head, tail)) = chain else {
            return values;
        };
        assert!(unsafe { tail.as_ref() }.next.load(Ordering::Relaxed).is_null());
        let mut current = head.as_ptr();
        while let Some(node) = NonNull::new(current) {
            let boxed = unsafe { Box::from_raw(node.as_ptr()) };
            current = boxed.next.load(Ordering::Relaxed);
            values.push(boxed.value);
        }
        values
    }

    #[test]
    fn test_same_epoch_is_not_taken() {
        let paused = PausedBuffers::new();
        unsafe { paused.add(node(1), 3) };
        assert!(paused.take_previous(3).is_none());
        assert!(!paused.is_empty());
        assert_eq!(drain(unsafe { paused.take_all() }), vec![1]);
        assert!(paused.is_empty());
    }

    #[test]
    fn test_previous_epoch_is_taken_once() {
        let paused = PausedBuffers::new();
        unsafe {
            paused.add(node(1), 3);
            paused.add(node(2), 3);
        }
        let mut values = drain(paused.take_previous(4));
        values.sort_unstable();
        assert_eq!(values, vec![1, 2]);
        assert!(paused.take_previous(4).is_none());
        assert!(paused.is_empty());
    }

    #[test]
    fn test_new_list_after_take() {
        let paused = PausedBuffers::new();
        unsafe { paused.add(node(1), 0) };
        assert_eq!(drain(paused.take_previous(1)), vec![1]);
        unsafe { paused.add(node(2), 1) };
        assert!(paused.take_previous(1).is_none());
        assert_eq!(drain(paused.take_previous(2)), vec![2]);
    }
}

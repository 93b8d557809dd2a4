//! Lock-free intrusive multi-producer/multi-consumer FIFO.
//!
//! The queue links its elements through a `next` field embedded in each
//! element (see [`QueueLink`]), so pushing and popping never allocate.
//!
//! # Representation
//!
//! `head` points at the oldest element and `tail` at the newest. The tail's
//! `next` holds a per-queue end marker rather than null, which lets a
//! concurrent [`try_pop`](NonblockingQueue::try_pop) tell "this element is the
//! last one" apart from "this element has already been claimed" (null).
//!
//! Between the tail exchange and the link of the old tail in
//! [`append`](NonblockingQueue::append) the list is logically split: the new
//! elements are reachable from `tail` but not yet from `head`. `try_pop`
//! tolerates that window by reporting [`Contended`] or an empty queue.
//!
//! # Reclamation
//!
//! The queue does not manage memory. An element that has been popped may
//! still be read by a concurrent `try_pop` or `append` that loaded it just
//! before it was claimed. Reusing such an element (pushing it again, here or
//! in another queue) before those operations finish is the ABA problem and
//! corrupts the list. Callers must defer reuse until every thread that might
//! hold a stale reference has passed a grace period; the card queue set does
//! this by pinning a `crossbeam-epoch` guard around every queue operation and
//! deferring buffer release through the same epoch.

use std::fmt;
use std::marker::PhantomData;
use std::ptr::{self, NonNull};

use crossbeam::utils::{Backoff, CachePadded};

use crate::sync::atomic::{AtomicPtr, Ordering};

/// Access to the intrusive link of a queue element.
///
/// # Safety
///
/// `next_link` must always return the same field of `self`, and nothing but
/// the queue may write that field while the element is linked into a queue.
pub unsafe trait QueueLink: Sized {
    /// The field the queue uses to chain this element to the next one.
    fn next_link(&self) -> &AtomicPtr<Self>;
}

/// A pop attempt lost a race with a concurrent operation. Retrying may
/// succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Contended;

impl fmt::Display for Contended {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("lost a race with a concurrent queue operation")
    }
}

/// Lock-free FIFO of intrusively linked elements.
///
/// Push and append are wait-free apart from the hardware exchange; pop is
/// lock-free and may report [`Contended`] when it loses a race.
pub struct NonblockingQueue<T: QueueLink> {
    head: CachePadded<AtomicPtr<T>>,
    tail: CachePadded<AtomicPtr<T>>,
    // The end marker is the address of this allocation. Being on the heap it
    // survives moves of the queue and never equals another queue's marker.
    end_anchor: Box<u8>,
    _marker: PhantomData<*mut T>,
}

// SAFETY: The queue only hands out elements it was given. Moving those
// between threads requires `T: Send`; all shared state is atomic.
unsafe impl<T: QueueLink + Send> Send for NonblockingQueue<T> {}

// SAFETY: See Send impl. Every `&self` operation goes through atomics.
unsafe impl<T: QueueLink + Send> Sync for NonblockingQueue<T> {}

impl<T: QueueLink> NonblockingQueue<T> {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            head: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
            tail: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
            end_anchor: Box::new(0),
            _marker: PhantomData,
        }
    }

    fn end_marker(&self) -> *mut T {
        ptr::from_ref::<u8>(&*self.end_anchor).cast_mut().cast::<T>()
    }

    fn is_end(&self, entry: *mut T) -> bool {
        entry == self.end_marker()
    }

    /// Whether the queue has no elements.
    ///
    /// The answer may be stale by the time it is returned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }

    /// Add `node` at the tail.
    ///
    /// # Safety
    ///
    /// - `node` must be valid, not linked into any queue, and have a null
    ///   `next` link.
    /// - `node` must stay valid until it is popped or taken, and after that
    ///   must not be freed or pushed again until every concurrent operation on
    ///   this queue has finished with it (see the module documentation).
    pub unsafe fn push(&self, node: NonNull<T>) {
        // SAFETY: Forwarded caller contract.
        unsafe { self.append(node, node) };
    }

    /// Add the pre-linked chain `first ..= last` at the tail.
    ///
    /// # Safety
    ///
    /// - Every element of the chain must satisfy the requirements of
    ///   [`push`](Self::push), except that elements before `last` link to
    ///   their successor.
    /// - `last` must have a null `next` link.
    pub unsafe fn append(&self, first: NonNull<T>, last: NonNull<T>) {
        // SAFETY: Caller guarantees `last` is valid.
        let last_link = unsafe { last.as_ref() }.next_link();
        debug_assert!(
            last_link.load(Ordering::Relaxed).is_null(),
            "appended chain must be terminated"
        );

        // Make `last` the new end of the queue. Later pushes extend after it;
        // this one tries to extend from the previous end.
        last_link.store(self.end_marker(), Ordering::Relaxed);
        let old_tail = self.tail.swap(last.as_ptr(), Ordering::AcqRel);

        match NonNull::new(old_tail) {
            None => {
                // The queue was empty. `try_pop` clears head before tail when
                // taking the last element, so head must be null here too.
                debug_assert!(
                    self.head.load(Ordering::Acquire).is_null(),
                    "empty queue with a head"
                );
            }
            Some(old_tail) => {
                // SAFETY: The caller's reclamation contract keeps `old_tail`
                // valid even if a concurrent pop has already claimed it.
                let old_link = unsafe { old_tail.as_ref() }.next_link();
                if old_link
                    .compare_exchange(
                        self.end_marker(),
                        first.as_ptr(),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    // Extended the list from the old tail. No other append can
                    // compete for it, and any racing pop now sees a successor.
                    return;
                }
                // A concurrent pop claimed the old tail, so the queue was
                // logically empty. Head is null or still the old tail,
                // depending on how far that pop has progressed.
                debug_assert!({
                    let head = self.head.load(Ordering::Acquire);
                    head.is_null() || head == old_tail.as_ptr()
                });
            }
        }

        // The queue was empty and `first` becomes the head. Pops see an empty
        // queue until this store lands.
        self.head.store(first.as_ptr(), Ordering::Release);
    }

    /// Try to remove the head element.
    ///
    /// Returns `Ok(None)` if the queue is empty and `Ok(Some(node))` if
    /// `node` was claimed. Returns `Err(Contended)` if the attempt lost a race
    /// with another pop or with an append in its split window; the queue may
    /// be non-empty in that case.
    pub fn try_pop(&self) -> Result<Option<NonNull<T>>, Contended> {
        let Some(old_head) = NonNull::new(self.head.load(Ordering::Acquire)) else {
            return Ok(None);
        };

        // SAFETY: Elements were pushed under the reclamation contract, so
        // `old_head` is still valid even if another thread claimed it.
        let head_link = unsafe { old_head.as_ref() }.next_link();
        let next = head_link.load(Ordering::Acquire);

        if !self.is_end(next) {
            // `next` is the queue's successor, or null because a racing pop
            // took `old_head` as the last element, or part of an unrelated
            // list because `old_head` was taken and reused. Only the first
            // case can advance head successfully with a non-null `next`.
            if self
                .head
                .compare_exchange(
                    old_head.as_ptr(),
                    next,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
            {
                // A racing pop claimed `old_head`.
                return Err(Contended);
            }
            if next.is_null() {
                // We advanced head to null, helping a pop that already took
                // `old_head` as the last element. Head stays null until the
                // next append. Reported as a lost race rather than empty.
                return Err(Contended);
            }
            head_link.store(ptr::null_mut(), Ordering::Relaxed);
            return Ok(Some(old_head));
        }

        // `old_head` is also the tail. Claim it by clearing its link.
        if head_link
            .compare_exchange(next, ptr::null_mut(), Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // A racing pop claimed it, or an append extended from it.
            return Err(Contended);
        }

        // Restore the queue to empty. Either exchange fails if a concurrent
        // append (or a helping pop) got there first, which is fine: that
        // operation installs the correct value. Head goes first so append can
        // rely on "tail null implies head null".
        let _ = self.head.compare_exchange(
            old_head.as_ptr(),
            ptr::null_mut(),
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
        let _ = self.tail.compare_exchange(
            old_head.as_ptr(),
            ptr::null_mut(),
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
        Ok(Some(old_head))
    }

    /// Remove the head element, retrying lost races.
    ///
    /// Lock-free but not wait-free: under sustained contention a caller may
    /// retry repeatedly.
    pub fn pop(&self) -> Option<NonNull<T>> {
        let backoff = Backoff::new();
        loop {
            match self.try_pop() {
                Ok(result) => return result,
                Err(Contended) => backoff.spin(),
            }
        }
    }

    /// Detach the whole list, returning its first and last elements.
    ///
    /// The last element's link is reset to null, so the returned chain is
    /// null-terminated.
    ///
    /// # Safety
    ///
    /// No other operation on this queue may run concurrently.
    pub unsafe fn take_all(&self) -> Option<(NonNull<T>, NonNull<T>)> {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        debug_assert_eq!(
            head.is_null(),
            tail.is_null(),
            "queue head and tail disagree on emptiness"
        );

        let (head, tail) = (NonNull::new(head)?, NonNull::new(tail)?);
        // SAFETY: Exclusive access; `tail` is linked into this queue.
        let tail_link = unsafe { tail.as_ref() }.next_link();
        debug_assert!(
            self.is_end(tail_link.load(Ordering::Relaxed)),
            "queue tail is not terminated by the end marker"
        );
        tail_link.store(ptr::null_mut(), Ordering::Relaxed);

        self.head.store(ptr::null_mut(), Ordering::Release);
        self.tail.store(ptr::null_mut(), Ordering::Release);
        Some((head, tail))
    }

    /// Visit every element from head to tail.
    ///
    /// # Safety
    ///
    /// No other operation on this queue may run concurrently.
    pub unsafe fn for_each(&self, mut f: impl FnMut(&T)) {
        let mut current = self.head.load(Ordering::Acquire);
        while !current.is_null() && !self.is_end(current) {
            // SAFETY: Exclusive access; every linked element is valid.
            let node = unsafe { &*current };
            f(node);
            current = node.next_link().load(Ordering::Relaxed);
        }
    }

    /// Number of elements.
    ///
    /// # Safety
    ///
    /// No other operation on this queue may run concurrently.
    #[must_use]
    pub unsafe fn len(&self) -> usize {
        let mut count = 0;
        // SAFETY: Forwarded caller contract.
        unsafe { self.for_each(|_| count += 1) };
        count
    }
}

impl<T: QueueLink> Default for NonblockingQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: QueueLink> Drop for NonblockingQueue<T> {
    fn drop(&mut self) {
        debug_assert!(
            self.head.load(Ordering::Relaxed).is_null(),
            "NonblockingQueue dropped while non-empty"
        );
    }
}

impl<T: QueueLink> fmt::Debug for NonblockingQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NonblockingQueue")
            .field("head", &self.head.load(Ordering::Relaxed))
            .field("tail", &self.tail.load(Ordering::Relaxed))
            .finish()
    }
}

//! Safepoint coordination for concurrent refinement.
//!
//! [`Safepoint`] models a suspendible thread set. Threads doing concurrent
//! work [`join`](Safepoint::join) the set and poll
//! [`should_yield`](Safepoint::should_yield) at convenient points. A
//! collector that needs them stopped calls [`begin`](Safepoint::begin),
//! which raises the yield token and blocks until every joined thread has
//! either left the set or parked in [`yield_now`](Safepoint::yield_now).
//!
//! Each safepoint advances the epoch returned by
//! [`safepoint_id`](Safepoint::safepoint_id), which tags paused buffers.
//!
//! Threads outside the set (mutators outside inline refinement) are not
//! stopped by this type. Callers must bring them to rest themselves.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct SetState {
    joined: usize,
    yielded: usize,
    suspend_all: bool,
}

/// Suspendible thread set plus safepoint epoch.
pub struct Safepoint {
    state: Mutex<SetState>,
    cond: Condvar,
    yield_requested: AtomicBool,
    at_safepoint: AtomicBool,
    safepoint_id: AtomicU64,
}

impl Safepoint {
    /// Create a set with no members, not at a safepoint, in epoch zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SetState::default()),
            cond: Condvar::new(),
            yield_requested: AtomicBool::new(false),
            at_safepoint: AtomicBool::new(false),
            safepoint_id: AtomicU64::new(0),
        }
    }

    /// Join the set, waiting out any safepoint in progress.
    ///
    /// The calling thread stays a member until the guard is dropped.
    pub fn join(&self) -> SuspendibleGuard<'_> {
        let mut state = self.state.lock();
        while state.suspend_all {
            self.cond.wait(&mut state);
        }
        state.joined += 1;
        SuspendibleGuard { safepoint: self }
    }

    fn leave(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.joined > 0, "leaving an empty suspendible set");
        state.joined -= 1;
        if state.suspend_all {
            self.cond.notify_all();
        }
    }

    /// Whether a safepoint wants joined threads to stop.
    #[must_use]
    pub fn should_yield(&self) -> bool {
        self.yield_requested.load(Ordering::Acquire)
    }

    /// Park until the pending safepoint is over. Returns at once if none is
    /// pending.
    ///
    /// Must only be called by a member of the set.
    pub fn yield_now(&self) {
        let mut state = self.state.lock();
        if !state.suspend_all {
            return;
        }
        debug_assert!(state.yielded < state.joined, "yield from a non-member");
        state.yielded += 1;
        self.cond.notify_all();
        while state.suspend_all {
            self.cond.wait(&mut state);
        }
        state.yielded -= 1;
    }

    /// Stop every member of the set and enter a safepoint.
    ///
    /// Blocks until every joined thread has yielded or left. The safepoint
    /// lasts until the returned guard is dropped. The caller must not be a
    /// member of the set.
    pub fn begin(&self) -> SafepointGuard<'_> {
        let mut state = self.state.lock();
        while state.suspend_all {
            self.cond.wait(&mut state);
        }
        state.suspend_all = true;
        self.yield_requested.store(true, Ordering::Release);
        while state.yielded < state.joined {
            self.cond.wait(&mut state);
        }
        self.safepoint_id.fetch_add(1, Ordering::AcqRel);
        self.at_safepoint.store(true, Ordering::Release);
        drop(state);
        SafepointGuard { safepoint: self }
    }

    fn end(&self) {
        let mut state = self.state.lock();
        self.at_safepoint.store(false, Ordering::Release);
        self.yield_requested.store(false, Ordering::Release);
        state.suspend_all = false;
        self.cond.notify_all();
    }

    /// Whether a safepoint is in progress.
    #[must_use]
    pub fn is_at_safepoint(&self) -> bool {
        self.at_safepoint.load(Ordering::Acquire)
    }

    /// Number of safepoints begun so far.
    #[must_use]
    pub fn safepoint_id(&self) -> u64 {
        self.safepoint_id.load(Ordering::Acquire)
    }

    /// Raise the yield token without stopping anyone.
    ///
    /// Refinement in progress stops at the next card boundary. Members that
    /// call [`yield_now`](Self::yield_now) return immediately because no
    /// safepoint is actually pending.
    pub fn request_yield(&self) {
        self.yield_requested.store(true, Ordering::Release);
    }

    /// Lower a token raised by [`request_yield`](Self::request_yield).
    pub fn clear_yield_request(&self) {
        let state = self.state.lock();
        if !state.suspend_all {
            self.yield_requested.store(false, Ordering::Release);
        }
    }

    /// Current number of members.
    #[must_use]
    pub fn joined_count(&self) -> usize {
        self.state.lock().joined
    }
}

impl Default for Safepoint {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Safepoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Safepoint")
            .field("safepoint_id", &self.safepoint_id())
            .field("at_safepoint", &self.is_at_safepoint())
            .field("should_yield", &self.should_yield())
            .finish_non_exhaustive()
    }
}

/// Membership in a [`Safepoint`]'s suspendible thread set.
#[must_use = "dropping the guard leaves the suspendible set immediately"]
#[derive(Debug)]
pub struct SuspendibleGuard<'a> {
    safepoint: &'a Safepoint,
}

impl SuspendibleGuard<'_> {
    /// See [`Safepoint::should_yield`].
    #[must_use]
    pub fn should_yield(&self) -> bool {
        self.safepoint.should_yield()
    }

    /// See [`Safepoint::yield_now`].
    pub fn yield_now(&self) {
        self.safepoint.yield_now();
    }
}

impl Drop for SuspendibleGuard<'_> {
    fn drop(&mut self) {
        self.safepoint.leave();
    }
}

/// An active safepoint. Dropping it resumes the suspendible set.
#[must_use = "dropping the guard ends the safepoint immediately"]
#[derive(Debug)]
pub struct SafepointGuard<'a> {
    safepoint: &'a Safepoint,
}

impl SafepointGuard<'_> {
    /// Epoch of this safepoint.
    #[must_use]
    pub fn safepoint_id(&self) -> u64 {
        self.safepoint.safepoint_id()
    }
}

impl Drop for SafepointGuard<'_> {
    fn drop(&mut self) {
        self.safepoint.end();
    }
}

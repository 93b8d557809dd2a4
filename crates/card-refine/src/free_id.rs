//! Bounded set of worker ids handed out to mutators that refine inline.

use parking_lot::{Condvar, Mutex};

/// A pool of ids in `[start, start + size)`.
///
/// [`claim`](FreeIdSet::claim) blocks while every id is in use, which bounds
/// how many mutator threads refine at the same time.
#[derive(Debug)]
pub struct FreeIdSet {
    start: u32,
    size: u32,
    free: Mutex<Vec<u32>>,
    available: Condvar,
}

impl FreeIdSet {
    /// Create a set of `size` ids starting at `start`.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero or the range overflows `u32`.
    #[must_use]
    pub fn new(start: u32, size: u32) -> Self {
        assert!(size > 0, "FreeIdSet needs at least one id");
        let Some(end) = start.checked_add(size) else {
            panic!("FreeIdSet id range overflows");
        };
        Self {
            start,
            size,
            // Reversed so ids are handed out lowest first.
            free: Mutex::new((start..end).rev().collect()),
            available: Condvar::new(),
        }
    }

    /// First id of the range.
    #[must_use]
    pub const fn start(&self) -> u32 {
        self.start
    }

    /// Number of ids in the range.
    #[must_use]
    pub const fn size(&self) -> u32 {
        self.size
    }

    /// Ids not currently claimed.
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }

    /// Claim an id, blocking until one is free.
    pub fn claim(&self) -> ClaimedId<'_> {
        let mut free = self.free.lock();
        loop {
            if let Some(id) = free.pop() {
                return ClaimedId { set: self, id };
            }
            self.available.wait(&mut free);
        }
    }

    fn release(&self, id: u32) {
        debug_assert!(
            (self.start..self.start + self.size).contains(&id),
            "id {id} does not belong to this set"
        );
        let mut free = self.free.lock();
        debug_assert!(!free.contains(&id), "id {id} released twice");
        free.push(id);
        self.available.notify_one();
    }
}

/// An id claimed from a [`FreeIdSet`]; released on drop.
#[derive(Debug)]
pub struct ClaimedId<'a> {
    set: &'a FreeIdSet,
    id: u32,
}

impl ClaimedId<'_> {
    /// The claimed id.
    #[must_use]
    pub const fn id(&self) -> u32 {
        self.id
    }
}

impl Drop for ClaimedId<'_> {
    fn drop(&mut self) {
        self.set.release(self.id);
    }
}

//! Concurrent dirty-card refinement for region-based garbage collectors.
//!
//! `card-refine` implements the machinery between a generational write
//! barrier and the remembered sets of a region-based collector. Mutator
//! threads record dirtied cards in thread-local buffers; full buffers are
//! handed to a shared lock-free queue, from which a pool of refinement
//! threads takes them and updates remembered sets concurrently with the
//! application.
//!
//! # Components
//!
//! - [`CardTable`]: one byte per card of a covered address range
//! - [`CardBufferQueue`]: a thread's current buffer and its write barrier
//! - [`CardQueueSet`]: the shared queue of completed buffers, paused
//!   buffers and the card accounting
//! - [`BufferRefiner`]: cleans, sorts and refines the cards of one buffer
//! - [`ConcurrentRefine`] and [`RefineThreadPool`]: decide how many
//!   refinement threads run, and run them
//! - [`Safepoint`]: the suspendible thread set refinement threads yield to
//!
//! The collector supplies the remembered-set side through [`RemSetScanner`]
//! and the heap predictions through [`RefinePolicy`].
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//!
//! use card_refine::{
//!     Card, CardBufferQueue, CardQueueSet, CardTable, FixedRatePolicy, RefineConfig,
//!     RefineThreadPool, RemSetScanner, Safepoint,
//! };
//!
//! struct Scanner;
//!
//! impl RemSetScanner for Scanner {
//!     fn clean_card_before_refine(&self, _card: &mut Card) -> bool {
//!         true
//!     }
//!
//!     fn refine_card_concurrently(&self, _card: Card, _worker_id: u32) {}
//! }
//!
//! let config = RefineConfig::default().with_max_refinement_threads(2);
//! let qset = Arc::new(CardQueueSet::new(
//!     &config,
//!     Arc::new(CardTable::with_cards(1024)),
//!     Arc::new(Scanner),
//!     Arc::new(Safepoint::new()),
//! ));
//! let pool = RefineThreadPool::new(
//!     Arc::clone(&qset),
//!     Arc::new(FixedRatePolicy::new()),
//!     &config,
//! )
//! .unwrap();
//!
//! let mut queue = CardBufferQueue::new(Arc::clone(&qset));
//! queue.enqueue(Card::new(7));
//! queue.flush();
//! drop(pool);
//! ```
//!
//! # Safepoints
//!
//! Operations documented as safepoint-only must be called while a
//! [`SafepointGuard`] is held and mutators are stopped. They assert the
//! former and rely on the caller for the latter.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod buffer;
pub mod card;
pub mod config;
pub mod free_id;
pub mod local;
pub mod policy;
pub mod qset;
pub mod refine;
pub mod refiner;
pub mod safepoint;
pub mod stats;

/// Lock-free queues of buffer nodes.
///
/// Public for testing and for collectors building their own buffer types.
pub mod queue;

/// Atomics used by the lock-free queues.
///
/// Public so the loom tests can drive the queue with the same primitives.
pub mod sync;

mod tracing;

pub use buffer::{BufferAllocator, BufferNode, CardBuffer};
pub use card::{Card, CardTable, CLEAN_CARD, DIRTY_CARD, YOUNG_CARD};
pub use config::RefineConfig;
pub use free_id::{ClaimedId, FreeIdSet};
pub use local::{CardBufferQueue, ThreadKind};
pub use policy::{FixedRatePolicy, RefinePolicy};
pub use qset::{BufferList, CardQueueSet};
pub use refine::{ConcurrentRefine, RefineThreadPool, ThreadsNeeded};
pub use refiner::{BufferRefiner, RemSetScanner, YieldSignal};
pub use safepoint::{Safepoint, SafepointGuard, SuspendibleGuard};
pub use stats::{RefinementStats, SharedRefinementStats};

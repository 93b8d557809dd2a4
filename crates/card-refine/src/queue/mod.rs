//! Intrusive buffer queues.
//!
//! - [`NonblockingQueue`]: the lock-free FIFO of completed buffers.
//! - [`PausedBuffers`]: epoch-tagged side lists for interrupted buffers.

pub mod nonblocking;
pub mod paused;

pub use nonblocking::{Contended, NonblockingQueue, QueueLink};
pub use paused::{Chain, PausedBuffers};

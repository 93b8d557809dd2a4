//! Atomic primitives shared by the intrusive queue and its nodes.
//!
//! Under `--cfg loom` these resolve to `loom`'s model-checked versions so the
//! queue protocol can be explored by the loom tests. Everything that never
//! runs inside a loom model uses `std::sync::atomic` directly.

/// Atomics that switch to `loom` under `--cfg loom`.
pub mod atomic {
    #[cfg(loom)]
    pub use loom::sync::atomic::{fence, AtomicPtr, AtomicUsize, Ordering};

    #[cfg(not(loom))]
    pub use std::sync::atomic::{fence, AtomicPtr, AtomicUsize, Ordering};
}

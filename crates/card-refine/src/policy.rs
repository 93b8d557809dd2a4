//! Predictions that drive the refinement thread count.

use parking_lot::Mutex;

/// Source of the heap and rate predictions used to size the refinement
/// thread pool.
///
/// Rates of zero mean "no prediction yet".
pub trait RefinePolicy: Send + Sync {
    /// Bytes that can still be allocated before the next pause.
    ///
    /// Returns `None` if the value cannot be read without blocking right
    /// now; the adjustment is then retried later.
    fn available_bytes(&self) -> Option<usize>;

    /// Predicted allocation rate in bytes per millisecond.
    fn predict_alloc_rate_ms(&self) -> f64;

    /// Predicted rate at which mutators dirty cards, per millisecond.
    fn predict_dirtied_cards_rate_ms(&self) -> f64;

    /// Predicted rate at which one refinement thread refines cards, per
    /// millisecond.
    fn predict_concurrent_refine_rate_ms(&self) -> f64;
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Rates {
    available_bytes: Option<usize>,
    alloc_rate_ms: f64,
    dirtied_cards_rate_ms: f64,
    concurrent_refine_rate_ms: f64,
}

/// A [`RefinePolicy`] returning values set by its owner.
///
/// By default no bytes are available and no rates are known, which keeps
/// the pool at the minimum needed to hold the pending-cards target.
#[derive(Debug)]
pub struct FixedRatePolicy {
    rates: Mutex<Rates>,
}

impl FixedRatePolicy {
    /// Create a policy with no predictions.
    #[must_use]
    pub fn new() -> Self {
        Self {
            rates: Mutex::new(Rates {
                available_bytes: Some(0),
                alloc_rate_ms: 0.0,
                dirtied_cards_rate_ms: 0.0,
                concurrent_refine_rate_ms: 0.0,
            }),
        }
    }

    /// Set the bytes available before the next pause.
    #[must_use]
    pub fn with_available_bytes(self, bytes: Option<usize>) -> Self {
        self.set_available_bytes(bytes);
        self
    }

    /// Set the allocation rate.
    #[must_use]
    pub fn with_alloc_rate_ms(self, rate: f64) -> Self {
        self.rates.lock().alloc_rate_ms = rate;
        self
    }

    /// Set the card dirtying rate.
    #[must_use]
    pub fn with_dirtied_cards_rate_ms(self, rate: f64) -> Self {
        self.rates.lock().dirtied_cards_rate_ms = rate;
        self
    }

    /// Set the per-thread refinement rate.
    #[must_use]
    pub fn with_concurrent_refine_rate_ms(self, rate: f64) -> Self {
        self.rates.lock().concurrent_refine_rate_ms = rate;
        self
    }

    /// Update the bytes available before the next pause.
    pub fn set_available_bytes(&self, bytes: Option<usize>) {
        self.rates.lock().available_bytes = bytes;
    }

    /// Update the per-thread refinement rate, as measured after a pause.
    pub fn set_concurrent_refine_rate_ms(&self, rate: f64) {
        self.rates.lock().concurrent_refine_rate_ms = rate;
    }
}

impl Default for FixedRatePolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl RefinePolicy for FixedRatePolicy {
    fn available_bytes(&self) -> Option<usize> {
        self.rates.lock().available_bytes
    }

    fn predict_alloc_rate_ms(&self) -> f64 {
        self.rates.lock().alloc_rate_ms
    }

    fn predict_dirtied_cards_rate_ms(&self) -> f64 {
        self.rates.lock().dirtied_cards_rate_ms
    }

    fn predict_concurrent_refine_rate_ms(&self) -> f64 {
        self.rates.lock().concurrent_refine_rate_ms
    }
}

//! Retry bookkeeping carried on request metadata
//!
//! Every replay of a previously dispatched request bumps its counter; a
//! policy stops recovering for a request once the counter reaches the
//! policy's `max_retries`.

/// Number of replays a logical request has been through.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RetryCounter(u32);

impl RetryCounter {
    pub fn new(count: u32) -> Self {
        Self(count)
    }

    /// Get the current replay count
    pub fn count(&self) -> u32 {
        self.0
    }

    /// Check if a policy allowing `max_retries` may still recover for this request
    pub fn exhausted(&self, max_retries: u32) -> bool {
        self.0 >= max_retries
    }

    /// Record one more replay
    pub fn bump(&mut self) {
        self.0 = self.0.saturating_add(1);
    }
}

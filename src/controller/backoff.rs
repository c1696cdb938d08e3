//! # Exponential Backoff
//!
//! Per-resource redelivery delay after a failed reconcile.
//!
//! The delay doubles with each consecutive failure, starting at `start` and
//! capped at `max`. A successful reconcile resets it.
//!
//! ## Usage
//!
//! ```rust
//! use service_manager_controller::controller::backoff::ExponentialBackoff;
//!
//! let mut backoff = ExponentialBackoff::new(5, 1000);
//! assert_eq!(backoff.next_backoff_seconds(), 5);
//! assert_eq!(backoff.next_backoff_seconds(), 10);
//! assert_eq!(backoff.next_backoff_seconds(), 20);
//! ```

use std::time::Duration;

/// Exponential backoff calculator (seconds)
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    start_secs: u64,
    current_secs: u64,
    max_secs: u64,
}

impl ExponentialBackoff {
    #[must_use]
    pub fn new(start_secs: u64, max_secs: u64) -> Self {
        let start_secs = start_secs.max(1);
        Self {
            start_secs,
            current_secs: start_secs,
            max_secs: max_secs.max(start_secs),
        }
    }

    /// Get the next backoff duration in seconds and advance the sequence
    pub fn next_backoff_seconds(&mut self) -> u64 {
        let result = self.current_secs;
        self.current_secs = self.current_secs.saturating_mul(2).min(self.max_secs);
        result
    }

    #[must_use]
    pub fn next_backoff(&mut self) -> Duration {
        Duration::from_secs(self.next_backoff_seconds())
    }

    /// Reset the backoff to the initial state
    pub fn reset(&mut self) {
        self.current_secs = self.start_secs;
    }
}

/// Backoff state for a specific resource
#[derive(Debug, Clone)]
pub struct BackoffState {
    pub backoff: ExponentialBackoff,
    pub error_count: u32,
}

impl BackoffState {
    #[must_use]
    pub fn new(start_secs: u64, max_secs: u64) -> Self {
        Self {
            backoff: ExponentialBackoff::new(start_secs, max_secs),
            error_count: 0,
        }
    }

    pub fn increment_error(&mut self) {
        self.error_count += 1;
    }

    pub fn reset(&mut self) {
        self.error_count = 0;
        self.backoff.reset();
    }
}

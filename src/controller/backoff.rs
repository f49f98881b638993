//! # Fibonacci Backoff
//!
//! Requeue backoff for transient reconcile errors. Fibonacci grows more
//! slowly than exponential backoff, which suits a level-triggered
//! reconciler: an unresolved discovery or a conflicting write usually
//! clears within a couple of resyncs, and we want to keep probing without
//! hammering the API server.
//!
//! Sequence with the default bounds (5s min, 300s max):
//! 5s, 5s, 10s, 15s, 25s, 40s, 65s, 105s, 170s, 275s, 300s (capped).

use std::time::Duration;

/// Per-plan Fibonacci backoff state. Reset on any successful reconcile.
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    min_seconds: u64,
    prev_seconds: u64,
    current_seconds: u64,
    max_seconds: u64,
}

impl FibonacciBackoff {
    #[must_use]
    pub fn new(min_seconds: u64, max_seconds: u64) -> Self {
        FibonacciBackoff {
            min_seconds,
            prev_seconds: 0,
            current_seconds: min_seconds,
            max_seconds,
        }
    }

    /// The next backoff duration; advances the sequence, capped at the
    /// configured maximum.
    pub fn next_backoff(&mut self) -> Duration {
        let result = Duration::from_secs(self.current_seconds);

        let next = self.prev_seconds + self.current_seconds;
        self.prev_seconds = self.current_seconds;
        self.current_seconds = next.min(self.max_seconds);

        result
    }

    /// Restart from the minimum after a successful reconcile.
    pub fn reset(&mut self) {
        self.prev_seconds = 0;
        self.current_seconds = self.min_seconds;
    }
}

impl Default for FibonacciBackoff {
    /// Default bounds for plan reconciliation: 5 seconds to 5 minutes.
    fn default() -> Self {
        FibonacciBackoff::new(5, 300)
    }
}

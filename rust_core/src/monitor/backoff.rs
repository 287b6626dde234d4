//! Poll interval backoff after consecutive upstream failures.

use std::time::Duration;

/// Largest power of two applied to the base interval.
pub const DEFAULT_MAX_EXPONENT: u32 = 5;

/// `interval = min(base * 2^min(failures, max_exponent), cap)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_exponent: u32,
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap: cap.max(base),
            max_exponent: DEFAULT_MAX_EXPONENT,
        }
    }

    /// Sleep before the next cycle given the current failure streak.
    /// Zero failures is the base interval.
    pub fn interval_for(&self, consecutive_failures: u32) -> Duration {
        let exponent = consecutive_failures.min(self.max_exponent);
        let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .unwrap_or(Duration::MAX)
            .min(self.cap)
    }
}

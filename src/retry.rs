//! Exponential backoff delays for retried external calls.

use std::time::Duration;

/// Delay before the retry following attempt `attempt` (1-based):
/// `base * 2^(attempt-1)`, capped at `cap`.
pub fn backoff_delay(base: Duration, attempt: u32, cap: Duration) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let delay = base.saturating_mul(1u32 << exp);
    delay.min(cap)
}

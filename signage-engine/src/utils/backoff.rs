//! Exponential backoff shared by the reconnect, poll and sync loops.

use std::time::Duration;

/// Exponent cap so the multiplier cannot overflow.
const MAX_EXPONENT: u32 = 20;

/// Delay before retry number `attempt` (1-based): `base * 2^(attempt - 1)`, capped at
/// `ceiling`. Attempt 0 waits nothing.
pub fn exponential_backoff(base: Duration, attempt: u32, ceiling: Duration) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    let exponent = (attempt - 1).min(MAX_EXPONENT);
    base.saturating_mul(2u32.saturating_pow(exponent)).min(ceiling)
}

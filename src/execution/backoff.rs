use std::time::Duration;

/// Exponential backoff: attempt 1 waits `base_delay_ms`, each later attempt doubles it.
/// Attempts below 1 are treated as immediate.
pub fn exponential_backoff_ms(attempt: u32, base_delay_ms: u64) -> u64 {
    if attempt < 1 {
        return 0;
    }
    let factor = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
    base_delay_ms.saturating_mul(factor)
}

pub fn backoff_delay(attempt: u32, base_delay_ms: u64) -> Duration {
    Duration::from_millis(exponential_backoff_ms(attempt, base_delay_ms))
}

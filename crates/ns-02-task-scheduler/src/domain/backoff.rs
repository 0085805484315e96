//! Exponential retry backoff.

use std::time::Duration;

/// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`,
/// capped at `max`.
pub fn retry_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(max).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: Duration = Duration::from_millis(250);
    const MAX: Duration = Duration::from_secs(30);

    #[test]
    fn test_doubles_each_attempt() {
        assert_eq!(retry_delay(1, BASE, MAX), Duration::from_millis(250));
        assert_eq!(retry_delay(2, BASE, MAX), Duration::from_millis(500));
        assert_eq!(retry_delay(3, BASE, MAX), Duration::from_millis(1000));
    }

    #[test]
    fn test_capped() {
        assert_eq!(retry_delay(10, BASE, MAX), MAX);
        assert_eq!(retry_delay(64, BASE, MAX), MAX);
    }

    #[test]
    fn test_zero_attempt() {
        assert_eq!(retry_delay(0, BASE, MAX), Duration::ZERO);
    }
}

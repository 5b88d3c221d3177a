//! Bounded exponential backoff with jitter.

use crate::config::RetryConfig;
use rand::Rng;
use std::time::Duration;

/// Delay before retry number `retry` (1-based): `initial * 2^(retry-1)`, capped at `max_backoff`,
/// plus up to `max_jitter` of random jitter.
pub fn delay(config: &RetryConfig, retry: u32) -> Duration {
    base_delay(config, retry) + jitter(config.max_jitter)
}

/// Delay without jitter.
pub fn base_delay(config: &RetryConfig, retry: u32) -> Duration {
    let exp = retry.saturating_sub(1).min(31);
    let factor = 1u32 << exp;
    std::cmp::min(config.initial_backoff.saturating_mul(factor), config.max_backoff)
}

fn jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

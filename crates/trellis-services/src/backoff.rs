//! Exponential reconnect backoff with jitter.

use std::time::Duration;

use rand::Rng;
use trellis_core::ReconnectPolicy;

/// Delay before the next attempt after `failures` consecutive failures.
///
/// `base * 2^(failures - 1)`, capped at `max_delay`, plus up to 10% jitter.
pub fn delay_after(failures: u32, policy: &ReconnectPolicy) -> Duration {
    if failures == 0 {
        return Duration::ZERO;
    }

    let base_ms = policy.base_delay.as_millis() as u64;
    let max_ms = policy.max_delay.as_millis() as u64;

    let exponential = 2u64.saturating_pow(failures - 1);
    let capped = base_ms.saturating_mul(exponential).min(max_ms);

    let jitter_range = capped / 10;
    let jitter = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..jitter_range)
    } else {
        0
    };

    Duration::from_millis(capped + jitter)
}

/// Whether the policy still allows an attempt after `failures` failures.
pub fn attempts_remaining(failures: u32, policy: &ReconnectPolicy) -> bool {
    match policy.max_attempts {
        Some(max) => failures < max,
        None => true,
    }
}

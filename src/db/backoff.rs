//! Exponential backoff with jitter.
//!
//! # Schedule (operation defaults: 500ms initial, 10s cap, 10% jitter)
//!
//! | Attempt | Delay (base) | With ±10% jitter |
//! |---------|--------------|------------------|
//! | 0       | 500ms        | 450–550ms        |
//! | 1       | 1s           | 0.9–1.1s         |
//! | 2       | 2s           | 1.8–2.2s         |
//! | 3       | 4s           | 3.6–4.4s         |
//! | 4       | 8s           | 7.2–8.8s         |
//! | 5+      | 10s          | 9–10s            |
//!
//! Attempt 0 is the first retry; the original call is never delayed.

use crate::config::RetryConfig;
use rand::Rng;
use std::time::Duration;

/// Delay before retry number `attempt` (0-indexed), using the thread-local RNG for jitter.
pub fn next_delay(attempt: u32, config: &RetryConfig) -> Duration {
    next_delay_with(attempt, config, &mut rand::thread_rng())
}

/// Delay before retry number `attempt`, drawing jitter from `rng`.
///
/// Always within `[0, config.max_delay]`. With `jitter == 0` no randomness is consumed.
pub fn next_delay_with<R: Rng>(attempt: u32, config: &RetryConfig, rng: &mut R) -> Duration {
    let max = config.max_delay.as_secs_f64();
    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let capped = (config.initial_delay.as_secs_f64() * 2f64.powi(exponent)).min(max);

    if config.jitter <= 0.0 {
        return Duration::from_secs_f64(capped);
    }

    let spread = rng.gen_range(-config.jitter..=config.jitter);
    let jittered = (capped * (1.0 + spread)).clamp(0.0, max);
    Duration::from_secs_f64(jittered)
}

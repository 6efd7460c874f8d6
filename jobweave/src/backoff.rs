//! Scheduling & backoff math (C2, §4.2).
//!
//! The exponential-backoff shape follows `queue.rs`'s
//! `2i64.pow(retry_count).min(3600)` exactly, generalized to configurable
//! `initial`/`multiplier`/`max` instead of hardcoded
//! base-2-seconds-capped-at-an-hour constants.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Retry backoff configuration. Defaults match §4.2: `initialMs = 1s`,
/// `multiplier = 2`, `maxMs = 100s`.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub initial: Duration,
    pub multiplier: f64,
    pub max: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            multiplier: 2.0,
            max: Duration::from_secs(100),
        }
    }
}

/// Lease configuration. Defaults match §4.2: `leaseMs = 30s`,
/// `renewIntervalMs = 15s`.
#[derive(Debug, Clone, Copy)]
pub struct LeaseConfig {
    pub lease: Duration,
    pub renew_interval: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(30),
            renew_interval: Duration::from_secs(15),
        }
    }
}

/// `backoff(attempt, {initialMs, maxMs, multiplier})`.
///
/// `attempt` is 1-based (the attempt number that just failed). Returns
/// `min(maxMs, initialMs * multiplier^(attempt-1))`.
pub fn backoff(attempt: i32, config: &RetryConfig) -> Duration {
    let attempt = attempt.max(1) as i32;
    let factor = config.multiplier.powi(attempt - 1);
    let ms = (config.initial.as_millis() as f64 * factor).min(config.max.as_millis() as f64);
    Duration::from_millis(ms as u64)
}

/// `sleep(ms, {jitterMs, cancel})`.
///
/// Resolves after a duration in `[ms - jitterMs/2, ms + jitterMs/2]`, or
/// immediately if `cancel` fires first.
pub async fn jittered_sleep(duration: Duration, jitter: Duration, cancel: &CancellationToken) {
    let jitter_ms = jitter.as_millis() as i64;
    let offset_ms = if jitter_ms > 0 {
        fastrand::i64(-(jitter_ms / 2)..=(jitter_ms / 2))
    } else {
        0
    };
    let target_ms = (duration.as_millis() as i64 + offset_ms).max(0) as u64;

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_millis(target_ms)) => {}
        _ = cancel.cancelled() => {}
    }
}

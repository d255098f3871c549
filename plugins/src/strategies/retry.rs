use std::time::Duration;

use harvest_core::api::{
    compute_delay, ClassifiedError, ErrorKind, HttpClass, RetryConfig, RetryStrategyPlugin,
};

/// Statuses where the upstream told us to slow down rather than failed.
const THROTTLE_STATUSES: [u16; 2] = [429, 503];

/// One extra step of delay when the failure is upstream throttling.
fn throttle_steps(error: &ClassifiedError) -> u32 {
    match (error.kind, error.status) {
        (ErrorKind::Http(HttpClass::ServerError), Some(status))
            if THROTTLE_STATUSES.contains(&status) =>
        {
            1
        }
        _ => 0,
    }
}

fn within_budget(config: &RetryConfig, attempt: u32) -> bool {
    attempt < config.max_attempts
}

/// Doubles the delay on every failed attempt, same curve as the per-account
/// backoff tracker. Throttling responses skip ahead one doubling.
pub struct ExponentialBackoffPlugin {
    config: RetryConfig,
}

impl ExponentialBackoffPlugin {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }
}

impl RetryStrategyPlugin for ExponentialBackoffPlugin {
    fn name(&self) -> &str {
        "exponential-backoff"
    }

    fn next_delay(&self, attempt: u32, error: &ClassifiedError) -> Option<Duration> {
        if !within_budget(&self.config, attempt) {
            return None;
        }
        let failures = attempt.saturating_add(1).saturating_add(throttle_steps(error));
        Some(compute_delay(
            failures,
            Duration::from_millis(self.config.base_delay_ms),
            Duration::from_millis(self.config.max_delay_ms),
        ))
    }

    fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }
}

/// Grows by `base_delay_ms` per attempt. Local persistence failures retry at
/// the base delay; throttling responses wait twice as long.
pub struct LinearRetryPlugin {
    config: RetryConfig,
}

impl LinearRetryPlugin {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }
}

impl RetryStrategyPlugin for LinearRetryPlugin {
    fn name(&self) -> &str {
        "linear"
    }

    fn next_delay(&self, attempt: u32, error: &ClassifiedError) -> Option<Duration> {
        if !within_budget(&self.config, attempt) {
            return None;
        }
        let steps = match error.kind {
            ErrorKind::Persistence => 1,
            _ => u64::from(attempt.saturating_add(1)) << throttle_steps(error),
        };
        let delay = self.config.base_delay_ms.saturating_mul(steps);
        Some(Duration::from_millis(delay.min(self.config.max_delay_ms)))
    }

    fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }
}

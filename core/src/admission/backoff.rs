use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::ClassifiedError;

#[derive(Debug, Clone, Copy)]
pub struct BackoffState {
    pub error_count: u32,
    pub last_error: Instant,
}

/// `min(base * 2^(error_count - 1), max)`; zero when there is no error record.
pub fn compute_delay(error_count: u32, base: Duration, max: Duration) -> Duration {
    if error_count == 0 {
        return Duration::ZERO;
    }
    let exp = 1u32 << (error_count - 1).min(30);
    base.saturating_mul(exp).min(max)
}

/// Per-key exponential backoff bookkeeping.
#[derive(Default)]
pub struct BackoffTracker {
    states: Mutex<HashMap<String, BackoffState>>,
}

impl BackoffTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn states(&self) -> MutexGuard<'_, HashMap<String, BackoffState>> {
        self.states.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Returns the new consecutive error count.
    pub fn record_error(&self, key: &str) -> u32 {
        let now = Instant::now();
        let mut states = self.states();
        let state = states.entry(key.to_string()).or_insert(BackoffState {
            error_count: 0,
            last_error: now,
        });
        state.error_count = state.error_count.saturating_add(1);
        state.last_error = now;
        tracing::debug!(
            target: "harvest.admission",
            key,
            error_count = state.error_count,
            "backoff error recorded"
        );
        state.error_count
    }

    pub fn record_success(&self, key: &str) {
        self.states().remove(key);
    }

    pub fn error_count(&self, key: &str) -> u32 {
        self.states().get(key).map(|s| s.error_count).unwrap_or(0)
    }

    pub fn delay_for(&self, key: &str, base: Duration, max: Duration) -> Option<Duration> {
        self.states()
            .get(key)
            .map(|s| compute_delay(s.error_count, base, max))
    }

    /// Sleep for the key's backoff delay. Returns immediately when the key has no error record.
    pub async fn backoff_delay(&self, key: &str, base: Duration, max: Duration) -> Duration {
        let Some(delay) = self.delay_for(key, base, max) else {
            return Duration::ZERO;
        };
        tracing::info!(
            target: "harvest.admission",
            key,
            delay_ms = delay.as_millis() as u64,
            "backing off"
        );
        tokio::time::sleep(delay).await;
        delay
    }

    pub async fn backoff_delay_cancellable(
        &self,
        key: &str,
        base: Duration,
        max: Duration,
        cancel: &CancellationToken,
    ) -> Result<Duration, ClassifiedError> {
        if cancel.is_cancelled() {
            return Err(ClassifiedError::cancelled());
        }
        tokio::select! {
            _ = cancel.cancelled() => Err(ClassifiedError::cancelled()),
            slept = self.backoff_delay(key, base, max) => Ok(slept),
        }
    }

    /// Drop records whose last error is older than `max_age`. Returns how many were removed.
    pub fn clear_old_states(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let mut states = self.states();
        let before = states.len();
        states.retain(|_, s| now.saturating_duration_since(s.last_error) <= max_age);
        before - states.len()
    }

    pub fn len(&self) -> usize {
        self.states().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{classify, is_no_retry, ClassifiedError};

/// Retry strategy plugin
pub trait RetryStrategyPlugin: Send + Sync {
    fn name(&self) -> &str;
    /// Delay before the retry that follows failed attempt `attempt` (0-based).
    fn next_delay(&self, attempt: u32, error: &ClassifiedError) -> Option<Duration>;
    fn max_attempts(&self) -> u32;
}

/// Run `op` until it succeeds, the strategy runs out of attempts, or the error
/// is classified as not retryable. `op` receives the 0-based attempt number.
pub async fn retry_with_strategy<T, F, Fut>(
    strategy: &dyn RetryStrategyPlugin,
    cancel: &CancellationToken,
    mut op: F,
) -> anyhow::Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let max_attempts = strategy.max_attempts().max(1);
    let mut attempt = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(ClassifiedError::cancelled().into_propagated());
        }

        let err = match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(err) => err,
        };

        if is_no_retry(&err) {
            tracing::debug!(
                target: "harvest.retry",
                strategy = strategy.name(),
                attempt,
                error = %err,
                "not retryable, giving up"
            );
            return Err(err);
        }

        if attempt + 1 >= max_attempts {
            tracing::warn!(
                target: "harvest.retry",
                strategy = strategy.name(),
                attempts = attempt + 1,
                error = %err,
                "retries exhausted"
            );
            return Err(err);
        }

        let Some(delay) = strategy.next_delay(attempt, &classify(&err)) else {
            return Err(err);
        };
        tracing::warn!(
            target: "harvest.retry",
            strategy = strategy.name(),
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "retrying"
        );

        tokio::select! {
            _ = cancel.cancelled() => return Err(ClassifiedError::cancelled().into_propagated()),
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}

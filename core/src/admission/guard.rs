use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::BackoffConfig;
use crate::error::{classify, ClassifiedError, ErrorKind};
use crate::health::HealthSelector;

use super::backoff::BackoffTracker;
use super::rate_limit::RateLimiter;

/// Wraps one upstream call in account selection, rate limiting and backoff,
/// and feeds the outcome back into health and backoff state.
pub struct AdmissionGuard {
    limiter: Arc<RateLimiter>,
    backoff: Arc<BackoffTracker>,
    selector: Arc<HealthSelector>,
    backoff_base: Duration,
    backoff_max: Duration,
}

impl AdmissionGuard {
    pub fn new(
        limiter: Arc<RateLimiter>,
        backoff: Arc<BackoffTracker>,
        selector: Arc<HealthSelector>,
        cfg: &BackoffConfig,
    ) -> Self {
        Self {
            limiter,
            backoff,
            selector,
            backoff_base: Duration::from_secs(cfg.base_secs),
            backoff_max: Duration::from_secs(cfg.max_secs),
        }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn backoff(&self) -> &Arc<BackoffTracker> {
        &self.backoff
    }

    pub fn selector(&self) -> &Arc<HealthSelector> {
        &self.selector
    }

    /// Run `op` with the selected account id.
    ///
    /// The returned error always carries the account in `resource` when one
    /// was selected. Use [`ClassifiedError::into_propagated`] to hand it to a
    /// retry loop.
    pub async fn call<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        op: F,
    ) -> Result<T, ClassifiedError>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<T, ClassifiedError>>,
    {
        if cancel.is_cancelled() {
            return Err(ClassifiedError::cancelled());
        }

        let account = match self.selector.select_best().await {
            Ok(Some(account)) => account,
            Ok(None) => return Err(ClassifiedError::auth_expired("no usable upstream account")),
            Err(err) => return Err(classify(&err)),
        };

        self.limiter
            .acquire_cancellable(Some(&account), cancel)
            .await
            .map_err(|e| e.with_resource(&account))?;
        self.backoff
            .backoff_delay_cancellable(&account, self.backoff_base, self.backoff_max, cancel)
            .await
            .map_err(|e| e.with_resource(&account))?;

        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(ClassifiedError::cancelled()),
            res = op(account.clone()) => res,
        };

        match outcome {
            Ok(value) => {
                self.backoff.record_success(&account);
                Ok(value)
            }
            Err(err) => {
                self.record_failure(&account, &err).await;
                Err(err.with_resource(account))
            }
        }
    }

    async fn record_failure(&self, account: &str, err: &ClassifiedError) {
        match err.kind {
            ErrorKind::Cancelled => {}
            ErrorKind::AuthExpired => {
                if let Err(e) = self.selector.mark_expired(account).await {
                    tracing::warn!(target: "harvest.admission", account, error = %e, "failed to mark account expired");
                }
            }
            _ => {
                let count = self.backoff.record_error(account);
                tracing::warn!(
                    target: "harvest.admission",
                    account,
                    kind = %err.kind,
                    error_count = count,
                    error = %err.message,
                    "upstream call failed"
                );
                if let Err(e) = self.selector.report_failure(account).await {
                    tracing::warn!(target: "harvest.admission", account, error = %e, "failed to apply health penalty");
                }
            }
        }
    }
}

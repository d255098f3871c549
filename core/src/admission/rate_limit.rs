//! Two-tier token bucket limiter: one global bucket plus one bucket per key.
//!
//! Refill is computed lazily from elapsed time on every access, so there is no
//! background timer and the token count is exact regardless of poll cadence.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::RateLimitConfig;
use crate::error::ClassifiedError;

#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// A new bucket starts full.
    pub fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            refill_per_sec,
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    pub fn available(&mut self, now: Instant) -> f64 {
        self.refill(now);
        self.tokens
    }

    fn has_token(&mut self, now: Instant) -> bool {
        self.available(now) >= 1.0
    }

    fn take(&mut self) {
        self.tokens -= 1.0;
    }

    pub fn try_consume(&mut self, now: Instant) -> bool {
        if self.has_token(now) {
            self.take();
            true
        } else {
            false
        }
    }

    /// Change capacity and rate. Tokens accrued so far are kept, clipped to the new capacity.
    pub fn reconfigure(&mut self, capacity: f64, refill_per_sec: f64, now: Instant) {
        self.refill(now);
        self.capacity = capacity;
        self.refill_per_sec = refill_per_sec;
        self.tokens = self.tokens.min(capacity);
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn refill_per_sec(&self) -> f64 {
        self.refill_per_sec
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct RateLimiter {
    global: Mutex<TokenBucket>,
    keyed: Mutex<HashMap<String, TokenBucket>>,
    key_defaults: (f64, f64),
    poll_interval: Duration,
}

impl RateLimiter {
    pub fn new(
        global_capacity: f64,
        global_refill_per_sec: f64,
        key_capacity: f64,
        key_refill_per_sec: f64,
        poll_interval: Duration,
    ) -> Self {
        Self {
            global: Mutex::new(TokenBucket::new(global_capacity, global_refill_per_sec)),
            keyed: Mutex::new(HashMap::new()),
            key_defaults: (key_capacity, key_refill_per_sec),
            poll_interval,
        }
    }

    pub fn from_config(cfg: &RateLimitConfig) -> Self {
        Self::new(
            cfg.global_capacity,
            cfg.global_refill_per_sec,
            cfg.account_capacity,
            cfg.account_refill_per_sec,
            Duration::from_millis(cfg.poll_interval_ms.max(1)),
        )
    }

    /// Take one global token and, when `key` is given, one key-scoped token.
    ///
    /// Nothing is consumed unless both tiers can pay.
    pub fn try_acquire(&self, key: Option<&str>) -> bool {
        let now = Instant::now();
        let mut global = lock(&self.global);
        if !global.has_token(now) {
            return false;
        }

        if let Some(key) = key {
            let (capacity, rate) = self.key_defaults;
            let mut keyed = lock(&self.keyed);
            let bucket = keyed
                .entry(key.to_string())
                .or_insert_with(|| TokenBucket::new(capacity, rate));
            if !bucket.has_token(now) {
                return false;
            }
            bucket.take();
        }

        global.take();
        true
    }

    /// Block until a token is available, polling at a fixed short interval.
    pub async fn acquire(&self, key: Option<&str>) {
        let mut waited = false;
        while !self.try_acquire(key) {
            if !waited {
                tracing::debug!(target: "harvest.admission", key = ?key, "rate limited, waiting for token");
                waited = true;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Like [`RateLimiter::acquire`] but gives up with a cancelled error once `cancel` fires.
    pub async fn acquire_cancellable(
        &self,
        key: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<(), ClassifiedError> {
        loop {
            if cancel.is_cancelled() {
                return Err(ClassifiedError::cancelled());
            }
            if self.try_acquire(key) {
                return Ok(());
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(ClassifiedError::cancelled()),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    /// Reconfigure the global bucket (`key = None`) or one keyed bucket.
    pub fn set_rate(&self, key: Option<&str>, capacity: f64, refill_per_sec: f64) {
        let now = Instant::now();
        match key {
            None => lock(&self.global).reconfigure(capacity, refill_per_sec, now),
            Some(key) => {
                lock(&self.keyed)
                    .entry(key.to_string())
                    .and_modify(|b| b.reconfigure(capacity, refill_per_sec, now))
                    .or_insert_with(|| TokenBucket::new(capacity, refill_per_sec));
            }
        }
        tracing::info!(
            target: "harvest.admission",
            key = ?key,
            capacity,
            refill_per_sec,
            "rate limit reconfigured"
        );
    }

    /// Tokens currently available in the global bucket or one keyed bucket.
    /// Unknown keys report the default capacity.
    pub fn available(&self, key: Option<&str>) -> f64 {
        let now = Instant::now();
        match key {
            None => lock(&self.global).available(now),
            Some(key) => match lock(&self.keyed).get_mut(key) {
                Some(bucket) => bucket.available(now),
                None => self.key_defaults.0,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(global: f64, global_rate: f64, key: f64, key_rate: f64) -> RateLimiter {
        RateLimiter::new(global, global_rate, key, key_rate, Duration::from_millis(10))
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_refills_from_elapsed_time() {
        let mut bucket = TokenBucket::new(3.0, 2.0);
        for _ in 0..3 {
            assert!(bucket.try_consume(Instant::now()));
        }
        assert!(!bucket.try_consume(Instant::now()));

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(bucket.try_consume(Instant::now()));
        assert!(!bucket.try_consume(Instant::now()));

        // Long idle never overfills.
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(bucket.available(Instant::now()), 3.0);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_blocks_until_refill() {
        let limiter = limiter(2.0, 1.0, 10.0, 10.0);
        limiter.acquire(None).await;
        limiter.acquire(None).await;
        assert!(!limiter.try_acquire(None));

        let start = Instant::now();
        limiter.acquire(None).await;
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(1), "waited {waited:?}");
        assert!(waited < Duration::from_millis(1100), "waited {waited:?}");
        assert!(!limiter.try_acquire(None));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_key_does_not_spend_global_tokens() {
        let limiter = limiter(10.0, 1.0, 1.0, 0.5);
        assert!(limiter.try_acquire(Some("acct-a")));
        assert!(!limiter.try_acquire(Some("acct-a")));
        assert_eq!(limiter.available(None), 9.0);

        // Another key has its own bucket.
        assert!(limiter.try_acquire(Some("acct-b")));
        assert_eq!(limiter.available(None), 8.0);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(limiter.try_acquire(Some("acct-a")));
    }

    #[tokio::test(start_paused = true)]
    async fn set_rate_reconfigures_buckets() {
        let limiter = limiter(5.0, 1.0, 5.0, 1.0);
        limiter.set_rate(None, 1.0, 4.0);
        assert_eq!(limiter.available(None), 1.0);
        assert!(limiter.try_acquire(None));
        assert!(!limiter.try_acquire(None));
        tokio::time::advance(Duration::from_millis(250)).await;
        assert!(limiter.try_acquire(None));

        limiter.set_rate(Some("slow"), 1.0, 0.1);
        assert_eq!(limiter.available(Some("slow")), 1.0);
        assert_eq!(limiter.available(Some("never-seen")), 5.0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellable_acquire_stops_on_cancel() {
        let limiter = limiter(1.0, 0.001, 1.0, 1.0);
        assert!(limiter.try_acquire(None));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = limiter.acquire_cancellable(None, &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
    }
}

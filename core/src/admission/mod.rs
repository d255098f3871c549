pub mod backoff;
pub mod guard;
pub mod rate_limit;
pub mod retry;

pub use backoff::{compute_delay, BackoffState, BackoffTracker};
pub use guard::AdmissionGuard;
pub use rate_limit::{RateLimiter, TokenBucket};
pub use retry::{retry_with_strategy, RetryStrategyPlugin};

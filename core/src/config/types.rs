use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CliError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Prefix for shared keys (ranking set, persisted entity names).
    #[serde(default = "default_namespace")]
    pub namespace: String,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub upstream: UpstreamConfig,

    #[serde(default)]
    pub accounts: Vec<AccountConfig>,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub backoff: BackoffConfig,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub detector: DetectorConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub analysis: AnalysisConfig,

    #[serde(default)]
    pub persistence: PersistenceConfig,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_namespace() -> String {
    "harvest".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            logging: LoggingConfig::default(),
            upstream: UpstreamConfig::default(),
            accounts: Vec::new(),
            rate_limit: RateLimitConfig::default(),
            backoff: BackoffConfig::default(),
            health: HealthConfig::default(),
            detector: DetectorConfig::default(),
            engine: EngineConfig::default(),
            analysis: AnalysisConfig::default(),
            persistence: PersistenceConfig::default(),
            worker: WorkerConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl AppConfig {
    /// Reject values that would stall or spin the pipeline.
    pub fn validate(&self) -> Result<(), CliError> {
        let bad = |msg: &str| Err(CliError::Config(msg.to_string()));

        if self.rate_limit.global_capacity < 1.0 || self.rate_limit.account_capacity < 1.0 {
            return bad("rate_limit capacities must be >= 1");
        }
        if self.rate_limit.global_refill_per_sec <= 0.0
            || self.rate_limit.account_refill_per_sec <= 0.0
        {
            return bad("rate_limit refill rates must be > 0");
        }
        if self.backoff.base_secs == 0 || self.backoff.max_secs < self.backoff.base_secs {
            return bad("backoff requires 0 < base_secs <= max_secs");
        }
        if self.detector.base_interval_secs == 0 {
            return bad("detector.base_interval_secs must be > 0");
        }
        if self.detector.floor_divisor == 0 || self.detector.ceiling_multiplier == 0 {
            return bad("detector floor_divisor and ceiling_multiplier must be > 0");
        }
        if self.detector.cache_capacity == 0 {
            return bad("detector.cache_capacity must be > 0");
        }
        if self.detector.publish_batch_size == 0 {
            return bad("detector.publish_batch_size must be > 0");
        }
        if self.detector.min_interval() > self.detector.max_interval() {
            return bad("detector interval floor is above its ceiling");
        }
        if self.health.initial_score <= 0.0 || self.health.max_select_attempts == 0 {
            return bad("health requires initial_score > 0 and max_select_attempts > 0");
        }
        if self.engine.max_parallel_nodes == 0 || self.worker.max_parallel_tasks == 0 {
            return bad("parallelism limits must be > 0");
        }
        let mut seen = std::collections::HashSet::new();
        for account in &self.accounts {
            if account.id.trim().is_empty() {
                return bad("account id must not be empty");
            }
            if !seen.insert(account.id.as_str()) {
                return Err(CliError::Config(format!("duplicate account id: {}", account.id)));
            }
        }
        Ok(())
    }

    pub fn ranking_key(&self) -> String {
        format!("{}:{}", self.namespace, self.health.ranking_key)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_enabled")]
    pub enabled: bool,

    /// If true, log to stderr.
    #[serde(default = "default_logging_console")]
    pub console: bool,

    /// If true, log to a file under `directory` (or OS temp dir if unset).
    #[serde(default = "default_logging_file")]
    pub file: bool,

    /// EnvFilter string, e.g. "info" or "harvest_core=debug".
    #[serde(default = "default_logging_level")]
    pub level: String,

    /// Optional directory for log files. If empty or unset, uses OS temp dir.
    #[serde(default)]
    pub directory: Option<String>,
}

fn default_logging_enabled() -> bool {
    true
}

fn default_logging_console() -> bool {
    true
}

fn default_logging_file() -> bool {
    false
}

fn default_logging_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: default_logging_enabled(),
            console: default_logging_console(),
            file: default_logging_file(),
            level: default_logging_level(),
            directory: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_upstream_url")]
    pub base_url: String,

    /// Search expression sent to the feed endpoint.
    #[serde(default)]
    pub feed_query: String,

    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_max_comment_pages")]
    pub max_comment_pages: usize,
}

fn default_upstream_url() -> String {
    "http://127.0.0.1:8700".to_string()
}

fn default_timeout_ms() -> u64 {
    15_000
}

fn default_max_comment_pages() -> usize {
    5
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_upstream_url(),
            feed_query: String::new(),
            timeout_ms: default_timeout_ms(),
            max_comment_pages: default_max_comment_pages(),
        }
    }
}

/// One upstream identity the health selector can rotate through.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    pub id: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_global_capacity")]
    pub global_capacity: f64,
    #[serde(default = "default_global_refill")]
    pub global_refill_per_sec: f64,
    #[serde(default = "default_account_capacity")]
    pub account_capacity: f64,
    #[serde(default = "default_account_refill")]
    pub account_refill_per_sec: f64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_global_capacity() -> f64 {
    30.0
}

fn default_global_refill() -> f64 {
    1.0
}

fn default_account_capacity() -> f64 {
    10.0
}

fn default_account_refill() -> f64 {
    0.2
}

fn default_poll_interval_ms() -> u64 {
    100
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            global_capacity: default_global_capacity(),
            global_refill_per_sec: default_global_refill(),
            account_capacity: default_account_capacity(),
            account_refill_per_sec: default_account_refill(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_backoff_base_secs")]
    pub base_secs: u64,
    #[serde(default = "default_backoff_max_secs")]
    pub max_secs: u64,
    /// Error records older than this are swept once per detector cycle.
    #[serde(default = "default_backoff_state_ttl_ms")]
    pub state_ttl_ms: u64,
}

fn default_backoff_base_secs() -> u64 {
    1
}

fn default_backoff_max_secs() -> u64 {
    300
}

fn default_backoff_state_ttl_ms() -> u64 {
    60 * 60 * 1000
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_secs: default_backoff_base_secs(),
            max_secs: default_backoff_max_secs(),
            state_ttl_ms: default_backoff_state_ttl_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_initial_score")]
    pub initial_score: f64,
    #[serde(default = "default_failure_penalty")]
    pub failure_penalty: f64,
    #[serde(default = "default_max_select_attempts")]
    pub max_select_attempts: usize,
    #[serde(default = "default_ranking_key")]
    pub ranking_key: String,
}

fn default_initial_score() -> f64 {
    100.0
}

fn default_failure_penalty() -> f64 {
    5.0
}

fn default_max_select_attempts() -> usize {
    5
}

fn default_ranking_key() -> String {
    "accounts:health".to_string()
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            initial_score: default_initial_score(),
            failure_penalty: default_failure_penalty(),
            max_select_attempts: default_max_select_attempts(),
            ranking_key: default_ranking_key(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    #[serde(default = "default_base_interval_secs")]
    pub base_interval_secs: u64,
    /// Floor is `base / floor_divisor`.
    #[serde(default = "default_floor_divisor")]
    pub floor_divisor: u32,
    /// Ceiling is `base * ceiling_multiplier`, capped by `max_interval_secs`.
    #[serde(default = "default_ceiling_multiplier")]
    pub ceiling_multiplier: u64,
    #[serde(default = "default_max_interval_secs")]
    pub max_interval_secs: u64,
    /// New-item count per cycle above which the interval shrinks.
    #[serde(default = "default_high_water_mark")]
    pub high_water_mark: usize,
    #[serde(default = "default_max_pages_per_cycle")]
    pub max_pages_per_cycle: usize,
    #[serde(default = "default_publish_batch_size")]
    pub publish_batch_size: usize,
    #[serde(default = "default_publish_batch_delay_ms")]
    pub publish_batch_delay_ms: u64,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
}

fn default_base_interval_secs() -> u64 {
    60
}

fn default_floor_divisor() -> u32 {
    3
}

fn default_ceiling_multiplier() -> u64 {
    2
}

fn default_max_interval_secs() -> u64 {
    15 * 60
}

fn default_high_water_mark() -> usize {
    20
}

fn default_max_pages_per_cycle() -> usize {
    5
}

fn default_publish_batch_size() -> usize {
    5
}

fn default_publish_batch_delay_ms() -> u64 {
    500
}

fn default_cache_capacity() -> usize {
    10_000
}

fn default_max_consecutive_failures() -> u32 {
    5
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            base_interval_secs: default_base_interval_secs(),
            floor_divisor: default_floor_divisor(),
            ceiling_multiplier: default_ceiling_multiplier(),
            max_interval_secs: default_max_interval_secs(),
            high_water_mark: default_high_water_mark(),
            max_pages_per_cycle: default_max_pages_per_cycle(),
            publish_batch_size: default_publish_batch_size(),
            publish_batch_delay_ms: default_publish_batch_delay_ms(),
            cache_capacity: default_cache_capacity(),
            max_consecutive_failures: default_max_consecutive_failures(),
        }
    }
}

impl DetectorConfig {
    pub fn base_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.base_interval_secs)
    }

    pub fn min_interval(&self) -> std::time::Duration {
        self.base_interval() / self.floor_divisor.max(1)
    }

    pub fn max_interval(&self) -> std::time::Duration {
        let ceiling = self.base_interval_secs.saturating_mul(self.ceiling_multiplier);
        std::time::Duration::from_secs(ceiling.min(self.max_interval_secs))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_max_parallel_nodes")]
    pub max_parallel_nodes: usize,
    /// Cancel a run when no handler makes progress for this long. Unset waits forever.
    #[serde(default)]
    pub idle_timeout_ms: Option<u64>,
}

fn default_max_parallel_nodes() -> usize {
    16
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel_nodes: default_max_parallel_nodes(),
            idle_timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "provider")]
pub enum AnalysisProvider {
    #[serde(rename = "keyword")]
    Keyword,
    #[serde(rename = "service")]
    Service(AnalysisServiceConfig),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisServiceConfig {
    #[serde(default = "default_analyzer_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_analyzer_url() -> String {
    "http://127.0.0.1:8701".to_string()
}

impl Default for AnalysisServiceConfig {
    fn default() -> Self {
        Self {
            base_url: default_analyzer_url(),
            api_key: String::new(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    #[serde(flatten)]
    pub provider: AnalysisProvider,
    #[serde(default = "default_recent_events_limit")]
    pub recent_events_limit: usize,
}

fn default_recent_events_limit() -> usize {
    20
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            provider: AnalysisProvider::Keyword,
            recent_events_limit: default_recent_events_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PersistenceConfig {
    /// Directory for entity files. Unset keeps everything in memory.
    #[serde(default)]
    pub directory: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_max_parallel_tasks")]
    pub max_parallel_tasks: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_max_parallel_tasks() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    256
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_parallel_tasks: default_max_parallel_tasks(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_strategy")]
    pub strategy: String,
    #[serde(default = "default_retry_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_retry_max_attempts")]
    pub max_attempts: u32,
}

fn default_retry_strategy() -> String {
    "exponential-backoff".to_string()
}

fn default_retry_base_delay_ms() -> u64 {
    100
}

fn default_retry_max_delay_ms() -> u64 {
    5000
}

fn default_retry_max_attempts() -> u32 {
    3
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            strategy: default_retry_strategy(),
            base_delay_ms: default_retry_base_delay_ms(),
            max_delay_ms: default_retry_max_delay_ms(),
            max_attempts: default_retry_max_attempts(),
        }
    }
}

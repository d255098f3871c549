//! Stable re-exports for consumers (`cli`, `plugins`, and external crates).
//!
//! Prefer importing from `harvest_core::api` instead of reaching into internal modules.

pub use crate::admission::{
    compute_delay, retry_with_strategy, AdmissionGuard, BackoffTracker, RateLimiter,
    RetryStrategyPlugin, TokenBucket,
};
pub use crate::config::{
    get_harvest_data_dir, load_default, load_from_path, AccountConfig, AnalysisConfig,
    AnalysisProvider, AnalysisServiceConfig, AppConfig, BackoffConfig, DetectorConfig,
    EngineConfig, HealthConfig, LoggingConfig, PersistenceConfig, RateLimitConfig, RetryConfig,
    UpstreamConfig, WorkerConfig,
};
pub use crate::context::{AppContext, Services, ServicesFactory};
pub use crate::detector::{next_interval, AdaptiveScheduler, CycleReport, DedupCache};
pub use crate::error::{
    classify, classify_status, is_no_retry, ClassifiedError, CliError, ErrorKind, ExecutorError,
    HttpClass, NoRetry,
};
pub use crate::executor::{
    Edge, EdgeMode, ExecutionContext, ExecutionResult, FnHandler, GraphSnapshot, HandlerRegistry,
    NodeHandler, NodeState, NodeStream, RunOutcome, TaskNode, WorkflowEngine, WorkflowGraph,
};
pub use crate::health::{HealthSelector, MemoryRankingStore, RankingStore, ResourceStore};
pub use crate::pipeline::{
    derived_event_id, AnalysisContext, AnalysisResult, AnalyzerPlugin, Comment, DerivedEvent,
    HarvestTask, IngestionSource, Page, PersistencePlugin, Post, TaskQueuePlugin, Taxonomy,
    UpstreamPlugin,
};

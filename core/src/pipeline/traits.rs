use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::ClassifiedError;
use crate::pipeline::models::{
    AnalysisContext, AnalysisResult, Comment, HarvestTask, Page, Post, Taxonomy,
};

pub use crate::health::{RankingStore, ResourceStore};

/// Upstream social API. Failures come back already classified.
#[async_trait]
pub trait UpstreamPlugin: Send + Sync {
    fn name(&self) -> &str;
    async fn fetch_feed(
        &self,
        cursor: Option<&str>,
        account: &str,
    ) -> Result<Page<Post>, ClassifiedError>;
    async fn fetch_comments(
        &self,
        post_id: &str,
        cursor: Option<&str>,
        account: &str,
    ) -> Result<Page<Comment>, ClassifiedError>;
}

#[async_trait]
pub trait AnalyzerPlugin: Send + Sync {
    fn name(&self) -> &str;
    async fn analyze(
        &self,
        context: &AnalysisContext,
        categories: &[String],
        tags: &[String],
        recent_events: &[String],
    ) -> anyhow::Result<AnalysisResult>;
}

/// Idempotent row store: writing the same rows twice leaves the same state.
#[async_trait]
pub trait PersistencePlugin: Send + Sync {
    fn name(&self) -> &str;
    /// Returns the number of rows written.
    async fn upsert(
        &self,
        entity_type: &str,
        rows: Vec<serde_json::Value>,
        conflict_keys: &[&str],
    ) -> anyhow::Result<usize>;
    async fn load_taxonomy(&self, recent_limit: usize) -> anyhow::Result<Taxonomy>;
}

/// Outbound queue; every published task triggers one graph execution.
#[async_trait]
pub trait TaskQueuePlugin: Send + Sync {
    async fn publish(&self, task: HarvestTask) -> anyhow::Result<()>;
    /// Next task for a consumer. `None` once the queue is closed or `cancel` fires.
    async fn receive(&self, cancel: &CancellationToken) -> anyhow::Result<Option<HarvestTask>>;
    async fn ack(&self, task_id: &str) -> anyhow::Result<()>;
    async fn nack(&self, task_id: &str, reason: &str) -> anyhow::Result<()>;
    /// Refuse new tasks. Consumers still drain what is buffered.
    async fn close(&self);
}

#[async_trait]
pub trait IngestionSource: Send + Sync {
    /// An empty page means there is nothing more this cycle.
    async fn fetch_page(
        &self,
        cursor: Option<&str>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Page<Post>>;
}

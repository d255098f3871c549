use std::sync::Arc;

use anyhow::Result;

use harvest_core::api::{
    AdmissionGuard, AnalysisProvider, AnalyzerPlugin, AppConfig, BackoffTracker, EngineConfig,
    ExecutorError, HealthSelector, MemoryRankingStore, RateLimiter, RetryStrategyPlugin,
    UpstreamPlugin, WorkflowEngine,
};

use crate::accounts::ConfigAccountStore;
use crate::analyzer::{HttpAnalyzerPlugin, KeywordAnalyzerPlugin};
use crate::handlers::{build_registry, HarvestDeps};
use crate::persistence::FilePersistence;
use crate::queue::ChannelTaskQueue;
use crate::strategies::{ExponentialBackoffPlugin, LinearRetryPlugin};
use crate::upstream::HttpUpstreamClient;

pub fn build_upstream(cfg: &AppConfig) -> Result<Arc<dyn UpstreamPlugin>> {
    Ok(Arc::new(HttpUpstreamClient::new(&cfg.upstream, &cfg.accounts)?))
}

pub fn build_analyzer(cfg: &AppConfig) -> Result<Arc<dyn AnalyzerPlugin>> {
    match &cfg.analysis.provider {
        AnalysisProvider::Keyword => Ok(Arc::new(KeywordAnalyzerPlugin::new()?)),
        AnalysisProvider::Service(svc_cfg) => Ok(Arc::new(HttpAnalyzerPlugin::new(svc_cfg)?)),
    }
}

pub async fn build_persistence(cfg: &AppConfig) -> Result<Arc<FilePersistence>> {
    match cfg.persistence.directory.as_deref().map(str::trim) {
        Some(dir) if !dir.is_empty() => Ok(Arc::new(FilePersistence::open(dir).await?)),
        _ => Ok(Arc::new(FilePersistence::in_memory())),
    }
}

pub fn build_retry(cfg: &AppConfig) -> Arc<dyn RetryStrategyPlugin> {
    match cfg.retry.strategy.as_str() {
        "linear" => Arc::new(LinearRetryPlugin::new(cfg.retry.clone())),
        // Anything else falls back to exponential backoff.
        _ => Arc::new(ExponentialBackoffPlugin::new(cfg.retry.clone())),
    }
}

/// Admission control over the configured accounts. Account health lives in
/// an in-process ranking set keyed by [`AppConfig::ranking_key`].
pub fn build_guard(cfg: &AppConfig) -> Arc<AdmissionGuard> {
    let selector = HealthSelector::new(
        Arc::new(MemoryRankingStore::new()),
        Arc::new(ConfigAccountStore::new(&cfg.accounts)),
        cfg.ranking_key(),
        &cfg.health,
    );
    Arc::new(AdmissionGuard::new(
        Arc::new(RateLimiter::from_config(&cfg.rate_limit)),
        Arc::new(BackoffTracker::new()),
        Arc::new(selector),
        &cfg.backoff,
    ))
}

pub fn build_queue(cfg: &AppConfig) -> Arc<ChannelTaskQueue> {
    Arc::new(ChannelTaskQueue::new(cfg.worker.queue_capacity))
}

pub fn build_engine(deps: &HarvestDeps, cfg: &EngineConfig) -> Result<WorkflowEngine, ExecutorError> {
    let registry = build_registry(deps)?;
    Ok(WorkflowEngine::new(Arc::new(registry), cfg.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use harvest_core::api::AnalysisServiceConfig;

    #[test]
    fn analyzer_follows_provider() {
        let mut cfg = AppConfig::default();
        assert_eq!(build_analyzer(&cfg).unwrap().name(), "keyword");

        cfg.analysis.provider = AnalysisProvider::Service(AnalysisServiceConfig::default());
        assert_eq!(build_analyzer(&cfg).unwrap().name(), "analysis_service");
    }

    #[test]
    fn unknown_retry_strategy_falls_back_to_exponential() {
        let mut cfg = AppConfig::default();
        assert_eq!(build_retry(&cfg).name(), "exponential-backoff");
        cfg.retry.strategy = "linear".into();
        assert_eq!(build_retry(&cfg).name(), "linear");
        cfg.retry.strategy = "bogus".into();
        assert_eq!(build_retry(&cfg).name(), "exponential-backoff");
    }

    #[tokio::test]
    async fn persistence_is_in_memory_without_directory() {
        let mut cfg = AppConfig::default();
        assert!(build_persistence(&cfg).await.unwrap().directory().is_none());

        let dir = tempfile::tempdir().unwrap();
        cfg.persistence.directory = Some(dir.path().to_string_lossy().to_string());
        let store = build_persistence(&cfg).await.unwrap();
        assert_eq!(store.directory(), Some(dir.path()));
    }
}

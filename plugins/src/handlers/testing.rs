//! Fakes shared by the handler and worker tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use harvest_core::api::{
    AccountConfig, AdmissionGuard, AnalysisContext, AnalysisResult, AnalyzerPlugin, BackoffConfig,
    BackoffTracker, ClassifiedError, Comment, EngineConfig, HealthConfig, HealthSelector,
    MemoryRankingStore, Page, Post, RateLimitConfig, RateLimiter, RetryConfig, UpstreamPlugin,
    WorkflowEngine,
};

use crate::accounts::ConfigAccountStore;
use crate::persistence::FilePersistence;
use crate::strategies::ExponentialBackoffPlugin;

use super::{build_registry, HarvestDeps};

pub fn post(id: &str, text: &str) -> Post {
    Post {
        id: id.into(),
        author: "author".into(),
        text: text.into(),
        url: None,
        created_at: Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap(),
        like_count: 0,
        reply_count: 0,
    }
}

pub fn comment(post_id: &str, id: &str, text: &str) -> Comment {
    Comment {
        id: id.into(),
        post_id: post_id.into(),
        author: "commenter".into(),
        text: text.into(),
        created_at: Utc.with_ymd_and_hms(2024, 5, 1, 11, 0, 0).unwrap(),
    }
}

/// Serves the same comment pages for every post; cursor `n` selects page `n`.
#[derive(Default)]
pub struct ScriptedUpstream {
    pub pages: Vec<Vec<Comment>>,
    pub fail_with: Option<ClassifiedError>,
    pub calls: AtomicUsize,
}

impl ScriptedUpstream {
    pub fn with_pages(pages: Vec<Vec<Comment>>) -> Self {
        Self {
            pages,
            ..Self::default()
        }
    }

    pub fn failing(err: ClassifiedError) -> Self {
        Self {
            fail_with: Some(err),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UpstreamPlugin for ScriptedUpstream {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn fetch_feed(
        &self,
        _cursor: Option<&str>,
        _account: &str,
    ) -> Result<Page<Post>, ClassifiedError> {
        Ok(Page::empty())
    }

    async fn fetch_comments(
        &self,
        _post_id: &str,
        cursor: Option<&str>,
        _account: &str,
    ) -> Result<Page<Comment>, ClassifiedError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = &self.fail_with {
            return Err(err.clone());
        }
        let idx: usize = cursor.and_then(|c| c.parse().ok()).unwrap_or(0);
        let Some(items) = self.pages.get(idx) else {
            return Ok(Page::empty());
        };
        let next = (idx + 1 < self.pages.len()).then(|| (idx + 1).to_string());
        Ok(Page::new(items.clone(), next))
    }
}

/// Tags every item with its own text. Text containing "boom" fails with an
/// application error, "flaky" with a network error.
#[derive(Default)]
pub struct EchoAnalyzer {
    pub calls: AtomicUsize,
}

#[async_trait]
impl AnalyzerPlugin for EchoAnalyzer {
    fn name(&self) -> &str {
        "echo"
    }

    async fn analyze(
        &self,
        context: &AnalysisContext,
        categories: &[String],
        _tags: &[String],
        _recent_events: &[String],
    ) -> anyhow::Result<AnalysisResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if context.text.contains("boom") {
            return Err(ClassifiedError::application("model refused").into_propagated());
        }
        if context.text.contains("flaky") {
            return Err(ClassifiedError::network("connection reset").into_propagated());
        }
        Ok(AnalysisResult {
            sentiment: 0.0,
            keywords: vec![context.text.clone()],
            event_type: categories.first().cloned().unwrap_or_else(|| "general".into()),
            tags: Vec::new(),
        })
    }
}

pub fn guard(accounts: &[&str]) -> Arc<AdmissionGuard> {
    let accounts: Vec<AccountConfig> = accounts
        .iter()
        .map(|id| AccountConfig {
            id: id.to_string(),
            token: String::new(),
            expires_at: None,
        })
        .collect();
    let selector = HealthSelector::new(
        Arc::new(MemoryRankingStore::new()),
        Arc::new(ConfigAccountStore::new(&accounts)),
        "test:accounts",
        &HealthConfig::default(),
    );
    Arc::new(AdmissionGuard::new(
        Arc::new(RateLimiter::from_config(&RateLimitConfig::default())),
        Arc::new(BackoffTracker::new()),
        Arc::new(selector),
        &BackoffConfig::default(),
    ))
}

pub fn retry() -> Arc<ExponentialBackoffPlugin> {
    Arc::new(ExponentialBackoffPlugin::new(RetryConfig {
        base_delay_ms: 1,
        max_delay_ms: 5,
        max_attempts: 2,
        ..RetryConfig::default()
    }))
}

pub fn deps(
    upstream: Arc<dyn UpstreamPlugin>,
    analyzer: Arc<dyn AnalyzerPlugin>,
    persistence: Arc<FilePersistence>,
) -> HarvestDeps {
    HarvestDeps {
        upstream,
        analyzer,
        persistence,
        guard: guard(&["a1"]),
        retry: retry(),
        max_comment_pages: 5,
        recent_events_limit: 10,
    }
}

pub fn engine(deps: &HarvestDeps) -> WorkflowEngine {
    let registry = build_registry(deps).unwrap();
    WorkflowEngine::new(Arc::new(registry), EngineConfig::default())
}

use std::sync::Arc;

use async_trait::async_trait;
use harvest_core::api::{
    retry_with_strategy, AdmissionGuard, IngestionSource, Page, Post, RetryStrategyPlugin,
    UpstreamPlugin,
};
use tokio_util::sync::CancellationToken;

/// Feed pages from the upstream, fetched through the admission guard so the
/// detector shares account health and rate limits with the harvest graph.
pub struct FeedSource {
    upstream: Arc<dyn UpstreamPlugin>,
    guard: Arc<AdmissionGuard>,
    retry: Arc<dyn RetryStrategyPlugin>,
}

impl FeedSource {
    pub fn new(
        upstream: Arc<dyn UpstreamPlugin>,
        guard: Arc<AdmissionGuard>,
        retry: Arc<dyn RetryStrategyPlugin>,
    ) -> Self {
        Self {
            upstream,
            guard,
            retry,
        }
    }
}

#[async_trait]
impl IngestionSource for FeedSource {
    async fn fetch_page(
        &self,
        cursor: Option<&str>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Page<Post>> {
        let page = retry_with_strategy(self.retry.as_ref(), cancel, |_attempt| async move {
            self.guard
                .call(cancel, |account| async move {
                    self.upstream.fetch_feed(cursor, &account).await
                })
                .await
                .map_err(|e| e.into_propagated())
        })
        .await?;
        tracing::debug!(
            target: "harvest.upstream",
            stage = "feed.out",
            items = page.items.len(),
            has_more = page.next_cursor.is_some()
        );
        Ok(page)
    }
}

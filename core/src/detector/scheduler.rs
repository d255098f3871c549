use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::admission::BackoffTracker;
use crate::config::DetectorConfig;
use crate::error::{classify, ClassifiedError, CliError};
use crate::pipeline::{HarvestTask, IngestionSource, Post, TaskQueuePlugin};

use super::cache::DedupCache;

/// Summary of one detection cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CycleReport {
    pub pages: usize,
    pub fetched: usize,
    pub new_items: usize,
    pub published: usize,
    pub publish_failures: usize,
    pub swept_backoff_states: usize,
    pub next_interval_ms: u64,
}

/// Interval for the next cycle given how many new items this one found.
pub fn next_interval(cfg: &DetectorConfig, current: Duration, new_items: usize) -> Duration {
    if new_items > cfg.high_water_mark {
        (current / 2).max(cfg.min_interval())
    } else if new_items == 0 {
        current.saturating_mul(2).min(cfg.max_interval())
    } else {
        cfg.base_interval()
    }
}

/// Polls an ingestion source, publishes unseen posts and adapts its own cadence.
pub struct AdaptiveScheduler {
    source: Arc<dyn IngestionSource>,
    queue: Arc<dyn TaskQueuePlugin>,
    backoff: Option<(Arc<BackoffTracker>, Duration)>,
    cfg: DetectorConfig,
    cache: DedupCache,
    current_interval: Duration,
    consecutive_failures: u32,
}

impl AdaptiveScheduler {
    pub fn new(
        source: Arc<dyn IngestionSource>,
        queue: Arc<dyn TaskQueuePlugin>,
        cfg: DetectorConfig,
    ) -> Self {
        Self {
            source,
            queue,
            backoff: None,
            cache: DedupCache::new(cfg.cache_capacity),
            current_interval: cfg.base_interval(),
            consecutive_failures: 0,
            cfg,
        }
    }

    /// Sweep `tracker` once per cycle, dropping states older than `ttl`.
    pub fn with_backoff_sweep(mut self, tracker: Arc<BackoffTracker>, ttl: Duration) -> Self {
        self.backoff = Some((tracker, ttl));
        self
    }

    pub fn current_interval(&self) -> Duration {
        self.current_interval
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn cache(&self) -> &DedupCache {
        &self.cache
    }

    /// Loop until cancelled. Returns [`CliError::Suspended`] once
    /// `max_consecutive_failures` cycles in a row have failed.
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<(), CliError> {
        tracing::info!(
            target: "harvest.detector",
            interval_ms = self.current_interval.as_millis() as u64,
            "scheduler started"
        );

        loop {
            if cancel.is_cancelled() {
                break;
            }

            match self.run_cycle(cancel).await {
                Ok(report) => {
                    self.consecutive_failures = 0;
                    tracing::info!(
                        target: "harvest.detector",
                        pages = report.pages,
                        fetched = report.fetched,
                        new_items = report.new_items,
                        published = report.published,
                        publish_failures = report.publish_failures,
                        next_interval_ms = report.next_interval_ms,
                        "cycle complete"
                    );
                }
                Err(err) => {
                    if cancel.is_cancelled() || classify(&err).is_cancelled() {
                        break;
                    }
                    self.consecutive_failures += 1;
                    tracing::error!(
                        target: "harvest.detector",
                        consecutive_failures = self.consecutive_failures,
                        max = self.cfg.max_consecutive_failures,
                        error = %format!("{err:#}"),
                        "cycle failed"
                    );
                    if self.consecutive_failures >= self.cfg.max_consecutive_failures {
                        tracing::error!(target: "harvest.detector", "scheduler suspended");
                        return Err(CliError::Suspended(format!(
                            "{} consecutive cycle failures, last: {err:#}",
                            self.consecutive_failures
                        )));
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.current_interval) => {}
            }
        }

        tracing::info!(target: "harvest.detector", "scheduler stopped");
        Ok(())
    }

    /// Fetch, dedup and publish once, then pick the next interval.
    pub async fn run_cycle(&mut self, cancel: &CancellationToken) -> anyhow::Result<CycleReport> {
        let mut report = CycleReport::default();
        let mut collected: Vec<Post> = Vec::new();
        let mut cursor: Option<String> = None;

        while report.pages < self.cfg.max_pages_per_cycle.max(1) {
            if cancel.is_cancelled() {
                return Err(ClassifiedError::cancelled().into_propagated());
            }
            let page = self
                .source
                .fetch_page(cursor.as_deref(), cancel)
                .await
                .with_context(|| format!("fetching page {}", report.pages + 1))?;
            report.pages += 1;
            if page.is_empty() {
                break;
            }
            report.fetched += page.items.len();

            // Newest-first feed: a page with nothing unseen means we caught up.
            let caught_up = page.items.iter().all(|p| self.cache.contains(&p.id));
            collected.extend(page.items);
            if caught_up {
                break;
            }
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        let fresh = self.cache.detect_new_posts(collected);
        report.new_items = fresh.len();
        self.publish(fresh, cancel, &mut report).await?;

        if report.new_items > 0 && report.published == 0 {
            anyhow::bail!("all {} publishes failed", report.new_items);
        }

        if let Some((tracker, ttl)) = &self.backoff {
            report.swept_backoff_states = tracker.clear_old_states(*ttl);
        }

        self.current_interval = next_interval(&self.cfg, self.current_interval, report.new_items);
        report.next_interval_ms = self.current_interval.as_millis() as u64;
        Ok(report)
    }

    async fn publish(
        &mut self,
        posts: Vec<Post>,
        cancel: &CancellationToken,
        report: &mut CycleReport,
    ) -> anyhow::Result<()> {
        let batch_size = self.cfg.publish_batch_size.max(1);
        let delay = Duration::from_millis(self.cfg.publish_batch_delay_ms);
        let total_batches = posts.len().div_ceil(batch_size);

        for (index, batch) in posts.chunks(batch_size).enumerate() {
            if index > 0 && !delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(ClassifiedError::cancelled().into_propagated()),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            for post in batch {
                let task = HarvestTask::new(post.clone());
                match self.queue.publish(task).await {
                    Ok(()) => {
                        self.cache.insert(&post.id);
                        report.published += 1;
                    }
                    Err(err) => {
                        // Left out of the cache so the next cycle offers it again.
                        report.publish_failures += 1;
                        tracing::warn!(
                            target: "harvest.detector",
                            post_id = %post.id,
                            error = %format!("{err:#}"),
                            "publish failed"
                        );
                    }
                }
            }

            tracing::debug!(
                target: "harvest.detector",
                batch = index + 1,
                total_batches,
                "batch published"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Page;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::time::Instant;

    fn post(id: &str) -> Post {
        Post {
            id: id.to_string(),
            author: "a".into(),
            text: format!("text of {id}"),
            url: None,
            created_at: Utc::now(),
            like_count: 0,
            reply_count: 0,
        }
    }

    /// Pages keyed by cursor; `None` is the first page.
    #[derive(Default)]
    struct ScriptedSource {
        pages: Mutex<HashMap<Option<String>, Page<Post>>>,
        calls: AtomicUsize,
        fail: bool,
    }

    impl ScriptedSource {
        fn set(&self, cursor: Option<&str>, ids: &[&str], next: Option<&str>) {
            self.pages.lock().unwrap().insert(
                cursor.map(str::to_string),
                Page::new(ids.iter().map(|id| post(id)).collect(), next.map(str::to_string)),
            );
        }
    }

    #[async_trait]
    impl IngestionSource for ScriptedSource {
        async fn fetch_page(
            &self,
            cursor: Option<&str>,
            _cancel: &CancellationToken,
        ) -> anyhow::Result<Page<Post>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ClassifiedError::http(503, "upstream down").into_propagated());
            }
            Ok(self
                .pages
                .lock()
                .unwrap()
                .get(&cursor.map(str::to_string))
                .cloned()
                .unwrap_or_else(Page::empty))
        }
    }

    #[derive(Default)]
    struct RecordingQueue {
        published: Mutex<Vec<String>>,
        reject: Mutex<HashSet<String>>,
    }

    #[async_trait]
    impl TaskQueuePlugin for RecordingQueue {
        async fn publish(&self, task: HarvestTask) -> anyhow::Result<()> {
            if self.reject.lock().unwrap().contains(&task.post.id) {
                anyhow::bail!("queue full");
            }
            self.published.lock().unwrap().push(task.post.id);
            Ok(())
        }
        async fn receive(
            &self,
            _cancel: &CancellationToken,
        ) -> anyhow::Result<Option<HarvestTask>> {
            Ok(None)
        }
        async fn ack(&self, _task_id: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn nack(&self, _task_id: &str, _reason: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn close(&self) {}
    }

    fn cfg() -> DetectorConfig {
        DetectorConfig {
            base_interval_secs: 60,
            high_water_mark: 3,
            publish_batch_size: 2,
            publish_batch_delay_ms: 500,
            max_consecutive_failures: 3,
            ..DetectorConfig::default()
        }
    }

    #[test]
    fn interval_adapts_to_activity() {
        let cfg = cfg();
        let base = Duration::from_secs(60);

        assert_eq!(next_interval(&cfg, base, 10), Duration::from_secs(30));
        assert_eq!(
            next_interval(&cfg, Duration::from_secs(30), 10),
            Duration::from_secs(20)
        );
        assert_eq!(next_interval(&cfg, base, 0), Duration::from_secs(120));
        assert_eq!(
            next_interval(&cfg, Duration::from_secs(120), 0),
            Duration::from_secs(120)
        );
        assert_eq!(next_interval(&cfg, Duration::from_secs(20), 2), base);
    }

    #[tokio::test(start_paused = true)]
    async fn cycle_paginates_dedups_and_batches() {
        let source = Arc::new(ScriptedSource::default());
        source.set(None, &["p1", "p2", "p3"], Some("c2"));
        source.set(Some("c2"), &["p3", "p4"], None);
        let queue = Arc::new(RecordingQueue::default());
        let mut scheduler = AdaptiveScheduler::new(source.clone(), queue.clone(), cfg());

        let start = Instant::now();
        let report = scheduler.run_cycle(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.pages, 2);
        assert_eq!(report.fetched, 5);
        assert_eq!(report.new_items, 4);
        assert_eq!(report.published, 4);
        // Two batches of two: one inter-batch delay.
        assert!(start.elapsed() >= Duration::from_millis(500));
        assert_eq!(report.next_interval_ms, 30_000);
        assert_eq!(
            *queue.published.lock().unwrap(),
            vec!["p1", "p2", "p3", "p4"]
        );

        // Same feed again: first page is fully seen, so paging stops early.
        let report = scheduler.run_cycle(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.pages, 1);
        assert_eq!(report.new_items, 0);
        assert_eq!(report.next_interval_ms, 60_000);
        assert_eq!(queue.published.lock().unwrap().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_publish_is_isolated_and_offered_again() {
        let source = Arc::new(ScriptedSource::default());
        source.set(None, &["p1", "p2"], None);
        let queue = Arc::new(RecordingQueue::default());
        queue.reject.lock().unwrap().insert("p1".into());
        let mut scheduler = AdaptiveScheduler::new(source, queue.clone(), cfg());

        let report = scheduler.run_cycle(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.published, 1);
        assert_eq!(report.publish_failures, 1);
        assert!(!scheduler.cache().contains("p1"));

        queue.reject.lock().unwrap().clear();
        let report = scheduler.run_cycle(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.new_items, 1);
        assert_eq!(*queue.published.lock().unwrap(), vec!["p2", "p1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn suspends_after_consecutive_failures() {
        let source = Arc::new(ScriptedSource {
            fail: true,
            ..ScriptedSource::default()
        });
        let queue = Arc::new(RecordingQueue::default());
        let mut scheduler = AdaptiveScheduler::new(source.clone(), queue, cfg());

        let err = scheduler.run(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, CliError::Suspended(_)));
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
        assert_eq!(scheduler.consecutive_failures(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_on_cancel() {
        let source = Arc::new(ScriptedSource::default());
        let queue = Arc::new(RecordingQueue::default());
        let mut scheduler = AdaptiveScheduler::new(source.clone(), queue, cfg());

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(250)).await;
            trigger.cancel();
        });

        scheduler.run(&cancel).await.unwrap();
        // Empty feed: cycles at t=0, 120 and 240 (interval doubles to the ceiling).
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeps_backoff_states_each_cycle() {
        let tracker = Arc::new(BackoffTracker::new());
        tracker.record_error("stale");
        tokio::time::advance(Duration::from_secs(10)).await;

        let source = Arc::new(ScriptedSource::default());
        let queue = Arc::new(RecordingQueue::default());
        let mut scheduler = AdaptiveScheduler::new(source, queue, cfg())
            .with_backoff_sweep(tracker.clone(), Duration::from_secs(5));

        let report = scheduler.run_cycle(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.swept_backoff_states, 1);
        assert!(tracker.is_empty());
    }
}

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use harvest_core::api::{
    AdmissionGuard, BackoffConfig, BackoffTracker, ClassifiedError, EngineConfig,
    ExecutionContext, HandlerRegistry, HarvestTask, HealthConfig, HealthSelector,
    IngestionSource, MemoryRankingStore, NodeStream, Page, Post, RateLimitConfig, RateLimiter,
    ResourceStore, TaskNode, TaskQueuePlugin, WorkflowEngine,
};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

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

/// Accounts that never expire unless told to.
pub struct StaticAccounts {
    expired: Mutex<HashMap<String, bool>>,
}

impl StaticAccounts {
    pub fn new(ids: &[&str]) -> Self {
        Self {
            expired: Mutex::new(ids.iter().map(|id| (id.to_string(), false)).collect()),
        }
    }
}

#[async_trait]
impl ResourceStore for StaticAccounts {
    async fn list_eligible(&self) -> anyhow::Result<Vec<String>> {
        let mut ids: Vec<String> = self
            .expired
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, expired)| !**expired)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn is_usable(&self, id: &str) -> anyhow::Result<bool> {
        Ok(self.expired.lock().unwrap().get(id) == Some(&false))
    }

    async fn mark_expired(&self, id: &str) -> anyhow::Result<()> {
        if let Some(flag) = self.expired.lock().unwrap().get_mut(id) {
            *flag = true;
        }
        Ok(())
    }

    async fn revalidate(&self, _id: &str) -> anyhow::Result<bool> {
        Ok(false)
    }
}

pub fn guard(accounts: &[&str]) -> Arc<AdmissionGuard> {
    let selector = HealthSelector::new(
        Arc::new(MemoryRankingStore::new()),
        Arc::new(StaticAccounts::new(accounts)),
        "it:accounts",
        &HealthConfig::default(),
    );
    Arc::new(AdmissionGuard::new(
        Arc::new(RateLimiter::from_config(&RateLimitConfig::default())),
        Arc::new(BackoffTracker::new()),
        Arc::new(selector),
        &BackoffConfig::default(),
    ))
}

/// Observations shared between the test and its handlers.
#[derive(Default)]
pub struct Recorder {
    pub accounts: Mutex<Vec<String>>,
    pub sunk: Mutex<Vec<Vec<String>>>,
}

impl Recorder {
    pub fn sunk_sorted(&self) -> Vec<Vec<String>> {
        let mut pages = self.sunk.lock().unwrap().clone();
        pages.sort();
        pages
    }
}

/// Three-stage pipeline: `fetch` pages through the admission guard, `tag`
/// labels every item of one page, `sink` records each tagged page. `label`
/// is a one-shot configuration source gating `tag`. `slow` waits for
/// cancellation.
pub fn registry(guard: Arc<AdmissionGuard>, recorder: Arc<Recorder>) -> HandlerRegistry {
    let mut r = HandlerRegistry::new();

    let fetch_recorder = recorder.clone();
    r.register_fn("fetch", &[], &["items"], move |node, ctx| {
        fetch(node, ctx, guard.clone(), fetch_recorder.clone())
    })
    .unwrap();
    r.register_fn("label", &[], &["labels"], label).unwrap();
    r.register_fn("tag", &["items", "labels"], &["events"], tag)
        .unwrap();
    let sink_recorder = recorder;
    r.register_fn("sink", &["events"], &[], move |node, ctx| {
        sink(node, ctx, sink_recorder.clone())
    })
    .unwrap();
    r.register_fn("slow", &[], &["out"], slow).unwrap();
    r
}

pub fn engine(guard: Arc<AdmissionGuard>, recorder: Arc<Recorder>) -> WorkflowEngine {
    WorkflowEngine::new(Arc::new(registry(guard, recorder)), EngineConfig::default())
}

fn fetch(
    node: TaskNode,
    ctx: ExecutionContext,
    guard: Arc<AdmissionGuard>,
    recorder: Arc<Recorder>,
) -> NodeStream {
    Box::pin(async_stream::stream! {
        let mut node = node;
        let pages: Vec<Vec<String>> = match node.get("pages") {
            Ok(pages) => pages,
            Err(err) => {
                yield Err(err);
                return;
            }
        };
        for page in pages {
            let recorder = recorder.clone();
            let called = guard
                .call(&ctx.cancel, |account| async move {
                    recorder.accounts.lock().unwrap().push(account);
                    Ok::<_, ClassifiedError>(())
                })
                .await;
            if let Err(err) = called {
                yield Err(err);
                return;
            }
            node.emit("items", json!(page));
            yield Ok(node.snapshot());
        }
    })
}

fn label(node: TaskNode, _ctx: ExecutionContext) -> NodeStream {
    Box::pin(async_stream::stream! {
        let mut node = node;
        let value = node.field("label").cloned().unwrap_or(Value::Null);
        node.emit("labels", value);
        yield Ok::<_, ClassifiedError>(node.snapshot());
    })
}

fn tag(node: TaskNode, _ctx: ExecutionContext) -> NodeStream {
    Box::pin(async_stream::stream! {
        let mut node = node;
        let items: Vec<String> = node.get("items").unwrap_or_default();
        let label: String = node.get("labels").unwrap_or_default();
        if items.iter().any(|i| i == "poison") {
            yield Err(ClassifiedError::application("poisoned page"));
            return;
        }
        let events: Vec<String> = items.iter().map(|i| format!("{label}:{i}")).collect();
        node.emit("events", json!(events));
        yield Ok(node.snapshot());
    })
}

fn sink(node: TaskNode, _ctx: ExecutionContext, recorder: Arc<Recorder>) -> NodeStream {
    Box::pin(async_stream::stream! {
        let mut node = node;
        let events: Vec<String> = node.get("events").unwrap_or_default();
        recorder.sunk.lock().unwrap().push(events);
        yield Ok::<_, ClassifiedError>(node.snapshot());
    })
}

fn slow(node: TaskNode, ctx: ExecutionContext) -> NodeStream {
    Box::pin(async_stream::stream! {
        let mut node = node;
        let cancelled = tokio::select! {
            _ = ctx.cancel.cancelled() => true,
            _ = tokio::time::sleep(Duration::from_secs(3600)) => false,
        };
        if cancelled {
            yield Err(ClassifiedError::cancelled());
            return;
        }
        node.emit("out", json!(true));
        yield Ok(node.snapshot());
    })
}

/// Feed keyed by cursor; a missing cursor yields an empty page.
#[derive(Default)]
pub struct ScriptedFeed {
    pub pages: Mutex<HashMap<Option<String>, Page<Post>>>,
}

impl ScriptedFeed {
    pub fn with(pages: Vec<(Option<&str>, Page<Post>)>) -> Self {
        Self {
            pages: Mutex::new(
                pages
                    .into_iter()
                    .map(|(cursor, page)| (cursor.map(str::to_string), page))
                    .collect(),
            ),
        }
    }
}

#[async_trait]
impl IngestionSource for ScriptedFeed {
    async fn fetch_page(
        &self,
        cursor: Option<&str>,
        _cancel: &CancellationToken,
    ) -> anyhow::Result<Page<Post>> {
        Ok(self
            .pages
            .lock()
            .unwrap()
            .get(&cursor.map(str::to_string))
            .cloned()
            .unwrap_or_else(Page::empty))
    }
}

/// Unbounded queue that hands tasks back in publish order.
#[derive(Default)]
pub struct VecQueue {
    pub tasks: Mutex<Vec<HarvestTask>>,
    pub acked: Mutex<Vec<String>>,
}

impl VecQueue {
    pub fn drain(&self) -> Vec<HarvestTask> {
        std::mem::take(&mut *self.tasks.lock().unwrap())
    }
}

#[async_trait]
impl TaskQueuePlugin for VecQueue {
    async fn publish(&self, task: HarvestTask) -> anyhow::Result<()> {
        self.tasks.lock().unwrap().push(task);
        Ok(())
    }

    async fn receive(&self, _cancel: &CancellationToken) -> anyhow::Result<Option<HarvestTask>> {
        let mut tasks = self.tasks.lock().unwrap();
        Ok((!tasks.is_empty()).then(|| tasks.remove(0)))
    }

    async fn ack(&self, task_id: &str) -> anyhow::Result<()> {
        self.acked.lock().unwrap().push(task_id.to_string());
        Ok(())
    }

    async fn nack(&self, _task_id: &str, _reason: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn close(&self) {}
}

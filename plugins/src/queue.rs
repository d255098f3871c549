use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use harvest_core::api::{
    ExecutionContext, HarvestTask, RunOutcome, TaskQueuePlugin, WorkflowEngine,
};
use serde::Serialize;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::handlers::build_harvest_graph;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub published: u64,
    pub acked: u64,
    pub nacked: u64,
    pub in_flight: usize,
}

/// Bounded in-process queue. Redelivery of nacked tasks is left to whoever
/// replaces this with an external broker; here a nack is counted and logged.
pub struct ChannelTaskQueue {
    tx: Mutex<Option<mpsc::Sender<HarvestTask>>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<HarvestTask>>,
    in_flight: Mutex<HashMap<String, HarvestTask>>,
    published: AtomicU64,
    received: AtomicU64,
    acked: AtomicU64,
    nacked: AtomicU64,
}

impl ChannelTaskQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
            in_flight: Mutex::new(HashMap::new()),
            published: AtomicU64::new(0),
            received: AtomicU64::new(0),
            acked: AtomicU64::new(0),
            nacked: AtomicU64::new(0),
        }
    }

    fn in_flight(&self) -> MutexGuard<'_, HashMap<String, HarvestTask>> {
        self.in_flight.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn sender(&self) -> Option<mpsc::Sender<HarvestTask>> {
        self.tx.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Tasks buffered and not yet received.
    pub fn len(&self) -> usize {
        let published = self.published.load(Ordering::Relaxed);
        let received = self.received.load(Ordering::Relaxed);
        published.saturating_sub(received) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            published: self.published.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            nacked: self.nacked.load(Ordering::Relaxed),
            in_flight: self.in_flight().len(),
        }
    }
}

#[async_trait]
impl TaskQueuePlugin for ChannelTaskQueue {
    async fn publish(&self, task: HarvestTask) -> anyhow::Result<()> {
        let id = task.id.clone();
        let closed = || anyhow::anyhow!("task queue closed, dropping task {id}");
        let tx = self.sender().ok_or_else(closed)?;
        tx.send(task).await.map_err(|_| closed())?;
        self.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn receive(&self, cancel: &CancellationToken) -> anyhow::Result<Option<HarvestTask>> {
        let mut rx = tokio::select! {
            _ = cancel.cancelled() => return Ok(None),
            rx = self.rx.lock() => rx,
        };
        let task = tokio::select! {
            _ = cancel.cancelled() => None,
            task = rx.recv() => task,
        };
        if let Some(task) = &task {
            self.received.fetch_add(1, Ordering::Relaxed);
            self.in_flight().insert(task.id.clone(), task.clone());
        }
        Ok(task)
    }

    async fn ack(&self, task_id: &str) -> anyhow::Result<()> {
        self.in_flight().remove(task_id);
        self.acked.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn nack(&self, task_id: &str, reason: &str) -> anyhow::Result<()> {
        let task = self.in_flight().remove(task_id);
        self.nacked.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            target: "harvest.worker",
            task_id,
            post_id = task.as_ref().map(|t| t.post.id.as_str()).unwrap_or(""),
            reason,
            "task nacked"
        );
        Ok(())
    }

    /// Drops the sending half, so `receive` returns `None` once the
    /// buffer is drained.
    async fn close(&self) {
        self.tx.lock().unwrap_or_else(|p| p.into_inner()).take();
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerReport {
    pub received: u64,
    pub acked: u64,
    pub nacked: u64,
}

#[derive(Debug)]
enum TaskOutcome {
    Acked,
    Nacked,
}

/// Consumes harvest tasks and runs one graph per task, at most
/// `max_parallel` at a time.
pub struct TaskWorker {
    queue: Arc<dyn TaskQueuePlugin>,
    engine: WorkflowEngine,
    max_parallel: usize,
}

impl TaskWorker {
    pub fn new(queue: Arc<dyn TaskQueuePlugin>, engine: WorkflowEngine, max_parallel: usize) -> Self {
        Self {
            queue,
            engine,
            max_parallel: max_parallel.max(1),
        }
    }

    /// Run until the queue is exhausted or `cancel` fires, then wait for the
    /// tasks already started.
    pub async fn run(&self, cancel: &CancellationToken) -> WorkerReport {
        let sem = Arc::new(Semaphore::new(self.max_parallel));
        let mut running = FuturesUnordered::new();
        let mut report = WorkerReport::default();
        let mut open = true;

        tracing::info!(target: "harvest.worker", max_parallel = self.max_parallel, "worker started");

        while open || !running.is_empty() {
            tokio::select! {
                Some(joined) = running.next(), if !running.is_empty() => {
                    match joined {
                        Ok(TaskOutcome::Acked) => report.acked += 1,
                        Ok(TaskOutcome::Nacked) => report.nacked += 1,
                        Err(err) => {
                            report.nacked += 1;
                            tracing::error!(target: "harvest.worker", error = %err, "task panicked");
                        }
                    }
                }
                next = self.next_task(&sem, cancel), if open => {
                    let Some((task, permit)) = next else {
                        open = false;
                        continue;
                    };
                    report.received += 1;
                    let engine = self.engine.clone();
                    let queue = self.queue.clone();
                    let cancel = cancel.clone();
                    running.push(tokio::spawn(async move {
                        let _permit = permit;
                        process_task(&engine, queue.as_ref(), task, &cancel).await
                    }));
                }
            }
        }

        tracing::info!(
            target: "harvest.worker",
            received = report.received,
            acked = report.acked,
            nacked = report.nacked,
            "worker stopped"
        );
        report
    }

    async fn next_task(
        &self,
        sem: &Arc<Semaphore>,
        cancel: &CancellationToken,
    ) -> Option<(HarvestTask, OwnedSemaphorePermit)> {
        let permit = sem.clone().acquire_owned().await.ok()?;
        match self.queue.receive(cancel).await {
            Ok(Some(task)) => Some((task, permit)),
            Ok(None) => None,
            Err(err) => {
                tracing::error!(target: "harvest.worker", error = %err, "task queue receive failed");
                None
            }
        }
    }
}

async fn process_task(
    engine: &WorkflowEngine,
    queue: &dyn TaskQueuePlugin,
    task: HarvestTask,
    cancel: &CancellationToken,
) -> TaskOutcome {
    let task_id = task.id.clone();
    let verdict = match build_harvest_graph(&task) {
        Ok(graph) => {
            let ctx = ExecutionContext::new(cancel.child_token()).with_run_id(task_id.clone());
            match engine.execute_to_completion(graph, ctx).await {
                Ok(result) if result.outcome == RunOutcome::Complete && result.failed() == 0 => {
                    tracing::info!(
                        target: "harvest.worker",
                        task_id = %task_id,
                        post_id = %task.post.id,
                        nodes = result.nodes.len(),
                        duration_ms = result.duration_ms,
                        "task complete"
                    );
                    Ok(())
                }
                Ok(result) => {
                    let failed: Vec<String> = result
                        .nodes
                        .iter()
                        .filter_map(|n| {
                            n.error
                                .as_ref()
                                .map(|e| format!("{}: {}", n.id, e.kind))
                        })
                        .collect();
                    Err(format!("{} [{}]", result.outcome.as_str(), failed.join(", ")))
                }
                Err(err) => Err(err.to_string()),
            }
        }
        Err(err) => Err(err.to_string()),
    };

    let outcome = match &verdict {
        Ok(()) => queue.ack(&task_id).await.map(|_| TaskOutcome::Acked),
        Err(reason) => queue.nack(&task_id, reason).await.map(|_| TaskOutcome::Nacked),
    };
    match outcome {
        Ok(outcome) => outcome,
        Err(err) => {
            tracing::error!(target: "harvest.worker", task_id = %task_id, error = %err, "ack/nack failed");
            match verdict {
                Ok(()) => TaskOutcome::Acked,
                Err(_) => TaskOutcome::Nacked,
            }
        }
    }
}

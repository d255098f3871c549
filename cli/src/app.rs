//! Command wiring: builds services from config and drives the scheduler and
//! the task worker.
use std::time::Duration;

use harvest_core::api::{AdaptiveScheduler, AppContext, CliError, CycleReport, Services};
use harvest_plugins::handlers::check_registry;
use harvest_plugins::queue::{TaskWorker, WorkerReport};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::commands::cli::Commands;

#[derive(Debug, Serialize)]
pub struct OnceSummary {
    pub cycle: CycleReport,
    pub worker: WorkerReport,
}

#[tracing::instrument(name = "cli.run_app", skip(ctx))]
pub async fn run_app(cmd: Commands, ctx: &AppContext) -> Result<i32, CliError> {
    match cmd {
        Commands::Run => run(ctx).await,
        Commands::Once => once(ctx).await,
        Commands::Check => check(ctx).await,
    }
}

async fn run(ctx: &AppContext) -> Result<i32, CliError> {
    let services = ctx.build_services().await?;
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let worker = spawn_worker(ctx, &services, &cancel);
    let mut scheduler = scheduler(ctx, &services);
    let outcome = scheduler.run(&cancel).await;

    // Suspended: let the worker finish what was already published.
    services.queue.close().await;
    let report = join_worker(worker).await?;
    tracing::info!(
        received = report.received,
        acked = report.acked,
        nacked = report.nacked,
        "harvest stopped"
    );

    outcome.map(|_| 0)
}

async fn once(ctx: &AppContext) -> Result<i32, CliError> {
    let services = ctx.build_services().await?;
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    // The worker has to consume while the cycle publishes: the queue is bounded.
    let worker = spawn_worker(ctx, &services, &cancel);
    let cycle = scheduler(ctx, &services).run_cycle(&cancel).await;
    services.queue.close().await;
    let worker = join_worker(worker).await?;
    let cycle = cycle?;

    let summary = OnceSummary { cycle, worker };
    let json = serde_json::to_string_pretty(&summary)
        .map_err(|e| CliError::Command(format!("encode summary: {e}")))?;
    println!("{json}");
    Ok(0)
}

async fn check(ctx: &AppContext) -> Result<i32, CliError> {
    let services = ctx.build_services().await?;
    check_registry(services.engine.registry())?;
    let rendered = toml::to_string_pretty(ctx.cfg())
        .map_err(|e| CliError::Command(format!("render config: {e}")))?;
    println!("{rendered}");
    tracing::info!(
        accounts = ctx.cfg().accounts.len(),
        handlers = services.engine.registry().len(),
        "config ok"
    );
    Ok(0)
}

fn scheduler(ctx: &AppContext, services: &Services) -> AdaptiveScheduler {
    let cfg = ctx.cfg();
    AdaptiveScheduler::new(
        services.source.clone(),
        services.queue.clone(),
        cfg.detector.clone(),
    )
    .with_backoff_sweep(
        services.guard.backoff().clone(),
        Duration::from_millis(cfg.backoff.state_ttl_ms),
    )
}

fn spawn_worker(
    ctx: &AppContext,
    services: &Services,
    cancel: &CancellationToken,
) -> JoinHandle<WorkerReport> {
    let worker = TaskWorker::new(
        services.queue.clone(),
        services.engine.clone(),
        ctx.cfg().worker.max_parallel_tasks,
    );
    let cancel = cancel.clone();
    tokio::spawn(async move { worker.run(&cancel).await })
}

async fn join_worker(handle: JoinHandle<WorkerReport>) -> Result<WorkerReport, CliError> {
    handle
        .await
        .map_err(|e| CliError::Command(format!("task worker failed: {e}")))
}

fn cancel_on_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, shutting down");
            cancel.cancel();
        }
    });
}

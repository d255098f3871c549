//! Node handlers of the standard harvest graph and the graph builder.
//!
//! ```text
//! load_taxonomy --(COMBINE_LATEST taxonomy)--+
//!                                            v
//! collect_post ----(ZIP items)---------> analyze_items --(ZIP events)--> persist_events
//! ```
//!
//! `collect_post` emits once per page (the post itself, then each comment
//! page), so `analyze_items` and `persist_events` run once per page.

mod analyze;
mod collect;
mod persist;
mod taxonomy;

use std::future::Future;
use std::sync::Arc;

use harvest_core::api::{
    classify, AdmissionGuard, AnalyzerPlugin, ClassifiedError, Edge, ExecutionContext,
    ExecutorError, HandlerRegistry, HarvestTask, PersistencePlugin, Post, RetryStrategyPlugin,
    TaskNode, UpstreamPlugin, WorkflowGraph,
};

pub use analyze::AnalyzeItemsHandler;
pub use collect::CollectPostHandler;
pub use persist::PersistEventsHandler;
pub use taxonomy::LoadTaxonomyHandler;

pub const LOAD_TAXONOMY: &str = "load_taxonomy";
pub const COLLECT_POST: &str = "collect_post";
pub const ANALYZE_ITEMS: &str = "analyze_items";
pub const PERSIST_EVENTS: &str = "persist_events";

/// Collaborators shared by every handler of the harvest graph.
#[derive(Clone)]
pub struct HarvestDeps {
    pub upstream: Arc<dyn UpstreamPlugin>,
    pub analyzer: Arc<dyn AnalyzerPlugin>,
    pub persistence: Arc<dyn PersistencePlugin>,
    pub guard: Arc<AdmissionGuard>,
    pub retry: Arc<dyn RetryStrategyPlugin>,
    pub max_comment_pages: usize,
    pub recent_events_limit: usize,
}

pub fn build_registry(deps: &HarvestDeps) -> Result<HandlerRegistry, ExecutorError> {
    let mut registry = HandlerRegistry::new();
    registry.register(Arc::new(LoadTaxonomyHandler::new(
        deps.persistence.clone(),
        deps.recent_events_limit,
    )))?;
    registry.register(Arc::new(CollectPostHandler::new(
        deps.upstream.clone(),
        deps.guard.clone(),
        deps.retry.clone(),
        deps.max_comment_pages,
    )))?;
    registry.register(Arc::new(AnalyzeItemsHandler::new(deps.analyzer.clone())))?;
    registry.register(Arc::new(PersistEventsHandler::new(
        deps.persistence.clone(),
        deps.retry.clone(),
    )))?;
    Ok(registry)
}

/// Graph harvesting one post. Node ids are fixed, so snapshots of different
/// tasks line up.
pub fn build_harvest_graph(task: &HarvestTask) -> Result<WorkflowGraph, ExecutorError> {
    let post =
        serde_json::to_value(&task.post).map_err(|e| ExecutorError::InvalidPayload {
            node_id: "collect".to_string(),
            message: e.to_string(),
        })?;

    let mut graph = WorkflowGraph::new();
    graph.add_node(TaskNode::new("taxonomy", LOAD_TAXONOMY))?;
    graph.add_node(TaskNode::new("collect", COLLECT_POST).with_field("post", post))?;
    graph.add_node(TaskNode::new("analyze", ANALYZE_ITEMS))?;
    graph.add_node(TaskNode::new("persist", PERSIST_EVENTS))?;

    graph.add_edge(Edge::combine_latest(
        "taxonomy->analyze",
        "taxonomy",
        "taxonomy",
        "analyze",
        "taxonomy",
    ))?;
    graph.add_edge(Edge::zip("collect->analyze", "collect", "items", "analyze", "items"))?;
    graph.add_edge(Edge::zip("analyze->persist", "analyze", "events", "persist", "events"))?;
    Ok(graph)
}

/// Check that `registry` can run the harvest graph: every node type is
/// registered and every edge property is declared by its handler.
pub fn check_registry(registry: &HandlerRegistry) -> Result<(), ExecutorError> {
    let probe = HarvestTask::new(Post {
        id: "probe".to_string(),
        author: String::new(),
        text: String::new(),
        url: None,
        created_at: chrono::Utc::now(),
        like_count: 0,
        reply_count: 0,
    });
    build_harvest_graph(&probe)?.validate(registry)
}

/// Await `fut` unless the run is cancelled first.
async fn cancellable<T, Fut>(ctx: &ExecutionContext, fut: Fut) -> Result<T, ClassifiedError>
where
    Fut: Future<Output = anyhow::Result<T>>,
{
    ctx.check_cancelled()?;
    tokio::select! {
        _ = ctx.cancel.cancelled() => Err(ClassifiedError::cancelled()),
        res = fut => res.map_err(|e| classify(&e)),
    }
}

#[cfg(test)]
pub(crate) mod testing;

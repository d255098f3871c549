use std::sync::Arc;

use async_stream::stream;
use harvest_core::api::{ExecutionContext, NodeHandler, NodeStream, PersistencePlugin, TaskNode};

use super::{cancellable, LOAD_TAXONOMY};

/// Reads the category/tag vocabulary and recent events once per run.
pub struct LoadTaxonomyHandler {
    persistence: Arc<dyn PersistencePlugin>,
    recent_limit: usize,
}

impl LoadTaxonomyHandler {
    pub fn new(persistence: Arc<dyn PersistencePlugin>, recent_limit: usize) -> Self {
        Self {
            persistence,
            recent_limit,
        }
    }
}

impl NodeHandler for LoadTaxonomyHandler {
    fn node_type(&self) -> &str {
        LOAD_TAXONOMY
    }

    fn inputs(&self) -> &[&'static str] {
        &[]
    }

    fn outputs(&self) -> &[&'static str] {
        &["taxonomy"]
    }

    fn handle(&self, node: TaskNode, ctx: ExecutionContext) -> NodeStream {
        let persistence = self.persistence.clone();
        let limit = self.recent_limit;
        Box::pin(stream! {
            let mut node = node;
            let taxonomy = match cancellable(&ctx, persistence.load_taxonomy(limit)).await {
                Ok(taxonomy) => taxonomy,
                Err(err) => {
                    yield Err(err);
                    return;
                }
            };
            tracing::debug!(
                target: "harvest.pipeline",
                run_id = %ctx.run_id,
                categories = taxonomy.categories.len(),
                tags = taxonomy.tags.len(),
                recent = taxonomy.recent_events.len(),
                "taxonomy loaded"
            );
            match node.emit_value("taxonomy", &taxonomy) {
                Ok(()) => yield Ok(node.snapshot()),
                Err(err) => yield Err(err),
            }
        })
    }
}

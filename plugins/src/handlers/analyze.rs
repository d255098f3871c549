use std::sync::Arc;

use async_stream::stream;
use harvest_core::api::{
    AnalysisContext, AnalyzerPlugin, ClassifiedError, DerivedEvent, ExecutionContext,
    NodeHandler, NodeStream, TaskNode, Taxonomy,
};
use serde_json::json;

use super::{cancellable, ANALYZE_ITEMS};

/// Analyzes one page of items. A failing item is logged and skipped; the
/// node fails only when no item of a non-empty page could be analyzed.
pub struct AnalyzeItemsHandler {
    analyzer: Arc<dyn AnalyzerPlugin>,
}

impl AnalyzeItemsHandler {
    pub fn new(analyzer: Arc<dyn AnalyzerPlugin>) -> Self {
        Self { analyzer }
    }
}

impl NodeHandler for AnalyzeItemsHandler {
    fn node_type(&self) -> &str {
        ANALYZE_ITEMS
    }

    fn inputs(&self) -> &[&'static str] {
        &["items", "taxonomy"]
    }

    fn outputs(&self) -> &[&'static str] {
        &["events"]
    }

    fn handle(&self, node: TaskNode, ctx: ExecutionContext) -> NodeStream {
        let analyzer = self.analyzer.clone();
        Box::pin(stream! {
            let mut node = node;
            let inputs = node
                .get::<Vec<AnalysisContext>>("items")
                .and_then(|items| Ok((items, node.get::<Taxonomy>("taxonomy")?)));
            let (items, taxonomy) = match inputs {
                Ok(inputs) => inputs,
                Err(err) => {
                    yield Err(err);
                    return;
                }
            };

            let mut events = Vec::with_capacity(items.len());
            let mut failed = 0usize;
            let mut last_error: Option<ClassifiedError> = None;
            for item in &items {
                let analyzed = cancellable(
                    &ctx,
                    analyzer.analyze(item, &taxonomy.categories, &taxonomy.tags, &taxonomy.recent_events),
                )
                .await;
                match analyzed {
                    Ok(result) => events.push(DerivedEvent::new(item, result)),
                    Err(err) if err.is_cancelled() => {
                        yield Err(err);
                        return;
                    }
                    Err(err) => {
                        tracing::warn!(
                            target: "harvest.pipeline",
                            run_id = %ctx.run_id,
                            node = %node.id,
                            source_id = %item.source_id,
                            kind = %err.kind,
                            error = %err.message,
                            "item analysis failed, skipped"
                        );
                        failed += 1;
                        // Keep a retryable cause if there is one so the task is redelivered.
                        if last_error.as_ref().map_or(true, |prev| !prev.is_retryable()) {
                            last_error = Some(err);
                        }
                    }
                }
            }

            if !items.is_empty() && events.is_empty() {
                let cause = last_error.unwrap_or_else(|| ClassifiedError::unknown("analysis failed"));
                yield Err(ClassifiedError {
                    message: format!("all {} items failed analysis: {}", items.len(), cause.message),
                    ..cause
                });
                return;
            }

            node.set_field("failed_items", json!(failed));
            match node.emit_value("events", &events) {
                Ok(()) => yield Ok(node.snapshot()),
                Err(err) => yield Err(err),
            }
        })
    }
}

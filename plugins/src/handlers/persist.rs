use std::sync::Arc;

use async_stream::stream;
use harvest_core::api::{
    retry_with_strategy, ClassifiedError, DerivedEvent, ExecutionContext, NodeHandler, NodeStream,
    PersistencePlugin, RetryStrategyPlugin, TaskNode,
};
use serde_json::{json, Value};

use crate::persistence::DERIVED_EVENTS;

use super::{cancellable, PERSIST_EVENTS};

/// Upserts one page of derived events. Rows are keyed by the event id, so a
/// redelivered task rewrites the same rows.
pub struct PersistEventsHandler {
    persistence: Arc<dyn PersistencePlugin>,
    retry: Arc<dyn RetryStrategyPlugin>,
}

impl PersistEventsHandler {
    pub fn new(persistence: Arc<dyn PersistencePlugin>, retry: Arc<dyn RetryStrategyPlugin>) -> Self {
        Self { persistence, retry }
    }
}

impl NodeHandler for PersistEventsHandler {
    fn node_type(&self) -> &str {
        PERSIST_EVENTS
    }

    fn inputs(&self) -> &[&'static str] {
        &["events"]
    }

    fn outputs(&self) -> &[&'static str] {
        &["stored"]
    }

    fn handle(&self, node: TaskNode, ctx: ExecutionContext) -> NodeStream {
        let persistence = self.persistence.clone();
        let retry = self.retry.clone();
        Box::pin(stream! {
            let mut node = node;
            let events: Vec<DerivedEvent> = match node.get("events") {
                Ok(events) => events,
                Err(err) => {
                    yield Err(err);
                    return;
                }
            };
            if events.is_empty() {
                node.emit("stored", json!(0));
                yield Ok(node.snapshot());
                return;
            }

            let rows = match events
                .iter()
                .map(serde_json::to_value)
                .collect::<Result<Vec<Value>, _>>()
            {
                Ok(rows) => rows,
                Err(err) => {
                    yield Err(ClassifiedError::application(format!("cannot encode events: {err}")));
                    return;
                }
            };

            let write = retry_with_strategy(retry.as_ref(), &ctx.cancel, |_attempt| {
                let persistence = persistence.clone();
                let rows = rows.clone();
                async move { persistence.upsert(DERIVED_EVENTS, rows, &["id"]).await }
            });
            match cancellable(&ctx, write).await {
                Ok(stored) => {
                    tracing::debug!(target: "harvest.pipeline", run_id = %ctx.run_id, node = %node.id, stored, "events persisted");
                    node.emit("stored", json!(stored));
                    yield Ok(node.snapshot());
                }
                Err(err) => yield Err(err),
            }
        })
    }
}

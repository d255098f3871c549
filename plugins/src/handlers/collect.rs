use std::sync::Arc;

use async_stream::stream;
use harvest_core::api::{
    classify, retry_with_strategy, AdmissionGuard, AnalysisContext, ClassifiedError,
    ExecutionContext, NodeHandler, NodeStream, Post, RetryStrategyPlugin, TaskNode,
    UpstreamPlugin,
};
use serde_json::json;

use super::COLLECT_POST;

/// Emits the post body as the first page of `items`, then one page per
/// upstream comment page.
pub struct CollectPostHandler {
    upstream: Arc<dyn UpstreamPlugin>,
    guard: Arc<AdmissionGuard>,
    retry: Arc<dyn RetryStrategyPlugin>,
    max_pages: usize,
}

impl CollectPostHandler {
    pub fn new(
        upstream: Arc<dyn UpstreamPlugin>,
        guard: Arc<AdmissionGuard>,
        retry: Arc<dyn RetryStrategyPlugin>,
        max_pages: usize,
    ) -> Self {
        Self {
            upstream,
            guard,
            retry,
            max_pages,
        }
    }
}

impl NodeHandler for CollectPostHandler {
    fn node_type(&self) -> &str {
        COLLECT_POST
    }

    fn inputs(&self) -> &[&'static str] {
        &["post"]
    }

    fn outputs(&self) -> &[&'static str] {
        &["items"]
    }

    fn handle(&self, node: TaskNode, ctx: ExecutionContext) -> NodeStream {
        let upstream = self.upstream.clone();
        let guard = self.guard.clone();
        let retry = self.retry.clone();
        let max_pages = self.max_pages;

        Box::pin(stream! {
            let mut node = node;
            let post: Post = match node.get("post") {
                Ok(post) => post,
                Err(err) => {
                    yield Err(err);
                    return;
                }
            };

            let first = vec![AnalysisContext::from_post(&post)];
            if let Err(err) = node.emit_value("items", &first) {
                yield Err(err);
                return;
            }
            node.set_field("pages", json!(1));
            yield Ok(node.snapshot());

            let mut cursor: Option<String> = None;
            let mut comment_pages = 0usize;
            while comment_pages < max_pages {
                if let Err(err) = ctx.check_cancelled() {
                    yield Err(err);
                    return;
                }

                let fetched = retry_with_strategy(retry.as_ref(), &ctx.cancel, |_attempt| {
                    let upstream = upstream.clone();
                    let guard = guard.clone();
                    let post_id = post.id.clone();
                    let cursor = cursor.clone();
                    let cancel = ctx.cancel.clone();
                    async move {
                        guard
                            .call(&cancel, |account| async move {
                                upstream
                                    .fetch_comments(&post_id, cursor.as_deref(), &account)
                                    .await
                            })
                            .await
                            .map_err(ClassifiedError::into_propagated)
                    }
                })
                .await;

                let page = match fetched {
                    Ok(page) => page,
                    Err(err) => {
                        let err = classify(&err);
                        tracing::warn!(
                            target: "harvest.pipeline",
                            run_id = %ctx.run_id,
                            post_id = %post.id,
                            kind = %err.kind,
                            error = %err.message,
                            "comment page fetch failed"
                        );
                        yield Err(err);
                        return;
                    }
                };
                if page.is_empty() {
                    break;
                }

                comment_pages += 1;
                let items: Vec<AnalysisContext> =
                    page.items.iter().map(AnalysisContext::from_comment).collect();
                if let Err(err) = node.emit_value("items", &items) {
                    yield Err(err);
                    return;
                }
                node.set_field("pages", json!(comment_pages + 1));
                yield Ok(node.snapshot());

                match page.next_cursor {
                    Some(next) => cursor = Some(next),
                    None => break,
                }
            }

            tracing::debug!(
                target: "harvest.pipeline",
                run_id = %ctx.run_id,
                post_id = %post.id,
                pages = comment_pages + 1,
                "post collected"
            );
        })
    }
}

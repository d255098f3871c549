use std::collections::HashMap;
use std::sync::Arc;

use futures::stream::BoxStream;

use crate::error::{ClassifiedError, ExecutorError};

use super::types::{ExecutionContext, TaskNode};

/// Snapshots of one handler invocation. The stream ending means success; an
/// `Err` item fails the node.
pub type NodeStream = BoxStream<'static, Result<TaskNode, ClassifiedError>>;

/// Processes every node of one type.
pub trait NodeHandler: Send + Sync {
    fn node_type(&self) -> &str;
    /// Properties edges may write into.
    fn inputs(&self) -> &[&'static str];
    /// Properties edges may read from.
    fn outputs(&self) -> &[&'static str];
    fn handle(&self, node: TaskNode, ctx: ExecutionContext) -> NodeStream;
}

type HandlerFn = dyn Fn(TaskNode, ExecutionContext) -> NodeStream + Send + Sync;

/// Closure-backed handler.
pub struct FnHandler {
    node_type: String,
    inputs: Vec<&'static str>,
    outputs: Vec<&'static str>,
    f: Box<HandlerFn>,
}

impl FnHandler {
    pub fn new<F>(
        node_type: impl Into<String>,
        inputs: &[&'static str],
        outputs: &[&'static str],
        f: F,
    ) -> Self
    where
        F: Fn(TaskNode, ExecutionContext) -> NodeStream + Send + Sync + 'static,
    {
        Self {
            node_type: node_type.into(),
            inputs: inputs.to_vec(),
            outputs: outputs.to_vec(),
            f: Box::new(f),
        }
    }
}

impl NodeHandler for FnHandler {
    fn node_type(&self) -> &str {
        &self.node_type
    }

    fn inputs(&self) -> &[&'static str] {
        &self.inputs
    }

    fn outputs(&self) -> &[&'static str] {
        &self.outputs
    }

    fn handle(&self, node: TaskNode, ctx: ExecutionContext) -> NodeStream {
        (self.f)(node, ctx)
    }
}

/// Static dispatch table from node type to handler, fixed before any run starts.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn NodeHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn NodeHandler>) -> Result<(), ExecutorError> {
        let node_type = handler.node_type().to_string();
        if self.handlers.contains_key(&node_type) {
            return Err(ExecutorError::DuplicateHandler(node_type));
        }
        self.handlers.insert(node_type, handler);
        Ok(())
    }

    pub fn register_fn<F>(
        &mut self,
        node_type: &str,
        inputs: &[&'static str],
        outputs: &[&'static str],
        f: F,
    ) -> Result<(), ExecutorError>
    where
        F: Fn(TaskNode, ExecutionContext) -> NodeStream + Send + Sync + 'static,
    {
        self.register(Arc::new(FnHandler::new(node_type, inputs, outputs, f)))
    }

    pub fn get(&self, node_type: &str) -> Option<&Arc<dyn NodeHandler>> {
        self.handlers.get(node_type)
    }

    pub fn contains(&self, node_type: &str) -> bool {
        self.handlers.contains_key(node_type)
    }

    /// Registered node types, sorted.
    pub fn node_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

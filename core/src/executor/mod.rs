//! Task-graph execution engine.
//!
//! Nodes are dispatched to the handler registered for their type. Each
//! handler returns a stream of node snapshots; emitted properties flow along
//! edges to downstream nodes.
//!
//! # Architecture
//!
//! ```text
//! WorkflowGraph { nodes, edges }
//!   ↓
//! WorkflowGraph::validate(&HandlerRegistry) → types, properties, cycles
//!   ↓
//! WorkflowEngine::execute() → Stream<GraphSnapshot>
//!   ↓            ZIP: per-edge FIFO queues, positional pairing
//!   ↓ COMBINE_LATEST: latest value, gate until every source fired once
//!   ↓
//! final GraphSnapshot { outcome: Complete | Incomplete | Cancelled | TimedOut }
//! ```

mod engine;
mod graph;
mod registry;
pub mod types;

pub use engine::WorkflowEngine;
pub use graph::WorkflowGraph;
pub use registry::{FnHandler, HandlerRegistry, NodeHandler, NodeStream};
pub use types::{
    Edge, EdgeMode, ExecutionContext, ExecutionResult, GraphSnapshot, NodeState, RunOutcome,
    TaskNode,
};

use thiserror::Error;

/// Configuration errors raised while building or validating a workflow graph.
///
/// These abort construction before anything is dispatched and are never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    #[error("Duplicate node ID: {0}")]
    DuplicateNodeId(String),

    #[error("Duplicate edge ID: {0}")]
    DuplicateEdgeId(String),

    #[error("Handler already registered for node type '{0}'")]
    DuplicateHandler(String),

    #[error("No handler registered for node type '{node_type}' (node '{node_id}')")]
    UnknownNodeType { node_id: String, node_type: String },

    #[error("Edge '{edge_id}' references missing node '{node_id}'")]
    EdgeEndpointMissing { edge_id: String, node_id: String },

    #[error("Edge '{edge_id}' uses unknown {direction} property '{property}' on node '{node_id}'")]
    UnknownProperty {
        edge_id: String,
        node_id: String,
        property: String,
        direction: &'static str,
    },

    #[error("Circular dependency detected: {0}")]
    CircularDependency(String),

    #[error("Graph has no nodes")]
    EmptyGraph,

    #[error("Invalid payload for node '{node_id}': {message}")]
    InvalidPayload { node_id: String, message: String },
}

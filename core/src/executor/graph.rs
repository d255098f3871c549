use std::collections::{HashMap, HashSet};

use crate::error::ExecutorError;

use super::registry::HandlerRegistry;
use super::types::{Edge, TaskNode};

/// Task nodes plus the data edges between them.
///
/// Topology is fixed once handed to the engine: nodes and edges are only
/// added before `execute`.
#[derive(Debug, Clone, Default)]
pub struct WorkflowGraph {
    nodes: Vec<TaskNode>,
    index: HashMap<String, usize>,
    edges: Vec<Edge>,
}

impl WorkflowGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, node: TaskNode) -> Result<(), ExecutorError> {
        if self.index.contains_key(&node.id) {
            return Err(ExecutorError::DuplicateNodeId(node.id));
        }
        self.index.insert(node.id.clone(), self.nodes.len());
        self.nodes.push(node);
        Ok(())
    }

    pub fn add_edge(&mut self, edge: Edge) -> Result<(), ExecutorError> {
        if self.edges.iter().any(|e| e.id == edge.id) {
            return Err(ExecutorError::DuplicateEdgeId(edge.id));
        }
        self.edges.push(edge);
        Ok(())
    }

    pub fn nodes(&self) -> &[TaskNode] {
        &self.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn node(&self, id: &str) -> Option<&TaskNode> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub(crate) fn into_parts(self) -> (Vec<TaskNode>, Vec<Edge>) {
        (self.nodes, self.edges)
    }

    /// Check the graph against the registry: every node type has a handler,
    /// every edge connects existing nodes through declared properties, and
    /// there is no cycle.
    pub fn validate(&self, registry: &HandlerRegistry) -> Result<(), ExecutorError> {
        if self.nodes.is_empty() {
            return Err(ExecutorError::EmptyGraph);
        }

        for node in &self.nodes {
            if !registry.contains(&node.node_type) {
                return Err(ExecutorError::UnknownNodeType {
                    node_id: node.id.clone(),
                    node_type: node.node_type.clone(),
                });
            }
        }

        for edge in &self.edges {
            let from = self.endpoint(edge, &edge.from)?;
            let to = self.endpoint(edge, &edge.to)?;

            // Both types were checked above.
            if let Some(handler) = registry.get(&from.node_type) {
                if !handler.outputs().contains(&edge.from_property.as_str()) {
                    return Err(ExecutorError::UnknownProperty {
                        edge_id: edge.id.clone(),
                        node_id: from.id.clone(),
                        property: edge.from_property.clone(),
                        direction: "output",
                    });
                }
            }
            if let Some(handler) = registry.get(&to.node_type) {
                if !handler.inputs().contains(&edge.to_property.as_str()) {
                    return Err(ExecutorError::UnknownProperty {
                        edge_id: edge.id.clone(),
                        node_id: to.id.clone(),
                        property: edge.to_property.clone(),
                        direction: "input",
                    });
                }
            }
        }

        if let Some(cycle) = self.detect_cycle() {
            return Err(ExecutorError::CircularDependency(cycle));
        }

        Ok(())
    }

    fn endpoint(&self, edge: &Edge, node_id: &str) -> Result<&TaskNode, ExecutorError> {
        self.node(node_id)
            .ok_or_else(|| ExecutorError::EdgeEndpointMissing {
                edge_id: edge.id.clone(),
                node_id: node_id.to_string(),
            })
    }

    fn successors(&self) -> HashMap<&str, Vec<&str>> {
        let mut out: HashMap<&str, Vec<&str>> = HashMap::new();
        for edge in &self.edges {
            out.entry(edge.from.as_str()).or_default().push(edge.to.as_str());
        }
        out
    }

    fn detect_cycle(&self) -> Option<String> {
        let successors = self.successors();
        let mut visited = HashSet::new();
        let mut stack = Vec::new();

        for node in &self.nodes {
            if !visited.contains(node.id.as_str())
                && dfs_cycle(&successors, &node.id, &mut visited, &mut stack)
            {
                return Some(stack.join(" -> "));
            }
        }
        None
    }
}

fn dfs_cycle<'a>(
    successors: &HashMap<&'a str, Vec<&'a str>>,
    node: &'a str,
    visited: &mut HashSet<&'a str>,
    stack: &mut Vec<&'a str>,
) -> bool {
    visited.insert(node);
    stack.push(node);

    if let Some(next) = successors.get(node) {
        for &succ in next {
            if let Some(pos) = stack.iter().position(|x| *x == succ) {
                stack.push(succ);
                stack.drain(..pos);
                return true;
            }
            if !visited.contains(succ) && dfs_cycle(successors, succ, visited, stack) {
                return true;
            }
        }
    }

    stack.pop();
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::registry::NodeStream;
    use crate::executor::types::ExecutionContext;
    use futures::StreamExt;

    fn noop(node: TaskNode, _ctx: ExecutionContext) -> NodeStream {
        futures::stream::once(async move { Ok(node) }).boxed()
    }

    fn registry() -> HandlerRegistry {
        let mut r = HandlerRegistry::new();
        r.register_fn("fetch", &[], &["items"], noop).unwrap();
        r.register_fn("analyze", &["items", "taxonomy"], &["events"], noop)
            .unwrap();
        r.register_fn("persist", &["events"], &["stored"], noop)
            .unwrap();
        r
    }

    fn pipeline() -> WorkflowGraph {
        let mut g = WorkflowGraph::new();
        g.add_node(TaskNode::new("fetch", "fetch")).unwrap();
        g.add_node(TaskNode::new("analyze", "analyze")).unwrap();
        g.add_node(TaskNode::new("persist", "persist")).unwrap();
        g.add_edge(Edge::zip("e1", "fetch", "items", "analyze", "items"))
            .unwrap();
        g.add_edge(Edge::zip("e2", "analyze", "events", "persist", "events"))
            .unwrap();
        g
    }

    #[test]
    fn valid_pipeline_passes_validation() {
        let g = pipeline();
        assert_eq!(g.validate(&registry()), Ok(()));
        assert_eq!(g.edges().len(), 2);
    }

    #[test]
    fn duplicate_ids_rejected() {
        let mut g = pipeline();
        assert_eq!(
            g.add_node(TaskNode::new("fetch", "fetch")),
            Err(ExecutorError::DuplicateNodeId("fetch".into()))
        );
        assert_eq!(
            g.add_edge(Edge::zip("e1", "fetch", "items", "persist", "events")),
            Err(ExecutorError::DuplicateEdgeId("e1".into()))
        );
    }

    #[test]
    fn unknown_type_and_property_are_configuration_errors() {
        let mut g = pipeline();
        g.add_node(TaskNode::new("mystery", "nope")).unwrap();
        assert!(matches!(
            g.validate(&registry()),
            Err(ExecutorError::UnknownNodeType { .. })
        ));

        let mut g = pipeline();
        g.add_edge(Edge::zip("bad", "fetch", "pages", "analyze", "items"))
            .unwrap();
        assert_eq!(
            g.validate(&registry()),
            Err(ExecutorError::UnknownProperty {
                edge_id: "bad".into(),
                node_id: "fetch".into(),
                property: "pages".into(),
                direction: "output",
            })
        );

        let mut g = pipeline();
        g.add_edge(Edge::zip("dangling", "fetch", "items", "ghost", "items"))
            .unwrap();
        assert!(matches!(
            g.validate(&registry()),
            Err(ExecutorError::EdgeEndpointMissing { .. })
        ));
    }

    #[test]
    fn cycles_are_rejected() {
        let mut r = registry();
        r.register_fn("loop", &["events"], &["items"], noop).unwrap();
        let mut g = pipeline();
        g.add_node(TaskNode::new("back", "loop")).unwrap();
        g.add_edge(Edge::zip("e3", "analyze", "events", "back", "events"))
            .unwrap();
        g.add_edge(Edge::zip("e4", "back", "items", "analyze", "items"))
            .unwrap();

        match g.validate(&r) {
            Err(ExecutorError::CircularDependency(path)) => {
                assert!(path.contains("analyze -> back -> analyze"), "{path}");
            }
            other => panic!("expected cycle, got {other:?}"),
        }
        assert_eq!(WorkflowGraph::new().validate(&r), Err(ExecutorError::EmptyGraph));
    }
}

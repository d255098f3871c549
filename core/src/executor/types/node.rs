use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ClassifiedError;

/// `pending -> running -> {emitting}* -> success | fail`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Pending,
    Running,
    Emitting,
    Success,
    Fail,
}

impl NodeState {
    pub fn is_terminal(self) -> bool {
        matches!(self, NodeState::Success | NodeState::Fail)
    }

    pub fn is_active(self) -> bool {
        matches!(self, NodeState::Running | NodeState::Emitting)
    }
}

/// A unit of work plus its payload fields.
///
/// Handlers receive the node by value and yield [`TaskNode::snapshot`]s of it.
/// Only properties passed to [`TaskNode::emit`] since the previous snapshot
/// are propagated along edges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskNode {
    pub id: String,
    pub node_type: String,
    pub state: NodeState,
    #[serde(default)]
    pub fields: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ClassifiedError>,
    /// Set on invocation instances: the node they were cloned from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(skip)]
    emitted: Vec<String>,
    #[serde(skip)]
    children: Vec<TaskNode>,
}

impl TaskNode {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            state: NodeState::Pending,
            fields: Map::new(),
            error: None,
            origin: None,
            emitted: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Builder-style preset of an input field.
    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    /// Id of the static node this one derives from (itself for static nodes).
    pub fn origin_id(&self) -> &str {
        self.origin.as_deref().unwrap_or(&self.id)
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Typed read of a field. Missing or malformed fields are application errors.
    pub fn get<T: DeserializeOwned>(&self, name: &str) -> Result<T, ClassifiedError> {
        let value = self.fields.get(name).ok_or_else(|| {
            ClassifiedError::application(format!("node '{}' has no field '{name}'", self.id))
        })?;
        serde_json::from_value(value.clone()).map_err(|e| {
            ClassifiedError::application(format!(
                "node '{}' field '{name}' is malformed: {e}",
                self.id
            ))
        })
    }

    pub fn set_field(&mut self, name: impl Into<String>, value: Value) {
        self.fields.insert(name.into(), value);
    }

    pub fn set<T: Serialize>(&mut self, name: &str, value: &T) -> Result<(), ClassifiedError> {
        let value = serde_json::to_value(value).map_err(|e| {
            ClassifiedError::application(format!("cannot encode field '{name}': {e}"))
        })?;
        self.fields.insert(name.to_string(), value);
        Ok(())
    }

    /// Write `name` and mark it for propagation with the next snapshot.
    pub fn emit(&mut self, name: &str, value: Value) {
        self.fields.insert(name.to_string(), value);
        if !self.emitted.iter().any(|p| p == name) {
            self.emitted.push(name.to_string());
        }
    }

    pub fn emit_value<T: Serialize>(&mut self, name: &str, value: &T) -> Result<(), ClassifiedError> {
        self.set(name, value)?;
        if !self.emitted.iter().any(|p| p == name) {
            self.emitted.push(name.to_string());
        }
        Ok(())
    }

    /// Attach a node for the engine to add and dispatch alongside this one.
    pub fn spawn_child(&mut self, child: TaskNode) {
        self.children.push(child);
    }

    pub fn pending_emissions(&self) -> &[String] {
        &self.emitted
    }

    /// Copy of the node carrying the pending emissions and children, which
    /// are then cleared on `self`.
    pub fn snapshot(&mut self) -> TaskNode {
        let snap = self.clone();
        self.emitted.clear();
        self.children.clear();
        snap
    }

    pub(crate) fn take_emitted(&mut self) -> Vec<String> {
        std::mem::take(&mut self.emitted)
    }

    pub(crate) fn take_children(&mut self) -> Vec<TaskNode> {
        std::mem::take(&mut self.children)
    }
}

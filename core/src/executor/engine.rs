use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{BoxStream, SelectAll};
use futures::{Stream, StreamExt};
use serde_json::Value;
use tokio::time::Instant;

use crate::config::EngineConfig;
use crate::error::{ClassifiedError, ExecutorError};

use super::graph::WorkflowGraph;
use super::registry::HandlerRegistry;
use super::types::{
    Edge, EdgeMode, ExecutionContext, ExecutionResult, GraphSnapshot, NodeState, RunOutcome,
    TaskNode,
};

/// Drives workflow graphs against a fixed handler registry.
#[derive(Clone)]
pub struct WorkflowEngine {
    registry: Arc<HandlerRegistry>,
    cfg: EngineConfig,
}

enum HandlerEvent {
    Item(String, Result<TaskNode, ClassifiedError>),
    Done(String),
}

enum Wake {
    Cancelled,
    Idle,
    Event(HandlerEvent),
    Drained,
}

type EventStream = BoxStream<'static, HandlerEvent>;

enum Slot {
    Value(Value),
    /// A source invocation failed before emitting; its position is consumed
    /// without firing the target.
    Gap,
}

/// Values flowing along one ZIP edge, ordered by the source's firing index
/// and then by emission order within each invocation.
#[derive(Default)]
struct ZipLane {
    /// Source invocations that finished and were released, in order.
    released: usize,
    /// Emissions of invocations that are not at the head yet.
    held: BTreeMap<usize, Vec<Value>>,
    /// Invocations that finished out of order, with their failure flag.
    finished: BTreeMap<usize, bool>,
    sent: HashMap<usize, usize>,
    queue: VecDeque<Slot>,
}

impl ZipLane {
    fn push(&mut self, firing: usize, value: Value) {
        *self.sent.entry(firing).or_default() += 1;
        if firing == self.released + 1 {
            self.queue.push_back(Slot::Value(value));
        } else {
            self.held.entry(firing).or_default().push(value);
        }
    }

    fn finish(&mut self, firing: usize, failed: bool) {
        self.finished.insert(firing, failed);
        while let Some(failed) = self.finished.remove(&(self.released + 1)) {
            let head = self.released + 1;
            let sent = self.sent.remove(&head).unwrap_or(0);
            if failed && sent == 0 {
                self.queue.push_back(Slot::Gap);
            }
            self.released = head;
            if let Some(values) = self.held.remove(&(head + 1)) {
                self.queue.extend(values.into_iter().map(Slot::Value));
            }
        }
    }

    fn has_head(&self) -> bool {
        !self.queue.is_empty()
    }

    fn holds_values(&self) -> bool {
        !self.held.is_empty() || self.queue.iter().any(|s| matches!(s, Slot::Value(_)))
    }
}

impl WorkflowEngine {
    pub fn new(registry: Arc<HandlerRegistry>, cfg: EngineConfig) -> Self {
        Self { registry, cfg }
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Validate `graph` and return the stream of snapshots for its run.
    ///
    /// The last item always carries a final [`RunOutcome`]. Dropping the
    /// stream early cancels every handler of the run.
    pub fn execute(
        &self,
        graph: WorkflowGraph,
        ctx: ExecutionContext,
    ) -> Result<impl Stream<Item = GraphSnapshot> + Send + 'static, ExecutorError> {
        graph.validate(&self.registry)?;

        let outer_cancel = ctx.cancel.clone();
        let run_cancel = ctx.cancel.child_token();
        let handler_ctx = ExecutionContext {
            run_id: ctx.run_id.clone(),
            cancel: run_cancel.clone(),
        };
        let idle = self.cfg.idle_timeout_ms.map(Duration::from_millis);
        let mut run = RunState::new(
            graph,
            self.registry.clone(),
            ctx.run_id,
            self.cfg.max_parallel_nodes.max(1),
        );

        Ok(async_stream::stream! {
            let _guard = run_cancel.clone().drop_guard();
            let started = Instant::now();
            let mut streams: SelectAll<EventStream> = SelectAll::new();
            let mut cancelled = false;
            let mut timed_out = false;

            tracing::info!(
                target: "harvest.engine",
                run_id = %run.run_id,
                nodes = run.nodes.len(),
                edges = run.edges.len(),
                "run started"
            );

            run.seed();
            if outer_cancel.is_cancelled() {
                cancelled = true;
                run.halted = true;
            }
            run.dispatch(&mut streams, &handler_ctx);
            yield run.snapshot(RunOutcome::Running);

            while !streams.is_empty() {
                let wake = tokio::select! {
                    _ = outer_cancel.cancelled(), if !cancelled => Wake::Cancelled,
                    wake = next_event(&mut streams, idle) => wake,
                };

                match wake {
                    Wake::Event(event) => {
                        run.apply(event);
                        run.dispatch(&mut streams, &handler_ctx);
                    }
                    Wake::Cancelled => {
                        cancelled = true;
                        run.halted = true;
                        run_cancel.cancel();
                        tracing::warn!(
                            target: "harvest.engine",
                            run_id = %run.run_id,
                            active = run.active,
                            "run cancelled, draining active handlers"
                        );
                    }
                    Wake::Idle => {
                        timed_out = true;
                        run.halted = true;
                        run_cancel.cancel();
                        // Dropping the streams aborts whatever the handlers still hold.
                        streams = SelectAll::new();
                        run.abort_active("idle timeout exceeded");
                        tracing::warn!(
                            target: "harvest.engine",
                            run_id = %run.run_id,
                            idle_ms = idle.map(|d| d.as_millis() as u64).unwrap_or_default(),
                            "run timed out waiting for handlers"
                        );
                        break;
                    }
                    Wake::Drained => break,
                }
                yield run.snapshot(RunOutcome::Running);
            }

            let outcome = run.final_outcome(cancelled || outer_cancel.is_cancelled(), timed_out);
            tracing::info!(
                target: "harvest.engine",
                run_id = %run.run_id,
                outcome = outcome.as_str(),
                duration_ms = started.elapsed().as_millis() as u64,
                "run finished"
            );
            yield run.snapshot(outcome);
        })
    }

    /// Run `graph` and keep only the final snapshot.
    pub async fn execute_to_completion(
        &self,
        graph: WorkflowGraph,
        ctx: ExecutionContext,
    ) -> Result<ExecutionResult, ExecutorError> {
        let run_id = ctx.run_id.clone();
        let started = Instant::now();
        let stream = self.execute(graph, ctx)?;
        futures::pin_mut!(stream);

        let mut last: Option<GraphSnapshot> = None;
        let mut snapshots = 0u64;
        while let Some(snapshot) = stream.next().await {
            snapshots += 1;
            last = Some(snapshot);
        }

        let (outcome, nodes) = match last {
            Some(s) => (s.outcome, s.nodes),
            None => (RunOutcome::Cancelled, Vec::new()),
        };
        Ok(ExecutionResult {
            run_id,
            outcome,
            nodes,
            duration_ms: started.elapsed().as_millis() as u64,
            snapshots,
        })
    }
}

async fn next_event(streams: &mut SelectAll<EventStream>, idle: Option<Duration>) -> Wake {
    let next = match idle {
        Some(limit) => match tokio::time::timeout(limit, streams.next()).await {
            Ok(next) => next,
            Err(_) => return Wake::Idle,
        },
        None => streams.next().await,
    };
    match next {
        Some(event) => Wake::Event(event),
        None => Wake::Drained,
    }
}

/// Mutable bookkeeping of one run. Owned by the run's stream, never shared.
struct RunState {
    run_id: String,
    registry: Arc<HandlerRegistry>,
    max_parallel: usize,
    /// Static nodes first, then instances and children in creation order.
    nodes: Vec<TaskNode>,
    index: HashMap<String, usize>,
    /// Pre-run copies of static nodes, cloned for later ZIP firings.
    blueprints: HashMap<String, TaskNode>,
    edges: Vec<Edge>,
    outgoing: HashMap<String, Vec<usize>>,
    zip_in: HashMap<String, Vec<usize>>,
    gate_in: HashMap<String, Vec<usize>>,
    zip_lanes: HashMap<usize, ZipLane>,
    latest: HashMap<usize, Value>,
    zip_firings: HashMap<String, usize>,
    /// Firing index of every ZIP instance; static nodes are firing 1.
    firing_of: HashMap<String, usize>,
    gate_fired: HashSet<String>,
    ready: VecDeque<String>,
    active: usize,
    halted: bool,
    sequence: u64,
}

impl RunState {
    fn new(
        graph: WorkflowGraph,
        registry: Arc<HandlerRegistry>,
        run_id: String,
        max_parallel: usize,
    ) -> Self {
        let (nodes, edges) = graph.into_parts();
        let index = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.clone(), i))
            .collect();
        let blueprints = nodes.iter().map(|n| (n.id.clone(), n.clone())).collect();

        let mut outgoing: HashMap<String, Vec<usize>> = HashMap::new();
        let mut zip_in: HashMap<String, Vec<usize>> = HashMap::new();
        let mut gate_in: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, edge) in edges.iter().enumerate() {
            outgoing.entry(edge.from.clone()).or_default().push(i);
            match edge.mode {
                EdgeMode::Zip => zip_in.entry(edge.to.clone()).or_default().push(i),
                EdgeMode::CombineLatest => gate_in.entry(edge.to.clone()).or_default().push(i),
            }
        }

        Self {
            run_id,
            registry,
            max_parallel,
            nodes,
            index,
            blueprints,
            edges,
            outgoing,
            zip_in,
            gate_in,
            zip_lanes: HashMap::new(),
            latest: HashMap::new(),
            zip_firings: HashMap::new(),
            firing_of: HashMap::new(),
            gate_fired: HashSet::new(),
            ready: VecDeque::new(),
            active: 0,
            halted: false,
            sequence: 0,
        }
    }

    /// Queue every node without incoming edges.
    fn seed(&mut self) {
        for node in &self.nodes {
            if !self.zip_in.contains_key(&node.id) && !self.gate_in.contains_key(&node.id) {
                self.ready.push_back(node.id.clone());
            }
        }
    }

    fn node_mut(&mut self, id: &str) -> Option<&mut TaskNode> {
        let idx = *self.index.get(id)?;
        self.nodes.get_mut(idx)
    }

    fn snapshot(&mut self, outcome: RunOutcome) -> GraphSnapshot {
        self.sequence += 1;
        GraphSnapshot {
            run_id: self.run_id.clone(),
            sequence: self.sequence,
            outcome,
            nodes: self.nodes.clone(),
        }
    }

    /// Start ready nodes until the parallelism limit is reached.
    fn dispatch(&mut self, streams: &mut SelectAll<EventStream>, ctx: &ExecutionContext) {
        while !self.halted && self.active < self.max_parallel {
            let Some(id) = self.ready.pop_front() else {
                break;
            };
            let registry = self.registry.clone();
            let Some(node) = self.node_mut(&id) else {
                continue;
            };
            if node.state != NodeState::Pending {
                continue;
            }
            let Some(handler) = registry.get(&node.node_type) else {
                node.state = NodeState::Fail;
                node.error = Some(ClassifiedError::configuration(format!(
                    "no handler registered for node type '{}'",
                    node.node_type
                )));
                tracing::error!(target: "harvest.engine", node = %id, node_type = %node.node_type, "unregistered node type");
                continue;
            };

            node.state = NodeState::Running;
            let input = node.clone();
            tracing::debug!(target: "harvest.engine", node = %id, node_type = %input.node_type, "node dispatched");

            let item_id = id.clone();
            let events = handler
                .handle(input, ctx.clone())
                .map(move |item| HandlerEvent::Item(item_id.clone(), item))
                .chain(futures::stream::once(async move { HandlerEvent::Done(id) }));
            streams.push(events.boxed());
            self.active += 1;
        }
    }

    fn apply(&mut self, event: HandlerEvent) {
        match event {
            HandlerEvent::Item(id, Ok(snapshot)) => self.on_emission(&id, snapshot),
            HandlerEvent::Item(id, Err(err)) => self.on_failure(&id, err),
            HandlerEvent::Done(id) => self.on_done(&id),
        }
    }

    fn on_emission(&mut self, id: &str, mut snapshot: TaskNode) {
        let emitted = snapshot.take_emitted();
        let children = snapshot.take_children();

        let origin = {
            let Some(node) = self.node_mut(id) else {
                return;
            };
            if node.state.is_terminal() {
                return;
            }
            node.fields = snapshot.fields;
            node.state = NodeState::Emitting;
            node.origin_id().to_string()
        };
        let firing = self.firing(id);

        for property in emitted {
            let value = self
                .node_mut(id)
                .and_then(|n| n.fields.get(&property).cloned());
            match value {
                Some(value) => self.propagate(&origin, firing, &property, value),
                None => tracing::warn!(
                    target: "harvest.engine",
                    node = %id,
                    property = %property,
                    "emitted property has no value"
                ),
            }
        }

        for child in children {
            self.add_child(id, child);
        }
    }

    fn on_failure(&mut self, id: &str, err: ClassifiedError) {
        let Some(node) = self.node_mut(id) else {
            return;
        };
        if node.state.is_terminal() {
            return;
        }
        tracing::warn!(
            target: "harvest.engine",
            node = %id,
            kind = %err.kind,
            error = %err.message,
            "node failed"
        );
        node.state = NodeState::Fail;
        node.error = Some(err);
    }

    fn on_done(&mut self, id: &str) {
        self.active = self.active.saturating_sub(1);
        let Some(node) = self.node_mut(id) else {
            return;
        };
        if node.state.is_active() {
            node.state = NodeState::Success;
            tracing::debug!(target: "harvest.engine", node = %id, "node succeeded");
        }
        let failed = node.state == NodeState::Fail;
        let origin = node.origin_id().to_string();
        let firing = self.firing(id);
        self.release(&origin, firing, failed);
    }

    fn firing(&self, id: &str) -> usize {
        self.firing_of.get(id).copied().unwrap_or(1)
    }

    /// Let the values of the next source invocations through once every
    /// earlier invocation of `origin` has finished.
    fn release(&mut self, origin: &str, firing: usize, failed: bool) {
        let Some(edge_ids) = self.outgoing.get(origin).cloned() else {
            return;
        };
        let mut targets = Vec::new();
        for e in edge_ids {
            let edge = &self.edges[e];
            if edge.mode != EdgeMode::Zip {
                continue;
            }
            let target = edge.to.clone();
            self.zip_lanes.entry(e).or_default().finish(firing, failed);
            if !targets.contains(&target) {
                targets.push(target);
            }
        }
        for target in targets {
            self.try_fire(&target);
        }
    }

    fn propagate(&mut self, from_origin: &str, firing: usize, property: &str, value: Value) {
        let Some(edge_ids) = self.outgoing.get(from_origin).cloned() else {
            return;
        };

        let mut targets = Vec::new();
        for e in edge_ids {
            let (target, to_property, mode) = {
                let edge = &self.edges[e];
                if edge.from_property != property {
                    continue;
                }
                (edge.to.clone(), edge.to_property.clone(), edge.mode)
            };
            match mode {
                EdgeMode::CombineLatest => {
                    self.latest.insert(e, value.clone());
                    if let Some(node) = self.node_mut(&target) {
                        if node.state == NodeState::Pending {
                            node.fields.insert(to_property, value.clone());
                        }
                    }
                }
                EdgeMode::Zip => {
                    self.zip_lanes
                        .entry(e)
                        .or_default()
                        .push(firing, value.clone());
                }
            }
            if !targets.contains(&target) {
                targets.push(target);
            }
        }

        for target in targets {
            self.try_fire(&target);
        }
    }

    /// Dispatch `target` (or a new instance of it) for every complete input set.
    fn try_fire(&mut self, target: &str) {
        let gates = self.gate_in.get(target).cloned().unwrap_or_default();
        if !gates.iter().all(|e| self.latest.contains_key(e)) {
            return;
        }

        let zips = self.zip_in.get(target).cloned().unwrap_or_default();
        if zips.is_empty() {
            if self.gate_fired.insert(target.to_string()) {
                self.ready.push_back(target.to_string());
            }
            return;
        }

        while zips
            .iter()
            .all(|e| self.zip_lanes.get(e).is_some_and(ZipLane::has_head))
        {
            let mut inputs = Vec::with_capacity(zips.len() + gates.len());
            let mut gap = false;
            for e in &zips {
                match self.zip_lanes.get_mut(e).and_then(|l| l.queue.pop_front()) {
                    Some(Slot::Value(value)) => {
                        inputs.push((self.edges[*e].to_property.clone(), value))
                    }
                    Some(Slot::Gap) | None => gap = true,
                }
            }
            if gap {
                tracing::debug!(target: "harvest.engine", node = %target, "input position lost to an upstream failure");
                continue;
            }
            for e in &gates {
                if let Some(value) = self.latest.get(e) {
                    inputs.push((self.edges[*e].to_property.clone(), value.clone()));
                }
            }

            let firing = {
                let count = self.zip_firings.entry(target.to_string()).or_insert(0);
                *count += 1;
                *count
            };
            let node_id = if firing == 1 {
                target.to_string()
            } else {
                match self.spawn_instance(target, firing) {
                    Some(id) => id,
                    None => return,
                }
            };

            if let Some(node) = self.node_mut(&node_id) {
                for (property, value) in inputs {
                    node.fields.insert(property, value);
                }
            }
            tracing::debug!(target: "harvest.engine", node = %node_id, firing, "inputs aligned");
            self.ready.push_back(node_id);
        }
    }

    fn spawn_instance(&mut self, origin: &str, firing: usize) -> Option<String> {
        let mut instance = self.blueprints.get(origin)?.clone();
        instance.id = format!("{origin}#{firing}");
        instance.origin = Some(origin.to_string());
        instance.state = NodeState::Pending;
        let id = instance.id.clone();
        self.firing_of.insert(id.clone(), firing);
        self.push_node(instance);
        Some(id)
    }

    fn push_node(&mut self, node: TaskNode) {
        self.index.insert(node.id.clone(), self.nodes.len());
        self.nodes.push(node);
    }

    fn add_child(&mut self, parent: &str, mut child: TaskNode) {
        if self.index.contains_key(&child.id) {
            tracing::warn!(target: "harvest.engine", parent, child = %child.id, "child id already in graph, dropped");
            return;
        }
        child.state = NodeState::Pending;
        child.error = None;
        let id = child.id.clone();
        let registered = self.registry.contains(&child.node_type);
        if !registered {
            child.state = NodeState::Fail;
            child.error = Some(ClassifiedError::configuration(format!(
                "no handler registered for node type '{}'",
                child.node_type
            )));
        }
        tracing::debug!(target: "harvest.engine", parent, child = %id, registered, "child node added");
        self.push_node(child);
        if registered {
            self.ready.push_back(id);
        }
    }

    /// Fail every node that is still running.
    fn abort_active(&mut self, reason: &str) {
        for node in &mut self.nodes {
            if node.state.is_active() {
                node.state = NodeState::Fail;
                node.error = Some(ClassifiedError::new(
                    crate::error::ErrorKind::Cancelled,
                    reason,
                ));
            }
        }
        self.active = 0;
    }

    fn final_outcome(&self, cancelled: bool, timed_out: bool) -> RunOutcome {
        let mut pending: Vec<String> = self
            .nodes
            .iter()
            .filter(|n| !n.state.is_terminal())
            .map(|n| n.id.clone())
            .collect();

        // Values left in a ZIP queue are a firing that never aligned.
        let mut waiting: Vec<String> = self
            .zip_in
            .iter()
            .filter(|(_, edges)| {
                edges
                    .iter()
                    .any(|e| self.zip_lanes.get(e).is_some_and(ZipLane::holds_values))
            })
            .filter_map(|(target, _)| match self.zip_firings.get(target) {
                Some(&fired) if fired > 0 => Some(format!("{target}#{}", fired + 1)),
                _ => None,
            })
            .collect();
        waiting.sort();
        pending.extend(waiting);

        if timed_out {
            RunOutcome::TimedOut
        } else if pending.is_empty() {
            RunOutcome::Complete
        } else if cancelled {
            RunOutcome::Cancelled
        } else {
            RunOutcome::Incomplete { pending }
        }
    }
}

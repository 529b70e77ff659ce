//! Super-step execution engine.
//!
//! One super-step: every scheduled task runs concurrently, the outputs are
//! merged into state through the flow's reducers, edges determine the next
//! task set, and a checkpoint is written. Direct-edge successors are
//! deduplicated within a step, which gives fan-out joins their reducer-wait
//! semantics: the successor of N parallel dispatches runs once, after all N
//! have produced a node end. Dispatch tasks are never deduplicated.
//!
//! Cancellation is cooperative: the flag is consulted between super-steps,
//! running nodes always finish, and the checkpoint written at the end of the
//! last completed step remains the resume point.

use crate::dispatch::{NodeResult, Route};
use crate::error::{GraphError, Result};
use crate::events::{EventSink, ExecEvent};
use crate::graph::{Edge, NodeContext, NodeId, NodeSpec, END, START};
use crate::state::StateSchema;
use flowgraph_checkpoint::{Checkpoint, CheckpointStore, TaskDescriptor};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Default super-step budget.
pub const DEFAULT_RECURSION_LIMIT: usize = 50;

/// Default event channel capacity for streamed runs.
pub const DEFAULT_EVENT_BUFFER: usize = 256;

/// Cooperative cancellation flag shared between the cancellation bus, the
/// runtime, and the event emitter.
pub type CancelFlag = Arc<AtomicBool>;

/// Per-run configuration.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Thread identity; owns the checkpoint lineage.
    pub thread_id: String,
    /// Super-step budget; exceeding it fails the run.
    pub recursion_limit: usize,
    /// Cancellation flag consulted between super-steps.
    pub cancel: CancelFlag,
    /// Resume from this checkpoint instead of the latest one.
    pub checkpoint_id: Option<String>,
    /// Opaque configuration forwarded into every [`NodeContext`].
    pub context: Value,
}

impl RunConfig {
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            recursion_limit: DEFAULT_RECURSION_LIMIT,
            cancel: Arc::new(AtomicBool::new(false)),
            checkpoint_id: None,
            context: Value::Null,
        }
    }

    pub fn with_recursion_limit(mut self, limit: usize) -> Self {
        self.recursion_limit = limit;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_checkpoint_id(mut self, checkpoint_id: impl Into<String>) -> Self {
        self.checkpoint_id = Some(checkpoint_id.into());
        self
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }
}

/// Static description of a compiled flow, served by introspection endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct GraphStructure {
    pub name: String,
    pub nodes: Vec<String>,
    pub edges: Vec<EdgeInfo>,
}

/// One edge in a [`GraphStructure`].
#[derive(Debug, Clone, Serialize)]
pub struct EdgeInfo {
    pub from: String,
    pub to: String,
    /// `direct`, `conditional`, or `dispatch`.
    pub kind: &'static str,
}

/// An executable flow graph.
pub struct CompiledFlow {
    name: String,
    nodes: HashMap<NodeId, NodeSpec>,
    edges: HashMap<NodeId, Vec<Edge>>,
    dispatch_edges: Vec<(NodeId, NodeId)>,
    schema: StateSchema,
    checkpointer: Option<Arc<dyn CheckpointStore>>,
}

impl CompiledFlow {
    pub(crate) fn from_parts(
        name: String,
        nodes: HashMap<NodeId, NodeSpec>,
        edges: HashMap<NodeId, Vec<Edge>>,
        dispatch_edges: Vec<(NodeId, NodeId)>,
        schema: StateSchema,
    ) -> Self {
        Self {
            name,
            nodes,
            edges,
            dispatch_edges,
            schema,
            checkpointer: None,
        }
    }

    /// Attach a checkpoint store. Without one the flow runs fully in memory
    /// (used for sub-flow invocations).
    pub fn with_checkpointer(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpointer = Some(store);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &StateSchema {
        &self.schema
    }

    /// Static node/edge description, including declared dispatch fan-outs.
    pub fn structure(&self) -> GraphStructure {
        let mut nodes: Vec<String> = self.nodes.keys().cloned().collect();
        nodes.sort();
        let mut edges = Vec::new();
        let mut sources: Vec<&String> = self.edges.keys().collect();
        sources.sort();
        for from in sources {
            for edge in &self.edges[from] {
                match edge {
                    Edge::Direct(to) => edges.push(EdgeInfo {
                        from: from.clone(),
                        to: to.clone(),
                        kind: "direct",
                    }),
                    Edge::Conditional { branches, .. } => {
                        let mut targets: Vec<&String> = branches.values().collect();
                        targets.sort();
                        targets.dedup();
                        for to in targets {
                            edges.push(EdgeInfo {
                                from: from.clone(),
                                to: to.clone(),
                                kind: "conditional",
                            });
                        }
                    }
                }
            }
        }
        for (from, to) in &self.dispatch_edges {
            edges.push(EdgeInfo {
                from: from.clone(),
                to: to.clone(),
                kind: "dispatch",
            });
        }
        GraphStructure {
            name: self.name.clone(),
            nodes,
            edges,
        }
    }

    /// Run to completion without streaming. `input = None` resumes from the
    /// checkpoint selected by the config.
    pub async fn invoke(&self, input: Option<Value>, config: &RunConfig) -> Result<Value> {
        self.run(input, config, EventSink::noop()).await
    }

    /// Run while streaming [`ExecEvent`]s. The producer task owns the sender;
    /// the channel closes when execution finishes or fails.
    pub fn stream(self: &Arc<Self>, input: Option<Value>, config: RunConfig) -> mpsc::Receiver<ExecEvent> {
        let (tx, rx) = mpsc::channel(DEFAULT_EVENT_BUFFER);
        let flow = Arc::clone(self);
        tokio::spawn(async move {
            let sink = EventSink::new(tx);
            if let Err(error) = flow.run(input, &config, sink.clone()).await {
                warn!(flow = %flow.name, thread_id = %config.thread_id, %error, "flow run failed");
                sink.emit(ExecEvent::GraphError {
                    error: error.to_string(),
                })
                .await;
            }
        });
        rx
    }

    /// Latest checkpoint for a thread.
    pub async fn state(&self, thread_id: &str) -> Result<Option<Checkpoint>> {
        Ok(self.checkpointer()?.get_latest(thread_id).await?)
    }

    /// A specific checkpoint for a thread.
    pub async fn state_at(&self, thread_id: &str, checkpoint_id: &str) -> Result<Option<Checkpoint>> {
        Ok(self.checkpointer()?.get(thread_id, checkpoint_id).await?)
    }

    /// Ancestry of the latest checkpoint, newest first.
    pub async fn state_history(&self, thread_id: &str) -> Result<Vec<Checkpoint>> {
        Ok(self.checkpointer()?.list_ancestry(thread_id).await?)
    }

    /// Merge an external update into the latest checkpoint and persist the
    /// result as a new checkpoint.
    pub async fn update_state(&self, thread_id: &str, update: Value) -> Result<Checkpoint> {
        let store = self.checkpointer()?;
        let latest = store
            .get_latest(thread_id)
            .await?
            .ok_or_else(|| GraphError::Execution(format!("no checkpoint for thread {thread_id}")))?;
        let mut values = latest.values.clone();
        self.schema.apply(&mut values, &update)?;
        let checkpoint = Checkpoint::new(
            Some(latest.id),
            values,
            latest.next_nodes,
            latest.tasks,
        );
        store.put(thread_id, &checkpoint).await?;
        Ok(checkpoint)
    }

    fn checkpointer(&self) -> Result<&Arc<dyn CheckpointStore>> {
        self.checkpointer
            .as_ref()
            .ok_or_else(|| GraphError::Execution("flow has no checkpointer attached".into()))
    }

    async fn run(&self, input: Option<Value>, config: &RunConfig, sink: EventSink) -> Result<Value> {
        let thread_id = config.thread_id.clone();
        sink.emit(ExecEvent::GraphStart).await;

        let (mut state, mut tasks, mut parent_id) = match input {
            Some(initial) => {
                // New input on a known thread continues its lineage: the
                // update is merged into the latest checkpoint's values and
                // the new checkpoint descends from it.
                let mut state = Map::new();
                let mut parent_id = None;
                if let Some(store) = &self.checkpointer {
                    if let Some(latest) = store.get_latest(&thread_id).await? {
                        state = latest.values;
                        parent_id = Some(latest.id);
                    }
                }
                self.schema.apply(&mut state, &initial)?;
                let tasks = self.entry_tasks(&state)?;
                let parent_id = self
                    .write_checkpoint(&thread_id, parent_id, &state, &tasks, &sink)
                    .await?;
                (state, tasks, parent_id)
            }
            None => {
                let store = self.checkpointer()?;
                let checkpoint = match &config.checkpoint_id {
                    Some(id) => store.get(&thread_id, id).await?,
                    None => store.get_latest(&thread_id).await?,
                }
                .ok_or_else(|| {
                    GraphError::Execution(format!("no checkpoint to resume for thread {thread_id}"))
                })?;
                info!(
                    flow = %self.name,
                    thread_id,
                    checkpoint_id = %checkpoint.id,
                    pending = checkpoint.tasks.len(),
                    "resuming from checkpoint"
                );
                let mut tasks = checkpoint.tasks.clone();
                if tasks.is_empty() && !checkpoint.next_nodes.is_empty() {
                    let state_value = Value::Object(checkpoint.values.clone());
                    tasks = checkpoint
                        .next_nodes
                        .iter()
                        .map(|node| TaskDescriptor::new(node.clone(), state_value.clone()))
                        .collect();
                }
                (checkpoint.values.clone(), tasks, Some(checkpoint.id))
            }
        };

        let mut steps = 0usize;
        while !tasks.is_empty() {
            if config.cancel.load(Ordering::Relaxed) {
                info!(flow = %self.name, thread_id, "cancellation observed, stopping between super-steps");
                return Ok(Value::Object(state));
            }
            steps += 1;
            if steps > config.recursion_limit {
                return Err(GraphError::RecursionLimit {
                    limit: config.recursion_limit,
                });
            }
            debug!(flow = %self.name, thread_id, step = steps, tasks = tasks.len(), "super-step");

            let outcomes = self.run_step(std::mem::take(&mut tasks), config, &sink).await?;

            for (_, result) in &outcomes {
                if let Some(update) = result.update() {
                    self.schema.apply(&mut state, update)?;
                }
            }

            tasks = self.next_tasks(&state, &outcomes)?;
            parent_id = self
                .write_checkpoint(&thread_id, parent_id, &state, &tasks, &sink)
                .await?;
        }

        let final_state = Value::Object(state);
        sink.emit(ExecEvent::GraphEnd {
            state: final_state.clone(),
        })
        .await;
        Ok(final_state)
    }

    /// Run every task of one super-step concurrently and collect results in
    /// completion order.
    async fn run_step(
        &self,
        tasks: Vec<TaskDescriptor>,
        config: &RunConfig,
        sink: &EventSink,
    ) -> Result<Vec<(TaskDescriptor, NodeResult)>> {
        let mut join_set = JoinSet::new();
        for task in tasks {
            let spec = self.nodes.get(&task.node).ok_or_else(|| {
                GraphError::Execution(format!("scheduled node '{}' does not exist", task.node))
            })?;
            let executor = Arc::clone(&spec.executor);
            let ctx = NodeContext {
                thread_id: config.thread_id.clone(),
                run_id: task.run_id.clone(),
                node: task.node.clone(),
                events: sink.clone(),
                cancel: Arc::clone(&config.cancel),
                config: config.context.clone(),
            };
            join_set.spawn(async move {
                ctx.events
                    .emit(ExecEvent::NodeStart {
                        node: task.node.clone(),
                        run_id: task.run_id.clone(),
                        input: task.input.clone(),
                    })
                    .await;
                let result = executor(task.input.clone(), ctx.clone()).await;
                if let Ok(node_result) = &result {
                    ctx.events
                        .emit(ExecEvent::NodeEnd {
                            node: task.node.clone(),
                            run_id: task.run_id.clone(),
                            output: node_result.update().cloned().unwrap_or(Value::Null),
                        })
                        .await;
                }
                (task, result)
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            let (task, result) =
                joined.map_err(|e| GraphError::Execution(format!("task panicked: {e}")))?;
            match result {
                Ok(node_result) => outcomes.push((task, node_result)),
                Err(error) => {
                    return Err(GraphError::node_execution(task.node, error.to_string()));
                }
            }
        }
        Ok(outcomes)
    }

    /// Resolve the next task set from node results and edges. Direct (and
    /// single-target conditional) successors are deduplicated within the
    /// step; dispatches are not.
    fn next_tasks(
        &self,
        state: &Map<String, Value>,
        outcomes: &[(TaskDescriptor, NodeResult)],
    ) -> Result<Vec<TaskDescriptor>> {
        let state_value = Value::Object(state.clone());
        let mut next = Vec::new();
        let mut seen_direct: HashSet<String> = HashSet::new();

        for (task, result) in outcomes {
            for dispatch in result.dispatches() {
                next.push(TaskDescriptor::new(dispatch.node.clone(), dispatch.input.clone()));
            }
            let output = result.update().cloned().unwrap_or(Value::Null);
            for edge in self.edges.get(&task.node).map(Vec::as_slice).unwrap_or(&[]) {
                let route = match edge {
                    Edge::Direct(to) => Route::To(to.clone()),
                    Edge::Conditional { router, .. } => router(&state_value, &output),
                };
                match route {
                    Route::To(to) if to != END => {
                        if seen_direct.insert(to.clone()) {
                            next.push(TaskDescriptor::new(to, state_value.clone()));
                        }
                    }
                    Route::To(_) | Route::End => {}
                    Route::Dispatch(dispatches) => {
                        for dispatch in dispatches {
                            next.push(TaskDescriptor::new(dispatch.node, dispatch.input));
                        }
                    }
                }
            }
        }
        Ok(next)
    }

    fn entry_tasks(&self, state: &Map<String, Value>) -> Result<Vec<TaskDescriptor>> {
        let state_value = Value::Object(state.clone());
        let mut tasks = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        for edge in self.edges.get(START).map(Vec::as_slice).unwrap_or(&[]) {
            let route = match edge {
                Edge::Direct(to) => Route::To(to.clone()),
                Edge::Conditional { router, .. } => router(&state_value, &Value::Null),
            };
            match route {
                Route::To(to) if to != END => {
                    if seen.insert(to.clone()) {
                        tasks.push(TaskDescriptor::new(to, state_value.clone()));
                    }
                }
                Route::To(_) | Route::End => {}
                Route::Dispatch(dispatches) => {
                    for dispatch in dispatches {
                        tasks.push(TaskDescriptor::new(dispatch.node, dispatch.input));
                    }
                }
            }
        }
        if tasks.is_empty() {
            return Err(GraphError::Execution("no entry tasks resolved".into()));
        }
        Ok(tasks)
    }

    async fn write_checkpoint(
        &self,
        thread_id: &str,
        parent_id: Option<String>,
        state: &Map<String, Value>,
        tasks: &[TaskDescriptor],
        sink: &EventSink,
    ) -> Result<Option<String>> {
        let Some(store) = &self.checkpointer else {
            return Ok(parent_id);
        };
        let next_nodes = tasks.iter().map(|t| t.node.clone()).collect();
        let checkpoint = Checkpoint::new(parent_id, state.clone(), next_nodes, tasks.to_vec());
        store.put(thread_id, &checkpoint).await?;
        sink.emit(ExecEvent::CheckpointSaved {
            checkpoint_id: checkpoint.id.clone(),
        })
        .await;
        Ok(Some(checkpoint.id))
    }
}

impl std::fmt::Debug for CompiledFlow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledFlow")
            .field("name", &self.name)
            .field("nodes", &self.nodes.keys().collect::<Vec<_>>())
            .field("checkpointer", &self.checkpointer.is_some())
            .finish()
    }
}

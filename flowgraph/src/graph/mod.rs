//! Workflow graph construction and execution.
//!
//! A [`WorkflowGraph`] owns a set of named nodes with declared
//! dependencies, runs each node's stage chain exactly once after all its
//! dependencies have settled, propagates failures to dependents, and fires
//! a single terminal [`Destination`] callback once every node has
//! completed, including nodes added while the graph was running.

mod node;
mod pipeline;

pub use pipeline::Pipeline;

use crate::errors::WorkflowError;
use crate::registry::GraphRegistry;
use crate::unit::WorkUnit;
use node::{NodeCell, NodeId};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use uuid::Uuid;

/// Name of the seed node every graph is created with.
pub const ORIGIN_NODE: &str = "@";

const ORIGIN_ID: NodeId = 0;

/// The terminal callback invoked exactly once when the whole graph settles.
pub trait Destination: Send + Sync {
    /// Finishes the workflow.
    ///
    /// `origin_error` is the origin node's error, if any; `node_errors`
    /// collects the root-cause errors of all other failed nodes
    /// (dependency-failure wrappers are filtered out). An `Err` returned
    /// from here is logged and never propagated to the graph's caller.
    fn finish(
        &self,
        origin_error: Option<&WorkflowError>,
        node_errors: &[WorkflowError],
        results: &ResultAccessor<'_>,
        context: &Value,
    ) -> anyhow::Result<()>;
}

impl<F> Destination for F
where
    F: Fn(Option<&WorkflowError>, &[WorkflowError], &ResultAccessor<'_>, &Value) -> anyhow::Result<()>
        + Send
        + Sync,
{
    fn finish(
        &self,
        origin_error: Option<&WorkflowError>,
        node_errors: &[WorkflowError],
        results: &ResultAccessor<'_>,
        context: &Value,
    ) -> anyhow::Result<()> {
        self(origin_error, node_errors, results, context)
    }
}

/// Pins a closure to the [`Destination`] signature.
///
/// Closure literals passed straight into [`WorkflowGraph::new`] often fail
/// lifetime inference against the blanket impl; routing them through this
/// identity helper gives the compiler the full higher-ranked signature.
pub fn destination_fn<F>(f: F) -> F
where
    F: Fn(Option<&WorkflowError>, &[WorkflowError], &ResultAccessor<'_>, &Value) -> anyhow::Result<()>
        + Send
        + Sync,
{
    f
}

/// Read access to node outcomes, handed to the destination callback.
pub struct ResultAccessor<'a> {
    graph: &'a GraphInner,
}

impl ResultAccessor<'_> {
    fn node(&self, name: &str) -> Arc<NodeCell> {
        let state = self.graph.state.lock();
        match state.names.get(name) {
            Some(&id) => Arc::clone(&state.nodes[id]),
            None => panic!("invalid node name {name}"),
        }
    }

    /// Returns true if the named node has completed.
    #[must_use]
    pub fn has_completed(&self, name: &str) -> bool {
        self.node(name).is_completed()
    }

    /// Returns the named node's result, or its stored error.
    ///
    /// # Panics
    ///
    /// Panics if the node does not exist or has not completed.
    pub fn get_result(&self, name: &str) -> Result<Value, WorkflowError> {
        let node = self.node(name);
        assert!(node.is_completed(), "node {name} has not completed");
        match node.error() {
            Some(error) => Err(error),
            None => Ok(node.result()),
        }
    }

    /// Returns the named node's error without constructing a result.
    ///
    /// Cheaper than [`get_result`](Self::get_result) when only the failure
    /// state matters.
    ///
    /// # Panics
    ///
    /// Panics if the node does not exist or has not completed.
    #[must_use]
    pub fn has_failed(&self, name: &str) -> Option<WorkflowError> {
        let node = self.node(name);
        assert!(node.is_completed(), "node {name} has not completed");
        node.error()
    }
}

/// Future resolved once the destination callback has returned.
#[derive(Debug)]
pub struct GraphCompletion {
    rx: oneshot::Receiver<()>,
}

impl Future for GraphCompletion {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // The sender is dropped only together with the graph, which also
        // means the graph can never complete; either way resolve.
        Pin::new(&mut self.rx).poll(cx).map(|_| ())
    }
}

/// How a node relates to its dependencies right now.
enum DependencyStatus {
    /// Every dependency completed without failure.
    Ready,
    /// Some dependency has not completed yet.
    Waiting,
    /// A dependency completed with a failure.
    Failed {
        dependency: String,
        error: WorkflowError,
    },
}

/// Node table and successor edge lists; everything here is guarded by the
/// graph-wide lock.
struct GraphState {
    names: HashMap<String, NodeId>,
    nodes: Vec<Arc<NodeCell>>,
    next: Vec<Vec<NodeId>>,
}

impl GraphState {
    fn dependency_status(&self, node: &NodeCell) -> DependencyStatus {
        for &id in &node.prev {
            let pred = &self.nodes[id];
            if !pred.is_completed() {
                return DependencyStatus::Waiting;
            }
            if let Some(error) = pred.error() {
                return DependencyStatus::Failed {
                    dependency: pred.name.clone(),
                    error,
                };
            }
        }
        DependencyStatus::Ready
    }

    fn all_completed(&self) -> bool {
        self.nodes.iter().all(|node| node.is_completed())
    }
}

/// Deadline and completion channel, both set exactly once by `start`.
struct Lifecycle {
    deadline: Option<Instant>,
    done_tx: Option<oneshot::Sender<()>>,
}

pub(crate) struct GraphInner {
    id: Uuid,
    state: Mutex<GraphState>,
    destination: Box<dyn Destination>,
    context: Value,
    completed: AtomicBool,
    lifecycle: Mutex<Lifecycle>,
    registry: Option<Arc<GraphRegistry>>,
}

impl GraphInner {
    fn new(
        origin: Arc<dyn WorkUnit>,
        destination: Box<dyn Destination>,
        context: Value,
        origin_param: Value,
        registry: Option<Arc<GraphRegistry>>,
    ) -> Arc<Self> {
        let origin_node = Arc::new(NodeCell::new(
            ORIGIN_ID,
            ORIGIN_NODE,
            Vec::new(),
            origin_param,
            std::slice::from_ref(&origin),
        ));
        let mut names = HashMap::new();
        names.insert(ORIGIN_NODE.to_string(), ORIGIN_ID);
        Arc::new(Self {
            id: Uuid::new_v4(),
            state: Mutex::new(GraphState {
                names,
                nodes: vec![origin_node],
                next: vec![Vec::new()],
            }),
            destination,
            context,
            completed: AtomicBool::new(false),
            lifecycle: Mutex::new(Lifecycle {
                deadline: None,
                done_tx: None,
            }),
            registry,
        })
    }

    pub(crate) fn id(&self) -> Uuid {
        self.id
    }

    pub(crate) fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.lifecycle.lock().deadline
    }

    pub(crate) fn context(&self) -> &Value {
        &self.context
    }

    fn start(self: &Arc<Self>, timeout: Duration) -> GraphCompletion {
        let rx = {
            let mut lifecycle = self.lifecycle.lock();
            assert!(
                lifecycle.deadline.is_none(),
                "the graph has already started"
            );
            lifecycle.deadline = Some(Instant::now() + timeout);
            let (tx, rx) = oneshot::channel();
            lifecycle.done_tx = Some(tx);
            rx
        };

        if let Some(registry) = &self.registry {
            registry.register(Arc::clone(self));
        }

        let origin = Arc::clone(&self.state.lock().nodes[ORIGIN_ID]);
        origin.start(self);

        GraphCompletion { rx }
    }

    pub(crate) fn contains_node(&self, name: &str) -> bool {
        self.state.lock().names.contains_key(name)
    }

    /// Adds a node while the graph runs.
    ///
    /// The spawning node is always a predecessor of the new node, in
    /// addition to the named dependencies. Called from a running stage, so
    /// the spawning node cannot have completed yet, which is what makes the
    /// terminal "all nodes completed" check safe against dynamic additions.
    pub(crate) fn pipe_node(
        self: &Arc<Self>,
        name: &str,
        from: &Arc<NodeCell>,
        dependencies: &[&str],
        param: Value,
        batch: &[Arc<dyn WorkUnit>],
    ) {
        let (node, status) = {
            let mut state = self.state.lock();
            assert!(
                !state.names.contains_key(name),
                "node {name} is already defined"
            );
            let mut prev = Vec::with_capacity(dependencies.len() + 1);
            prev.push(from.id);
            for dep in dependencies {
                match state.names.get(*dep) {
                    Some(&id) => prev.push(id),
                    None => panic!("invalid dependency name {dep}"),
                }
            }

            let id = state.nodes.len();
            let node = Arc::new(NodeCell::new(id, name, prev.clone(), param, batch));
            state.names.insert(name.to_string(), id);
            state.nodes.push(Arc::clone(&node));
            state.next.push(Vec::new());
            for &pred in &prev {
                state.next[pred].push(id);
            }

            let status = state.dependency_status(&node);
            (node, status)
        };

        match status {
            DependencyStatus::Ready => node.start(self),
            DependencyStatus::Failed { dependency, error } => {
                node.dependency_fail(self, &dependency, error);
            }
            DependencyStatus::Waiting => {}
        }
    }

    /// Reacts to a node settling: propagate, schedule, and finish.
    ///
    /// All decisions are collected under the graph lock and applied after
    /// releasing it, so the recursive completion of dependency-failed
    /// successors re-acquires the lock one level at a time.
    pub(crate) fn on_node_complete(self: &Arc<Self>, node: &Arc<NodeCell>) {
        let mut to_start: Vec<Arc<NodeCell>> = Vec::new();
        let mut to_fail: Vec<(Arc<NodeCell>, String, WorkflowError)> = Vec::new();
        let all_settled;
        {
            let state = self.state.lock();
            match node.error() {
                None => {
                    for &id in &state.next[node.id] {
                        let successor = &state.nodes[id];
                        if successor.is_started() || successor.is_completed() {
                            continue;
                        }
                        match state.dependency_status(successor) {
                            DependencyStatus::Ready => to_start.push(Arc::clone(successor)),
                            DependencyStatus::Failed { dependency, error } => {
                                to_fail.push((Arc::clone(successor), dependency, error));
                            }
                            DependencyStatus::Waiting => {}
                        }
                    }
                }
                Some(error) => {
                    for &id in &state.next[node.id] {
                        to_fail.push((Arc::clone(&state.nodes[id]), node.name.clone(), error.clone()));
                    }
                }
            }
            all_settled = state.all_completed();
        }

        for (successor, dependency, error) in to_fail {
            successor.dependency_fail(self, &dependency, error);
        }

        // only the first thread to observe full completion runs the destination
        if all_settled && !self.completed.swap(true, Ordering::SeqCst) {
            self.execute_destination();
        }

        for successor in to_start {
            successor.start(self);
        }
    }

    /// Runs the destination callback; the caller guarantees exactly once.
    fn execute_destination(self: &Arc<Self>) {
        let (origin_error, node_errors) = {
            let state = self.state.lock();
            let origin_error = state.nodes[ORIGIN_ID].error();
            let mut node_errors = Vec::new();
            // every node has settled, so outcomes cannot change anymore
            for node in state.nodes.iter().skip(1) {
                if let Some(error) = node.error() {
                    if error.is_dependency_failure() {
                        continue; // root causes only
                    }
                    node_errors.push(error);
                }
            }
            (origin_error, node_errors)
        };

        let accessor = ResultAccessor { graph: self };
        if let Err(error) =
            self.destination
                .finish(origin_error.as_ref(), &node_errors, &accessor, &self.context)
        {
            tracing::error!(graph = %self.id, error = %error, "failed to finish workflow");
        }

        self.finish();
    }

    fn finish(&self) {
        let sender = self.lifecycle.lock().done_tx.take();
        if let Some(tx) = sender {
            let _ = tx.send(());
        }
        if let Some(registry) = &self.registry {
            registry.deregister(self.id);
        }
    }

    /// Force-fails every started-but-unfinished node of an expired graph.
    ///
    /// Covers completion signals that were lost or never arrive. If the
    /// graph is incomplete yet no such node exists, the scheduler's own
    /// bookkeeping is broken; that is logged and retried next sweep.
    pub(crate) fn perform_timeout_check(self: &Arc<Self>, now: Instant) {
        if self.is_completed() {
            return;
        }
        let Some(deadline) = self.deadline() else {
            return;
        };

        let to_fail: Vec<Arc<NodeCell>> = {
            let state = self.state.lock();
            state
                .nodes
                .iter()
                .filter(|node| node.is_started() && !node.is_completed())
                .map(Arc::clone)
                .collect()
        };

        if to_fail.is_empty() {
            tracing::error!(
                graph = %self.id,
                "graph is incomplete but all started nodes have completed; workflow bookkeeping is inconsistent"
            );
            return;
        }

        let overdue_ms = now.saturating_duration_since(deadline).as_millis();
        let error = WorkflowError::Timeout { overdue_ms };
        for node in to_fail {
            node.force_fail(self, error.clone());
        }
    }
}

/// A workflow graph: the embeddable execution engine's entry point.
///
/// Build one with an origin work unit and a destination callback, then call
/// [`start`](Self::start). The call returns immediately; completion is
/// observed through the returned future or through the destination.
pub struct WorkflowGraph {
    inner: Arc<GraphInner>,
}

impl WorkflowGraph {
    /// Creates a graph with default context and origin param.
    pub fn new(origin: Arc<dyn WorkUnit>, destination: impl Destination + 'static) -> Self {
        Self::builder(origin, destination).build()
    }

    /// Starts configuring a graph.
    pub fn builder(
        origin: Arc<dyn WorkUnit>,
        destination: impl Destination + 'static,
    ) -> GraphBuilder {
        GraphBuilder {
            origin,
            destination: Box::new(destination),
            context: Value::Null,
            origin_param: Value::Null,
            registry: None,
        }
    }

    /// Unique identity of this graph in the live-graph registry.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.inner.id()
    }

    /// Starts the origin node and begins executing the graph.
    ///
    /// Never blocks: the returned future resolves after the destination
    /// callback has run. `timeout` sets the wall-clock deadline after which
    /// the sweeper force-fails whatever is still running.
    ///
    /// # Panics
    ///
    /// Panics if called twice.
    pub fn start(&self, timeout: Duration) -> GraphCompletion {
        self.inner.start(timeout)
    }

    /// Returns true once every node has completed and the destination ran.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.inner.is_completed()
    }
}

impl std::fmt::Debug for WorkflowGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowGraph")
            .field("id", &self.inner.id())
            .field("completed", &self.is_completed())
            .finish()
    }
}

/// Builder for [`WorkflowGraph`].
pub struct GraphBuilder {
    origin: Arc<dyn WorkUnit>,
    destination: Box<dyn Destination>,
    context: Value,
    origin_param: Value,
    registry: Option<Arc<GraphRegistry>>,
}

impl GraphBuilder {
    /// Opaque context value handed to every stage and to the destination.
    #[must_use]
    pub fn context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    /// Param passed to the origin node's work units.
    #[must_use]
    pub fn origin_param(mut self, param: Value) -> Self {
        self.origin_param = param;
        self
    }

    /// Registry the graph registers with on `start`, for timeout sweeping.
    #[must_use]
    pub fn registry(mut self, registry: Arc<GraphRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Builds the graph with its origin node in place.
    #[must_use]
    pub fn build(self) -> WorkflowGraph {
        WorkflowGraph {
            inner: GraphInner::new(
                self.origin,
                self.destination,
                self.context,
                self.origin_param,
                self.registry,
            ),
        }
    }
}

//! The handle a running work unit uses to talk to its graph.

use crate::graph::node::{NodeCell, StageId};
use crate::graph::GraphInner;
use crate::signal::Outcome;
use crate::unit::WorkUnit;
use crate::WorkflowError;
use serde_json::Value;
use std::sync::Arc;

/// Per-stage view of the running graph, passed to every
/// [`WorkUnit::start`](crate::WorkUnit::start).
///
/// Through it a unit reads its param and the graph context, inspects the
/// previous stage in its batch, stores data for the next stage, and extends
/// the graph with new nodes or sub-batches while running.
pub struct Pipeline {
    graph: Arc<GraphInner>,
    node: Arc<NodeCell>,
    stage: StageId,
}

impl Pipeline {
    pub(crate) fn new(graph: Arc<GraphInner>, node: Arc<NodeCell>, stage: StageId) -> Self {
        Self { graph, node, stage }
    }

    /// The opaque context value the graph was built with.
    #[must_use]
    pub fn context(&self) -> &Value {
        self.graph.context()
    }

    /// The param passed to this stage.
    #[must_use]
    pub fn param(&self) -> Value {
        self.node.stage_param(self.stage)
    }

    /// Checks whether a node of the given name exists.
    #[must_use]
    pub fn contains_node(&self, name: &str) -> bool {
        self.graph.contains_node(name)
    }

    /// Stores a value on the current stage, readable by the next stage in
    /// the batch via [`previous_data`](Self::previous_data).
    pub fn set_data(&self, data: Value) {
        self.node.set_stage_data(self.stage, data);
    }

    /// Adds a new node to the graph.
    ///
    /// The new node depends on the current node plus every node named in
    /// `dependencies`, and starts once all of them have completed without
    /// failure. If a dependency has already failed, the new node settles
    /// immediately with a dependency failure.
    ///
    /// # Panics
    ///
    /// Panics if the name is already taken, a dependency name is unknown,
    /// or `batch` is empty.
    pub fn add_node(
        &self,
        name: &str,
        dependencies: &[&str],
        param: Value,
        batch: Vec<Arc<dyn WorkUnit>>,
    ) {
        self.graph
            .pipe_node(name, &self.node, dependencies, param, &batch);
    }

    /// Adds a node that depends only on the current node.
    pub fn add_child_node(&self, name: &str, param: Value, batch: Vec<Arc<dyn WorkUnit>>) {
        self.add_node(name, &[], param, batch);
    }

    /// Adds a node that depends on the current node and one named node.
    pub fn add_node_after(
        &self,
        name: &str,
        dependency: &str,
        param: Value,
        batch: Vec<Arc<dyn WorkUnit>>,
    ) {
        self.add_node(name, &[dependency], param, batch);
    }

    /// Appends a sub-batch under the current stage.
    ///
    /// The sub-batch starts immediately; the node's chain does not advance
    /// past the current stage until the sub-batch (and any it spawns in
    /// turn) has settled.
    ///
    /// # Panics
    ///
    /// Panics if the current stage and all its children have already
    /// finished, or if `batch` is empty.
    pub fn add_stage(&self, param: Value, batch: Vec<Arc<dyn WorkUnit>>) {
        self.node.add_stage(&self.graph, self.stage, param, &batch);
    }

    /// Result or error of the previous stage in this batch.
    ///
    /// # Panics
    ///
    /// Panics if this stage has no batch predecessor.
    pub fn previous_value(&self) -> Outcome {
        self.node.previous_value(self.stage)
    }

    /// The failure of the previous stage in this batch, if any, unwrapped
    /// to its root cause.
    ///
    /// # Panics
    ///
    /// Panics if this stage has no batch predecessor.
    #[must_use]
    pub fn previous_failed(&self) -> Option<WorkflowError> {
        self.node.previous_failed(self.stage)
    }

    /// Data stored by the previous stage via [`set_data`](Self::set_data).
    ///
    /// # Panics
    ///
    /// Panics if this stage has no batch predecessor.
    #[must_use]
    pub fn previous_data(&self) -> Value {
        self.node.previous_data(self.stage)
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("node", &self.node.name)
            .field("stage", &self.stage)
            .finish()
    }
}

//! Graph nodes and their stage chains.
//!
//! A node runs an ordered batch of work units, one stage per unit. A
//! running stage may spawn nested sub-batches; the chain only advances past
//! a stage once the stage itself and every sub-batch it spawned (recursively)
//! have settled. Stages are addressed by index into a per-node arena, so the
//! parent/prev/next/child links are plain `Option<usize>` rather than shared
//! references.

use crate::errors::WorkflowError;
use crate::graph::{GraphInner, Pipeline};
use crate::signal::Outcome;
use crate::unit::WorkUnit;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub(crate) type NodeId = usize;
pub(crate) type StageId = usize;

/// The head of a node's top-level batch is always the first slot created.
const HEAD_STAGE: StageId = 0;

/// One stage in a node's chain: a work unit plus its links and settled state.
#[derive(Debug)]
pub(crate) struct StageSlot {
    unit: Arc<dyn WorkUnit>,
    param: Value,
    started: bool,
    completed: bool,
    /// True once every spawned sub-batch (recursively) has settled.
    children_completed: bool,
    /// The stage whose sub-batch this slot belongs to, if any.
    parent: Option<StageId>,
    prev: Option<StageId>,
    next: Option<StageId>,
    /// Head of the most recently spawned sub-batch.
    child: Option<StageId>,
    /// Next older sub-batch head in the spawning stage's child list.
    sibling: Option<StageId>,
    result: Value,
    error: Option<WorkflowError>,
    data: Value,
}

impl StageSlot {
    fn new(
        unit: Arc<dyn WorkUnit>,
        param: Value,
        parent: Option<StageId>,
        prev: Option<StageId>,
    ) -> Self {
        Self {
            unit,
            param,
            started: false,
            completed: false,
            children_completed: false,
            parent,
            prev,
            next: None,
            child: None,
            sibling: None,
            result: Value::Null,
            error: None,
            data: Value::Null,
        }
    }
}

/// Arena of all stages ever created for one node.
#[derive(Debug, Default)]
pub(crate) struct StageArena {
    slots: Vec<StageSlot>,
}

impl StageArena {
    /// Appends a linked batch of stages and returns the head's id.
    ///
    /// # Panics
    ///
    /// Panics if `batch` is empty.
    fn push_batch(
        &mut self,
        batch: &[Arc<dyn WorkUnit>],
        param: &Value,
        parent: Option<StageId>,
    ) -> StageId {
        assert!(!batch.is_empty(), "batch must contain at least one work unit");
        let head = self.slots.len();
        let mut prev: Option<StageId> = None;
        for unit in batch {
            let id = self.slots.len();
            self.slots
                .push(StageSlot::new(Arc::clone(unit), param.clone(), parent, prev));
            if let Some(p) = prev {
                self.slots[p].next = Some(id);
            }
            prev = Some(id);
        }
        head
    }
}

/// Recomputes `children_completed` for `sid`, recursing into sub-batches.
///
/// While scanning, the error of the last stage of a settled sub-batch is
/// promoted onto `sid` if `sid` has no error of its own. Sub-batches are
/// linked newest-first, so when several sub-batches failed only the most
/// recently spawned one's error is kept.
fn update_children_completed(slots: &mut [StageSlot], sid: StageId) {
    let mut all_completed = true;
    let mut batch = slots[sid].child;
    while let Some(head) = batch {
        let mut batch_error: Option<WorkflowError> = None;
        let mut stage = Some(head);
        while let Some(q) = stage {
            if slots[q].completed {
                if !slots[q].children_completed {
                    update_children_completed(slots, q);
                    if !slots[q].children_completed {
                        all_completed = false;
                        break;
                    }
                }
                if slots[q].next.is_none() {
                    batch_error = slots[q].error.clone();
                }
            } else {
                all_completed = false;
                break;
            }
            stage = slots[q].next;
        }
        if slots[sid].error.is_none() {
            if let Some(error) = batch_error {
                slots[sid].error = Some(error);
            }
        }
        batch = slots[head].sibling;
    }
    if all_completed {
        slots[sid].children_completed = true;
    }
}

/// One vertex of the dependency graph.
///
/// Predecessor edges are fixed at creation; successor edges live in the
/// graph-wide table under the graph lock. The `started`/`completed` flags
/// are one-shot transitions, and the recorded outcome never changes after
/// the first completion.
#[derive(Debug)]
pub(crate) struct NodeCell {
    pub(crate) id: NodeId,
    pub(crate) name: String,
    /// Dependencies of this node; immutable after creation.
    pub(crate) prev: Vec<NodeId>,
    started: AtomicBool,
    completed: AtomicBool,
    outcome: Mutex<Option<(Value, Option<WorkflowError>)>>,
    stages: Mutex<StageArena>,
}

impl NodeCell {
    pub(crate) fn new(
        id: NodeId,
        name: impl Into<String>,
        prev: Vec<NodeId>,
        param: Value,
        batch: &[Arc<dyn WorkUnit>],
    ) -> Self {
        let mut arena = StageArena::default();
        arena.push_batch(batch, &param, None);
        Self {
            id,
            name: name.into(),
            prev,
            started: AtomicBool::new(false),
            completed: AtomicBool::new(false),
            outcome: Mutex::new(None),
            stages: Mutex::new(arena),
        }
    }

    pub(crate) fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// A node can be completed without ever having started (dependency
    /// failure, timeout).
    pub(crate) fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    pub(crate) fn error(&self) -> Option<WorkflowError> {
        self.outcome.lock().as_ref().and_then(|(_, error)| error.clone())
    }

    pub(crate) fn result(&self) -> Value {
        self.outcome
            .lock()
            .as_ref()
            .map_or(Value::Null, |(result, _)| result.clone())
    }

    /// Starts the node's stage chain; only the first call has any effect.
    pub(crate) fn start(self: &Arc<Self>, graph: &Arc<GraphInner>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.start_stage(graph, HEAD_STAGE);
    }

    /// Fails the node outright, e.g. on graph timeout.
    pub(crate) fn force_fail(self: &Arc<Self>, graph: &Arc<GraphInner>, error: WorkflowError) {
        self.complete(graph, Value::Null, Some(error));
    }

    /// Fails the node because the named dependency failed.
    pub(crate) fn dependency_fail(
        self: &Arc<Self>,
        graph: &Arc<GraphInner>,
        dependency: &str,
        error: WorkflowError,
    ) {
        self.force_fail(graph, WorkflowError::wrap_dependency(dependency, error));
    }

    /// Records the node's outcome and notifies the graph.
    ///
    /// Only the first completion takes effect; late completions (a real
    /// signal arriving after a timeout sweep, a racing force-fail) are
    /// ignored and the recorded outcome never changes.
    pub(crate) fn complete(
        self: &Arc<Self>,
        graph: &Arc<GraphInner>,
        result: Value,
        error: Option<WorkflowError>,
    ) {
        {
            let mut outcome = self.outcome.lock();
            if self.completed.swap(true, Ordering::SeqCst) {
                return;
            }
            self.started.store(true, Ordering::SeqCst);
            *outcome = Some((result, error));
        }
        graph.on_node_complete(self);
    }

    fn start_stage(self: &Arc<Self>, graph: &Arc<GraphInner>, sid: StageId) {
        {
            let mut stages = self.stages.lock();
            if stages.slots[sid].started {
                return;
            }
            stages.slots[sid].started = true;
        }

        // A force-completed node (timeout) must not start further stages.
        if self.is_completed() {
            return;
        }

        let (unit, prev_error) = {
            let stages = self.stages.lock();
            let slot = &stages.slots[sid];
            let prev_error = slot.prev.and_then(|p| stages.slots[p].error.clone());
            (Arc::clone(&slot.unit), prev_error)
        };

        // A failure earlier in this batch short-circuits the stage unless
        // the unit opted in to run anyway.
        if let Some(error) = prev_error {
            if !unit.accept_previous_failure() {
                let propagated = if error.is_dependency_failure() || unit.inherit_previous_failure()
                {
                    error
                } else {
                    WorkflowError::wrap_stage_failure(error)
                };
                self.stage_completed(graph, sid, Err(propagated));
                return;
            }
        }

        let pipeline = Pipeline::new(Arc::clone(graph), Arc::clone(self), sid);
        match unit.start(&pipeline) {
            Err(error) => self.stage_completed(graph, sid, Err(error)),
            Ok(None) => self.stage_completed(graph, sid, Ok(Value::Null)),
            Ok(Some(signal)) => {
                let graph = Arc::clone(graph);
                let node = Arc::clone(self);
                signal.set_callback(Box::new(move |outcome| {
                    node.stage_completed(&graph, sid, outcome);
                }));
            }
        }
    }

    /// Settles a stage and walks the chain upward to find what runs next.
    ///
    /// Walking up through enclosing stages: a stage whose sub-batches are
    /// still running stops the walk (the last sub-batch to settle resumes
    /// it); a stage with a batch successor hands over to that successor; the
    /// top of the chain completes the node with its own outcome.
    pub(crate) fn stage_completed(
        self: &Arc<Self>,
        graph: &Arc<GraphInner>,
        sid: StageId,
        outcome: Outcome,
    ) {
        if let Err(error) = &outcome {
            tracing::debug!(node = %self.name, error = %error, "stage failed");
        }

        let mut next_stage = None;
        let mut node_outcome = None;
        {
            let mut stages = self.stages.lock();
            let slots = &mut stages.slots;
            assert!(!slots[sid].completed, "stage has already completed");
            slots[sid].completed = true;
            match outcome {
                Ok(value) => slots[sid].result = value,
                Err(error) => slots[sid].error = Some(error),
            }

            let mut p = sid;
            loop {
                if slots[p].completed && !slots[p].children_completed {
                    update_children_completed(slots, p);
                }
                if !slots[p].children_completed {
                    // an unfinished sub-batch picks the walk back up later
                    return;
                }
                if let Some(next) = slots[p].next {
                    next_stage = Some(next);
                    break;
                }
                match slots[p].parent {
                    Some(parent) => p = parent,
                    None => {
                        node_outcome = Some((slots[p].result.clone(), slots[p].error.clone()));
                        break;
                    }
                }
            }
        }

        if let Some(next) = next_stage {
            self.start_stage(graph, next);
        } else if let Some((result, error)) = node_outcome {
            // new stages can only be added while some stage is unfinished,
            // so nothing can appear behind the top of the chain now
            self.complete(graph, result, error);
        }
    }

    /// Spawns a sub-batch under the running stage `from` and starts it.
    ///
    /// # Panics
    ///
    /// Panics if the spawning stage and all of its children have already
    /// finished, or if `batch` is empty.
    pub(crate) fn add_stage(
        self: &Arc<Self>,
        graph: &Arc<GraphInner>,
        from: StageId,
        param: Value,
        batch: &[Arc<dyn WorkUnit>],
    ) {
        let head = {
            let mut stages = self.stages.lock();
            assert!(
                !(stages.slots[from].completed && stages.slots[from].children_completed),
                "current stage has completed"
            );
            let head = stages.push_batch(batch, &param, Some(from));
            stages.slots[head].sibling = stages.slots[from].child;
            stages.slots[from].child = Some(head);
            head
        };
        // start the new batch as soon as possible
        self.start_stage(graph, head);
    }

    pub(crate) fn stage_param(&self, sid: StageId) -> Value {
        self.stages.lock().slots[sid].param.clone()
    }

    pub(crate) fn set_stage_data(&self, sid: StageId, data: Value) {
        self.stages.lock().slots[sid].data = data;
    }

    fn previous_of(&self, sid: StageId) -> StageId {
        let stages = self.stages.lock();
        match stages.slots[sid].prev {
            Some(prev) => prev,
            None => panic!("no previous stage in this batch"),
        }
    }

    pub(crate) fn previous_value(&self, sid: StageId) -> Outcome {
        let prev = self.previous_of(sid);
        let stages = self.stages.lock();
        match &stages.slots[prev].error {
            Some(error) => Err(error.clone()),
            None => Ok(stages.slots[prev].result.clone()),
        }
    }

    pub(crate) fn previous_failed(&self, sid: StageId) -> Option<WorkflowError> {
        let prev = self.previous_of(sid);
        let stages = self.stages.lock();
        stages.slots[prev].error.as_ref().map(|e| e.cause().clone())
    }

    pub(crate) fn previous_data(&self, sid: StageId) -> Value {
        let prev = self.previous_of(sid);
        self.stages.lock().slots[prev].data.clone()
    }
}

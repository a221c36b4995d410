//! The work unit contract.
//!
//! A [`WorkUnit`] is one piece of work scheduled by the graph. Its `start`
//! method must not block: long-running work hands back a deferred
//! [`Signal`] and completes it later from whatever thread the work resolves
//! on. Only one thread at a time runs a given unit's `start`.

use crate::errors::WorkflowError;
use crate::graph::Pipeline;
use crate::signal::Signal;
use std::fmt::Debug;

/// The immediate result of starting a work unit.
///
/// `Ok(None)` means the unit already finished and has no result to report.
pub type UnitStart = Result<Option<Signal>, WorkflowError>;

/// One piece of work executed by a graph node.
pub trait WorkUnit: Send + Sync + Debug {
    /// Starts the work.
    ///
    /// The `pipeline` handle gives access to the graph: the stage's param
    /// and data, the outcome of the previous stage in the batch, and the
    /// ability to add nodes and stages while running.
    fn start(&self, pipeline: &Pipeline) -> UnitStart;

    /// Whether this unit runs even if the previous stage in its batch
    /// failed. The failure is then observable via
    /// [`Pipeline::previous_failed`].
    fn accept_previous_failure(&self) -> bool {
        false
    }

    /// Whether, when refusing to run after a previous-stage failure, this
    /// unit propagates the original error unchanged instead of wrapping it
    /// as a dependency failure.
    fn inherit_previous_failure(&self) -> bool {
        false
    }
}

/// A closure-based work unit.
pub struct FnUnit<F>
where
    F: Fn(&Pipeline) -> UnitStart + Send + Sync,
{
    func: F,
    accept_previous_failure: bool,
    inherit_previous_failure: bool,
}

impl<F> FnUnit<F>
where
    F: Fn(&Pipeline) -> UnitStart + Send + Sync,
{
    /// Creates a new closure-based work unit.
    pub fn new(func: F) -> Self {
        Self {
            func,
            accept_previous_failure: false,
            inherit_previous_failure: false,
        }
    }

    /// Makes the unit run even after a previous-stage failure.
    #[must_use]
    pub fn with_accept_previous_failure(mut self, accept: bool) -> Self {
        self.accept_previous_failure = accept;
        self
    }

    /// Makes the unit pass a previous-stage failure through unwrapped.
    #[must_use]
    pub fn with_inherit_previous_failure(mut self, inherit: bool) -> Self {
        self.inherit_previous_failure = inherit;
        self
    }
}

impl<F> Debug for FnUnit<F>
where
    F: Fn(&Pipeline) -> UnitStart + Send + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnUnit")
            .field("accept_previous_failure", &self.accept_previous_failure)
            .field("inherit_previous_failure", &self.inherit_previous_failure)
            .finish()
    }
}

impl<F> WorkUnit for FnUnit<F>
where
    F: Fn(&Pipeline) -> UnitStart + Send + Sync,
{
    fn start(&self, pipeline: &Pipeline) -> UnitStart {
        (self.func)(pipeline)
    }

    fn accept_previous_failure(&self) -> bool {
        self.accept_previous_failure
    }

    fn inherit_previous_failure(&self) -> bool {
        self.inherit_previous_failure
    }
}

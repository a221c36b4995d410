//! Error types for the flowgraph engine.
//!
//! The engine distinguishes three runtime error classes: errors raised by a
//! work unit itself, synthetic dependency-failure wrappers used purely for
//! propagation bookkeeping, and timeout errors injected by the sweeper.
//! API misuse (duplicate node names, unknown dependencies, double callback
//! registration and the like) is not represented here; those are panics at
//! the offending call site.

use std::sync::Arc;
use thiserror::Error;

/// An error carried through the workflow graph.
///
/// The engine fans a single failure out to every dependent node, so this
/// type is cheaply cloneable; the underlying error value is shared.
#[derive(Debug, Clone, Error)]
pub enum WorkflowError {
    /// An error raised directly by a work unit, stored verbatim on its
    /// stage and node.
    #[error("{0}")]
    Unit(Arc<anyhow::Error>),

    /// A predecessor node or stage failed, so this one never ran.
    ///
    /// `dependency` names the failed predecessor node, or is `None` when a
    /// stage inherited the failure of its batch predecessor. Wrappers are
    /// filtered out of the destination's failure list so that only root
    /// causes are reported.
    #[error("dependency {} failed: {cause}", dependency.as_deref().unwrap_or("<stage>"))]
    Dependency {
        /// Name of the failed predecessor node, if this wrapper was created
        /// by node-level propagation.
        dependency: Option<String>,
        /// The predecessor's own error.
        cause: Arc<WorkflowError>,
    },

    /// The graph exceeded its deadline while this node was still running.
    #[error("graph has timed out {overdue_ms}ms")]
    Timeout {
        /// How far past the deadline the sweep ran.
        overdue_ms: u128,
    },
}

impl WorkflowError {
    /// Wraps an arbitrary error raised by a work unit.
    pub fn unit(err: impl Into<anyhow::Error>) -> Self {
        Self::Unit(Arc::new(err.into()))
    }

    /// Creates a work-unit error from a plain message.
    pub fn message(msg: impl Into<String>) -> Self {
        Self::Unit(Arc::new(anyhow::anyhow!(msg.into())))
    }

    /// Wraps `cause` as a dependency failure of the named predecessor,
    /// unless it already is one.
    #[must_use]
    pub fn wrap_dependency(dependency: impl Into<String>, cause: Self) -> Self {
        if cause.is_dependency_failure() {
            cause
        } else {
            Self::Dependency {
                dependency: Some(dependency.into()),
                cause: Arc::new(cause),
            }
        }
    }

    /// Wraps `cause` as an anonymous dependency failure (a stage refusing
    /// to run after its batch predecessor failed).
    #[must_use]
    pub fn wrap_stage_failure(cause: Self) -> Self {
        Self::Dependency {
            dependency: None,
            cause: Arc::new(cause),
        }
    }

    /// Returns true if this error is a propagation wrapper rather than a
    /// root cause.
    #[must_use]
    pub fn is_dependency_failure(&self) -> bool {
        matches!(self, Self::Dependency { .. })
    }

    /// Returns the wrapped predecessor error for a dependency failure, or
    /// the error itself otherwise.
    #[must_use]
    pub fn cause(&self) -> &Self {
        match self {
            Self::Dependency { cause, .. } => cause,
            other => other,
        }
    }
}

impl From<anyhow::Error> for WorkflowError {
    fn from(err: anyhow::Error) -> Self {
        Self::Unit(Arc::new(err))
    }
}

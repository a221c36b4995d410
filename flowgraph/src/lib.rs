//! # Flowgraph
//!
//! An embeddable workflow execution engine: named units of work ("nodes")
//! with declared dependencies, executed exactly once each, after all their
//! dependencies have settled, without ever blocking the caller's thread.
//!
//! - **Dynamic graphs**: a running work unit may add new nodes (with
//!   dependencies on existing ones) or append stages to its own node; the
//!   terminal destination still fires exactly once, after everything.
//! - **Recursive sub-batches**: a stage may spawn nested batches that must
//!   all settle before its node's chain advances.
//! - **Failure propagation**: a failed node fails its dependents through
//!   dependency-failure wrappers; only root causes reach the destination.
//! - **Timeout recovery**: a background sweeper force-fails graphs whose
//!   deadline passed while completion signals were still outstanding.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use flowgraph::prelude::*;
//!
//! let graph = WorkflowGraph::new(
//!     Arc::new(FnUnit::new(|pipeline| {
//!         pipeline.add_node("fetch", &[], json!("urls"), vec![fetch_unit()]);
//!         Ok(Some(Signal::ready(json!(42))))
//!     })),
//!     |origin_error, errors, results, _context| {
//!         println!("origin: {:?}", results.get_result("@"));
//!         Ok(())
//!     },
//! );
//!
//! let completion = graph.start(Duration::from_secs(30));
//! completion.await;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod errors;
pub mod graph;
pub mod registry;
pub mod signal;
pub mod unit;

#[cfg(test)]
mod integration_tests;

pub use errors::WorkflowError;
pub use graph::{
    destination_fn, Destination, GraphBuilder, GraphCompletion, Pipeline, ResultAccessor,
    WorkflowGraph, ORIGIN_NODE,
};
pub use registry::{GraphRegistry, TimeoutSweeper, DEFAULT_SWEEP_PERIOD};
pub use signal::{AsyncSignal, Callback, Outcome, Signal};
pub use unit::{FnUnit, UnitStart, WorkUnit};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::errors::WorkflowError;
    pub use crate::graph::{
        destination_fn, Destination, GraphBuilder, GraphCompletion, Pipeline, ResultAccessor,
        WorkflowGraph, ORIGIN_NODE,
    };
    pub use crate::registry::{GraphRegistry, TimeoutSweeper, DEFAULT_SWEEP_PERIOD};
    pub use crate::signal::{AsyncSignal, Callback, Outcome, Signal};
    pub use crate::unit::{FnUnit, UnitStart, WorkUnit};
}

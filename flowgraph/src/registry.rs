//! Live-graph registry and the timeout sweeper.
//!
//! Every started graph registers itself here and deregisters when its
//! destination has run. The sweeper periodically force-fails graphs that
//! are past their deadline but still have started-yet-unfinished nodes
//! (covering completion signals that never arrive), and reclaims finished
//! graphs left behind.

use crate::graph::GraphInner;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// How often the sweeper checks the registry unless configured otherwise.
pub const DEFAULT_SWEEP_PERIOD: Duration = Duration::from_secs(30 * 60);

/// Concurrent set of all live (started, not yet finished) graphs.
#[derive(Default)]
pub struct GraphRegistry {
    graphs: DashMap<Uuid, Arc<GraphInner>>,
}

impl GraphRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, graph: Arc<GraphInner>) {
        self.graphs.insert(graph.id(), graph);
    }

    pub(crate) fn deregister(&self, id: Uuid) {
        self.graphs.remove(&id);
    }

    /// Number of live graphs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.graphs.len()
    }

    /// Returns true if no graph is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.graphs.is_empty()
    }

    /// Runs one sweep cycle at time `now`.
    ///
    /// Expired graphs are snapshotted first: the timeout check completes
    /// graphs, and a completing graph deregisters itself, which must not
    /// happen inside an iteration over the map.
    pub fn sweep(&self, now: Instant) {
        if self.graphs.is_empty() {
            return;
        }
        tracing::debug!(live = self.graphs.len(), "checking live workflow graphs");

        let expired: Vec<Arc<GraphInner>> = self
            .graphs
            .iter()
            .filter(|entry| entry.deadline().is_some_and(|deadline| now > deadline))
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut reclaimed = 0usize;
        for graph in expired {
            let was_completed = graph.is_completed();
            graph.perform_timeout_check(now);
            if graph.is_completed() {
                // an incomplete graph stays registered; next cycle retries it
                self.graphs.remove(&graph.id());
                if !was_completed {
                    reclaimed += 1;
                }
            }
        }

        if reclaimed > 0 {
            tracing::info!(count = reclaimed, "reclaimed timed out workflow graphs");
        }
    }
}

impl std::fmt::Debug for GraphRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphRegistry")
            .field("live", &self.graphs.len())
            .finish()
    }
}

/// Background task that sweeps a [`GraphRegistry`] on a fixed period.
///
/// Explicit lifecycle: nothing runs until [`start`](Self::start), and
/// dropping the sweeper stops it.
#[derive(Debug)]
pub struct TimeoutSweeper {
    registry: Arc<GraphRegistry>,
    period: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TimeoutSweeper {
    /// Creates a sweeper over `registry` ticking every `period`.
    #[must_use]
    pub fn new(registry: Arc<GraphRegistry>, period: Duration) -> Self {
        Self {
            registry,
            period,
            task: Mutex::new(None),
        }
    }

    /// Spawns the periodic sweep task on the ambient tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if the sweeper is already running.
    pub fn start(&self) {
        let mut task = self.task.lock();
        assert!(task.is_none(), "sweeper is already running");

        let registry = Arc::clone(&self.registry);
        let period = self.period;
        *task = Some(tokio::spawn(async move {
            let first = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(first, period);
            loop {
                ticker.tick().await;
                registry.sweep(Instant::now());
            }
        }));
    }

    /// Stops the sweep task. Graphs already being swept finish their sweep.
    pub fn shutdown(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for TimeoutSweeper {
    fn drop(&mut self) {
        self.shutdown();
    }
}

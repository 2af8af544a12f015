//! Persistence workers and their process-wide registry.
//!
//! A worker owns the in-memory cache for one stream and knows how to turn a
//! drained cache into a batch of prepared driver requests. The persistence
//! timer discovers workers through the [`WorkerRegistry`] snapshot at the
//! start of each tick.

mod metrics;
mod topn;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

pub use metrics::MetricsPersistentWorker;
pub use topn::TopNWorker;

use crate::storage::PrepareRequest;

/// Stream families that own persistent workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Metrics,
    TopN,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Metrics => write!(f, "metrics"),
            StreamKind::TopN => write!(f, "top-n"),
        }
    }
}

/// Contract every persistence worker fulfils once per tick.
///
/// The scheduler guarantees `build_batch_requests` runs before
/// `end_of_round` for the same tick and never runs two builds of the same
/// worker concurrently. Builds across distinct workers do run in parallel.
/// Implementations must not block on I/O in either method.
pub trait PersistenceWorker: Send + Sync {
    /// Stable name used in logs and diagnostics.
    fn name(&self) -> &str;

    /// Drain the worker cache and convert it into driver requests.
    /// May return an empty list.
    fn build_batch_requests(&self) -> Vec<PrepareRequest>;

    /// End-of-tick housekeeping: purge auxiliary state whose freshness
    /// window has elapsed. Runs after the build, before the flush is
    /// awaited.
    fn end_of_round(&self);
}

/// Process-wide registry of persistent workers, keyed by stream kind.
///
/// Workers are registered while streams come up at boot and never removed;
/// reads vastly outnumber writes.
#[derive(Default)]
pub struct WorkerRegistry {
    workers: RwLock<HashMap<StreamKind, Vec<Arc<dyn PersistenceWorker>>>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, kind: StreamKind, worker: Arc<dyn PersistenceWorker>) {
        self.workers.write().entry(kind).or_default().push(worker);
    }

    pub fn workers_of(&self, kind: StreamKind) -> Vec<Arc<dyn PersistenceWorker>> {
        self.workers
            .read()
            .get(&kind)
            .map(|workers| workers.clone())
            .unwrap_or_default()
    }

    /// Snapshot of every registered worker across all stream kinds.
    /// Iteration order within the snapshot carries no meaning.
    pub fn persistent_workers(&self) -> Vec<Arc<dyn PersistenceWorker>> {
        let mut snapshot = self.workers_of(StreamKind::TopN);
        snapshot.extend(self.workers_of(StreamKind::Metrics));
        snapshot
    }

    pub fn len(&self) -> usize {
        self.workers.read().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

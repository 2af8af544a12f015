//! Periodic batched persistence pipeline of the farsight backend.
//!
//! Aggregation workers stream metrics and sampled top-N records into
//! in-memory worker caches; on a fixed wall-clock cadence the persistence
//! timer drains every worker through a two-phase build/execute pipeline and
//! hands the prepared batches to a pluggable storage driver.
//!
//! ## Architecture Overview
//!
//! - **Worker caches** ([`cache`]): swap-on-read double buffers isolating
//!   producers from the per-tick drain.
//! - **Workers** ([`worker`]): metrics streams buffer unbounded and flush
//!   every tick; top-N streams buffer bounded and report on their own
//!   cadence, fed through a bounded ingest queue ([`carrier`]).
//! - **Driver boundary** ([`storage`]): opaque prepared requests flushed
//!   asynchronously through the [`storage::BatchDao`].
//! - **Scheduler** ([`timer`]): fixed-delay ticks, a bounded prepare pool,
//!   per-stage latency histograms and a tick error counter from
//!   `farsight-telemetry`.
//!
//! Ticks are strictly sequential: the next one starts a full period after
//! the previous tick's aggregate future completes. Durability is delegated
//! to the storage driver; a batch lost to a failed flush surfaces through
//! the error counter and the log, never as back-pressure on ingest.

pub mod cache;
pub mod carrier;
pub mod config;
pub mod error;
pub mod model;
pub mod storage;
pub mod timer;
pub mod worker;

pub use config::CoreConfig;
pub use error::{CoreError, CoreResult};
pub use model::{Downsampling, Model, ModelListener, ModelRegistry};
pub use storage::{BatchDao, MetricsDao, PrepareRequest, RecordDao, StorageData};
pub use timer::PersistenceTimer;
pub use worker::{
    MetricsPersistentWorker, PersistenceWorker, StreamKind, TopNWorker, WorkerRegistry,
};

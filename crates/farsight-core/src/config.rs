use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Default period of the persistence tick, in seconds.
const DEFAULT_PERSISTENT_PERIOD_SECS: u64 = 25;

/// Default delay before the first tick, in seconds. Gives receivers and
/// aggregation a head start after boot.
const DEFAULT_INITIAL_DELAY_SECS: u64 = 5;

/// Default width of the prepare-stage thread pool.
const DEFAULT_PREPARE_THREADS: usize = 2;

/// Default top-N report cadence, in minutes.
const DEFAULT_TOP_N_REPORT_PERIOD_MINUTES: u64 = 10;

/// Default number of records each top-N buffer retains.
const DEFAULT_TOP_N_SIZE: usize = 50;

/// Default capacity of a top-N worker's ingest queue.
const DEFAULT_TOP_N_WORKER_QUEUE_CAPACITY: usize = 1000;

/// Default storage-session expiry, in milliseconds.
const DEFAULT_STORAGE_SESSION_TIMEOUT_MS: u64 = 70_000;

/// Configuration of the persistence core.
///
/// Field names mirror the backend's YAML knobs; the struct is
/// deserialize-ready but never reads files itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CoreConfig {
    /// The period of doing data persistence. Unit is second.
    pub persistent_period: u64,
    /// Delay before the first persistence tick. Unit is second.
    pub initial_delay: u64,
    /// The number of threads used to prepare metrics data to the storage.
    pub prepare_threads: usize,
    /// Top-N persistent cadence. Unit is minute.
    pub top_n_report_period: u64,
    /// How many records a top-N worker keeps per buffer.
    pub top_n_size: usize,
    /// Capacity of the bounded ingest queue in front of each top-N worker.
    pub top_n_worker_queue_capacity: usize,
    /// Enable database flush session.
    pub enable_database_session: bool,
    /// The threshold of session time. Unit is ms.
    pub storage_session_timeout: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            persistent_period: DEFAULT_PERSISTENT_PERIOD_SECS,
            initial_delay: DEFAULT_INITIAL_DELAY_SECS,
            prepare_threads: DEFAULT_PREPARE_THREADS,
            top_n_report_period: DEFAULT_TOP_N_REPORT_PERIOD_MINUTES,
            top_n_size: DEFAULT_TOP_N_SIZE,
            top_n_worker_queue_capacity: DEFAULT_TOP_N_WORKER_QUEUE_CAPACITY,
            enable_database_session: true,
            storage_session_timeout: DEFAULT_STORAGE_SESSION_TIMEOUT_MS,
        }
    }
}

impl CoreConfig {
    /// Interval between the end of one tick and the start of the next.
    pub fn tick_period(&self) -> Duration {
        Duration::from_secs(self.persistent_period)
    }

    /// Delay before the first tick after `start`.
    pub fn first_tick_delay(&self) -> Duration {
        Duration::from_secs(self.initial_delay)
    }

    /// Minimum interval between two non-empty top-N batches.
    pub fn report_period(&self) -> Duration {
        Duration::from_secs(self.top_n_report_period * 60)
    }

    /// Storage-session entries untouched for longer than this are evicted.
    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.storage_session_timeout)
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.persistent_period == 0 {
            return Err(CoreError::invalid_config("persistentPeriod must be positive"));
        }
        if self.prepare_threads == 0 {
            return Err(CoreError::invalid_config("prepareThreads must be positive"));
        }
        if self.top_n_size == 0 {
            return Err(CoreError::invalid_config("topNSize must be positive"));
        }
        if self.top_n_worker_queue_capacity == 0 {
            return Err(CoreError::invalid_config(
                "topNWorkerQueueCapacity must be positive",
            ));
        }
        Ok(())
    }
}

//! The persistence timer.
//!
//! One scheduler thread drives ticks on a fixed-delay cadence: the next
//! tick begins a full period after the previous tick's aggregate future
//! completes, so a slow storage back-end coalesces larger batches at a
//! lower frequency instead of stacking overlapping ticks.
//!
//! Each tick snapshots the worker registry and fans the CPU-bound prepare
//! stage out over a fixed pool of build threads; the I/O-bound execute
//! stage is delegated to the driver's own concurrency and joined through
//! the tick's aggregate future. Latencies of both stages and of the whole
//! tick are recorded through scoped histogram timers; a failed tick bumps
//! the error counter exactly once and the scheduler moves on.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam::channel::{Receiver, Sender, unbounded};
use futures::future::{BoxFuture, join_all};
use parking_lot::Mutex;
use tokio::runtime::Builder;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use farsight_telemetry::{Counter, Histogram, MetricsRegistry};

use crate::config::CoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::storage::BatchDao;
use crate::worker::WorkerRegistry;

type PrepareJob = Box<dyn FnOnce() + Send + 'static>;

enum PrepareCommand {
    Run(PrepareJob),
    Shutdown,
}

/// Fixed-width thread pool for the CPU-bound prepare stage.
struct PrepareExecutor {
    tx: Sender<PrepareCommand>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl PrepareExecutor {
    fn new(width: usize) -> CoreResult<Self> {
        let (tx, rx) = unbounded::<PrepareCommand>();
        let mut threads = Vec::with_capacity(width);
        for index in 0..width {
            let rx = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("persistence-prepare-{index}"))
                .spawn(move || Self::worker_loop(rx))
                .map_err(|err| CoreError::internal(format!("spawn prepare thread: {err}")))?;
            threads.push(handle);
        }
        Ok(Self {
            tx,
            threads: Mutex::new(threads),
        })
    }

    fn worker_loop(rx: Receiver<PrepareCommand>) {
        while let Ok(command) = rx.recv() {
            match command {
                // Jobs report their own panics through their completion
                // channel; the pool thread stays up either way.
                PrepareCommand::Run(job) => job(),
                PrepareCommand::Shutdown => break,
            }
        }
    }

    fn submit(&self, job: PrepareJob) -> CoreResult<()> {
        self.tx
            .send(PrepareCommand::Run(job))
            .map_err(|_| CoreError::Shutdown)
    }

    fn shutdown(&self) {
        let mut threads = self.threads.lock();
        for _ in threads.iter() {
            let _ = self.tx.send(PrepareCommand::Shutdown);
        }
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Everything a tick needs, re-bound on every `start` call.
struct TickContext {
    dao: Arc<dyn BatchDao>,
    registry: Arc<WorkerRegistry>,
    error_counter: Arc<Counter>,
    prepare_latency: Arc<Histogram>,
    execute_latency: Arc<Histogram>,
    all_latency: Arc<Histogram>,
}

/// Outcome of one per-worker build job: the chained flush future when the
/// batch was non-empty, `None` for an empty round.
type BuildOutcome = CoreResult<Option<BoxFuture<'static, CoreResult<()>>>>;

/// Periodic scheduler flushing every persistent worker through the batch
/// driver.
///
/// Constructed once at boot. The first `start` call wires the DAO, metric
/// handles, and worker registry, then launches the scheduler thread; later
/// calls only re-bind those references.
pub struct PersistenceTimer {
    config: CoreConfig,
    started: AtomicBool,
    context: Arc<Mutex<Option<Arc<TickContext>>>>,
    executor: Mutex<Option<Arc<PrepareExecutor>>>,
    cancel: CancellationToken,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

impl PersistenceTimer {
    pub fn new(config: CoreConfig) -> CoreResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            started: AtomicBool::new(false),
            context: Arc::new(Mutex::new(None)),
            executor: Mutex::new(None),
            cancel: CancellationToken::new(),
            scheduler: Mutex::new(None),
        })
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Bind the driver and instrumentation, and launch the scheduler if it
    /// is not already running.
    pub fn start(
        &self,
        dao: Arc<dyn BatchDao>,
        metrics: &MetricsRegistry,
        registry: Arc<WorkerRegistry>,
    ) -> CoreResult<()> {
        let context = Arc::new(TickContext {
            dao,
            registry,
            error_counter: metrics.create_counter(
                "persistence_timer_bulk_error_count",
                "Error execution of the prepare stage in persistence timer",
            ),
            prepare_latency: metrics.create_histogram(
                "persistence_timer_bulk_prepare_latency",
                "Latency of the prepare stage in persistence timer",
            ),
            execute_latency: metrics.create_histogram(
                "persistence_timer_bulk_execute_latency",
                "Latency of the execute stage in persistence timer",
            ),
            all_latency: metrics.create_histogram(
                "persistence_timer_bulk_all_latency",
                "Latency of the all stage in persistence timer",
            ),
        });
        *self.context.lock() = Some(context);

        if self.started.swap(true, Ordering::AcqRel) {
            // Already running: the call above re-bound the references.
            return Ok(());
        }

        info!("persistence timer start");
        let executor = Arc::new(PrepareExecutor::new(self.config.prepare_threads)?);
        *self.executor.lock() = Some(Arc::clone(&executor));

        let shared_context = Arc::clone(&self.context);
        let cancel = self.cancel.clone();
        let first_delay = self.config.first_tick_delay();
        let period = self.config.tick_period();
        let handle = thread::Builder::new()
            .name("persistence-timer".to_string())
            .spawn(move || {
                let runtime = match Builder::new_current_thread().enable_time().build() {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        error!(error = %err, "failed to build scheduler runtime");
                        return;
                    }
                };
                runtime.block_on(async move {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(first_delay) => {}
                    }
                    loop {
                        let context = shared_context.lock().clone();
                        if let Some(context) = context {
                            if let Err(err) = run_tick(&context, &executor).await {
                                error!(error = %err, "extract data and save failure");
                            }
                        }
                        // Fixed delay: the full period elapses after the
                        // tick completes, not after it began.
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = tokio::time::sleep(period) => {}
                        }
                    }
                });
            })
            .map_err(|err| CoreError::internal(format!("spawn scheduler thread: {err}")))?;
        *self.scheduler.lock() = Some(handle);
        Ok(())
    }

    /// Stop the scheduler: a tick in flight runs to completion, then the
    /// scheduler thread and the prepare pool are joined.
    pub fn shutdown(&self) {
        if !self.started.load(Ordering::Acquire) {
            return;
        }
        self.cancel.cancel();
        if let Some(handle) = self.scheduler.lock().take() {
            let _ = handle.join();
        }
        if let Some(executor) = self.executor.lock().take() {
            executor.shutdown();
        }
        info!("persistence timer stopped");
    }
}

impl Drop for PersistenceTimer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// One scheduling tick: fan out builds, chain flushes, join everything.
async fn run_tick(context: &TickContext, executor: &PrepareExecutor) -> CoreResult<()> {
    debug!("extract data and save");
    let tick_started = Instant::now();
    let all_timer = context.all_latency.start_timer();

    let workers = context.registry.persistent_workers();
    let mut pending = Vec::with_capacity(workers.len());
    for worker in workers {
        let (done_tx, done_rx) = oneshot::channel::<BuildOutcome>();
        let dao = Arc::clone(&context.dao);
        let prepare_latency = Arc::clone(&context.prepare_latency);
        executor.submit(Box::new(move || {
            let worker_name = worker.name().to_string();
            let requests = {
                let _prepare_timer = prepare_latency.start_timer();
                panic::catch_unwind(AssertUnwindSafe(|| {
                    let requests = worker.build_batch_requests();
                    worker.end_of_round();
                    requests
                }))
            };
            let outcome: BuildOutcome = match requests {
                Ok(requests) if requests.is_empty() => Ok(None),
                Ok(requests) => Ok(Some(dao.flush(requests))),
                Err(payload) => Err(CoreError::WorkerPanic(format!(
                    "{worker_name}: {}",
                    panic_message(&payload)
                ))),
            };
            let _ = done_tx.send(outcome);
        }))?;
        pending.push(done_rx);
    }

    let chains = pending.into_iter().map(|done_rx| {
        let execute_latency = Arc::clone(&context.execute_latency);
        async move {
            match done_rx.await {
                Ok(Ok(Some(flush))) => {
                    // The guard closes the execute timer exactly once, on
                    // success and failure alike.
                    let _execute_timer = execute_latency.start_timer();
                    flush.await
                }
                Ok(Ok(None)) => Ok(()),
                Ok(Err(err)) => Err(err),
                Err(_) => Err(CoreError::internal(
                    "prepare stage dropped its completion channel",
                )),
            }
        }
    });
    let results = join_all(chains).await;

    drop(all_timer);
    debug!(
        elapsed_ms = tick_started.elapsed().as_millis() as u64,
        "batch persistence duration"
    );
    if let Some(first_cause) = results.into_iter().find_map(Result::err) {
        context.error_counter.inc();
        error!(error = %first_cause, "persistence tick failed");
    }
    Ok(())
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn executor_runs_jobs_across_its_threads() {
        let executor = PrepareExecutor::new(2).expect("executor");
        let seen_threads = Arc::new(Mutex::new(HashSet::new()));
        let completed = Arc::new(AtomicUsize::new(0));
        for _ in 0..16 {
            let seen_threads = Arc::clone(&seen_threads);
            let completed = Arc::clone(&completed);
            executor
                .submit(Box::new(move || {
                    seen_threads
                        .lock()
                        .insert(thread::current().name().map(str::to_string));
                    thread::sleep(Duration::from_millis(5));
                    completed.fetch_add(1, Ordering::SeqCst);
                }))
                .expect("submit");
        }
        executor.shutdown();
        assert_eq!(completed.load(Ordering::SeqCst), 16);
        assert!(seen_threads.lock().len() <= 2);
    }

    #[test]
    fn submit_after_shutdown_is_rejected() {
        let executor = PrepareExecutor::new(1).expect("executor");
        executor.shutdown();
        let result = executor.submit(Box::new(|| {}));
        assert!(matches!(result, Err(CoreError::Shutdown)));
    }

    #[test]
    fn panic_messages_are_extracted() {
        let payload = panic::catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload = panic::catch_unwind(|| panic!("{} {}", "boom", 2)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "boom 2");
    }
}

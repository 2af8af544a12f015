use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::carrier::{Consumer, DataCarrier};
use crate::cache::{LimitedSizeBufferedData, ReadWriteSafeCache};
use crate::config::CoreConfig;
use crate::model::Model;
use crate::storage::{PrepareRequest, RecordDao, StorageData};
use crate::worker::PersistenceWorker;

type TopNCache<T> = ReadWriteSafeCache<T, LimitedSizeBufferedData<T>>;

/// Persistence worker for sampled peak records.
///
/// Ingest goes through a bounded queue drained by one consumer thread into
/// a size-bounded double buffer, so memory stays at 2·N regardless of input
/// rate. The worker reports on its own cadence: the build phase yields an
/// empty batch until the report period has elapsed since the last non-empty
/// one.
pub struct TopNWorker<T: StorageData + Ord> {
    model: Arc<Model>,
    dao: Arc<dyn RecordDao<T>>,
    cache: Arc<TopNCache<T>>,
    carrier: DataCarrier<T>,
    report_period: Duration,
    last_report: Mutex<Instant>,
}

struct CacheFeeder<T: StorageData + Ord> {
    cache: Arc<TopNCache<T>>,
}

impl<T: StorageData + Ord + Send + Sync + 'static> Consumer<T> for CacheFeeder<T> {
    fn consume(&self, items: Vec<T>) {
        for item in items {
            self.cache.write(item);
        }
    }
}

impl<T: StorageData + Ord> TopNWorker<T> {
    pub fn new(
        model: Arc<Model>,
        dao: Arc<dyn RecordDao<T>>,
        top_n_size: usize,
        report_period: Duration,
        queue_capacity: usize,
    ) -> Self {
        let cache = Arc::new(ReadWriteSafeCache::new(
            LimitedSizeBufferedData::new(top_n_size),
            LimitedSizeBufferedData::new(top_n_size),
        ));
        let carrier = DataCarrier::new(
            &format!("topn-{}", model.name()),
            queue_capacity,
            CacheFeeder {
                cache: Arc::clone(&cache),
            },
        );
        Self {
            model,
            dao,
            cache,
            carrier,
            report_period,
            last_report: Mutex::new(Instant::now()),
        }
    }

    pub fn from_config(
        model: Arc<Model>,
        dao: Arc<dyn RecordDao<T>>,
        config: &CoreConfig,
    ) -> Self {
        Self::new(
            model,
            dao,
            config.top_n_size,
            config.report_period(),
            config.top_n_worker_queue_capacity,
        )
    }

    /// Hand one record to the ingest queue. Blocks while the queue is full.
    pub fn offer(&self, item: T) {
        self.carrier.produce(item);
    }

    /// Stop the ingest consumer. Records still in the cache remain readable
    /// by a final build.
    pub fn shutdown(&self) {
        self.carrier.shutdown();
    }
}

impl<T: StorageData + Ord> PersistenceWorker for TopNWorker<T> {
    fn name(&self) -> &str {
        self.model.name()
    }

    fn build_batch_requests(&self) -> Vec<PrepareRequest> {
        {
            let mut last_report = self.last_report.lock();
            // Only report in this worker's own report period.
            if last_report.elapsed() < self.report_period {
                return Vec::new();
            }
            *last_report = Instant::now();
        }

        let drained = self.cache.read();
        if drained.is_empty() {
            return Vec::new();
        }
        debug!(model = self.model.name(), records = drained.len(), "reporting top-n snapshot");

        let mut requests = Vec::with_capacity(drained.len());
        for record in &drained {
            match self.dao.prepare_insert(&self.model, record) {
                Ok(request) => requests.push(request),
                Err(err) => {
                    error!(
                        model = self.model.name(),
                        id = record.storage_id(),
                        error = %err,
                        "dropping record that failed to prepare"
                    );
                }
            }
        }
        requests
    }

    /// The double buffer already bounds memory; nothing expires here.
    fn end_of_round(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreResult;
    use crate::model::Downsampling;
    use crate::worker::StreamKind;
    use std::cmp::Ordering;
    use std::thread;

    #[derive(Debug, Eq, PartialEq)]
    struct SlowQuery {
        statement: String,
        latency_ms: u64,
    }

    impl SlowQuery {
        fn new(statement: &str, latency_ms: u64) -> Self {
            Self {
                statement: statement.to_string(),
                latency_ms,
            }
        }
    }

    impl StorageData for SlowQuery {
        fn storage_id(&self) -> &str {
            &self.statement
        }
    }

    impl Ord for SlowQuery {
        fn cmp(&self, other: &Self) -> Ordering {
            self.latency_ms.cmp(&other.latency_ms)
        }
    }

    impl PartialOrd for SlowQuery {
        fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
            Some(self.cmp(other))
        }
    }

    struct FakeRecordDao;

    impl RecordDao<SlowQuery> for FakeRecordDao {
        fn prepare_insert(&self, model: &Model, item: &SlowQuery) -> CoreResult<PrepareRequest> {
            Ok(PrepareRequest::new(model, item.latency_ms))
        }
    }

    fn worker(top_n_size: usize, report_period: Duration) -> TopNWorker<SlowQuery> {
        let model = Arc::new(Model::new(
            "top_n_database_statement",
            StreamKind::TopN,
            Downsampling::Second,
            true,
        ));
        TopNWorker::new(model, Arc::new(FakeRecordDao), top_n_size, report_period, 64)
    }

    fn settle() {
        // Give the consumer thread a moment to drain the queue.
        thread::sleep(Duration::from_millis(50));
    }

    #[test]
    fn reports_only_after_the_period_elapses() {
        let worker = worker(10, Duration::from_millis(120));
        worker.offer(SlowQuery::new("select 1", 30));
        settle();

        assert!(worker.build_batch_requests().is_empty());

        thread::sleep(Duration::from_millis(150));
        let requests = worker.build_batch_requests();
        assert_eq!(requests.len(), 1);

        // The gate re-arms after a non-empty report.
        worker.offer(SlowQuery::new("select 2", 40));
        settle();
        assert!(worker.build_batch_requests().is_empty());
        worker.shutdown();
    }

    #[test]
    fn keeps_only_the_slowest_records() {
        let worker = worker(2, Duration::from_millis(0));
        for (statement, latency) in [("a", 10), ("b", 50), ("c", 30), ("d", 90)] {
            worker.offer(SlowQuery::new(statement, latency));
        }
        settle();

        let latencies: Vec<u64> = worker
            .build_batch_requests()
            .into_iter()
            .map(|request| request.downcast::<u64>().expect("latency payload"))
            .collect();
        assert_eq!(latencies, vec![50, 90]);
        worker.shutdown();
    }

    #[test]
    fn end_of_round_is_a_no_op() {
        let worker = worker(4, Duration::from_millis(0));
        worker.offer(SlowQuery::new("select 1", 10));
        settle();
        worker.end_of_round();
        assert_eq!(worker.build_batch_requests().len(), 1);
        worker.shutdown();
    }
}

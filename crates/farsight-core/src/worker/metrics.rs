use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::cache::{BufferList, ReadWriteSafeCache};
use crate::config::CoreConfig;
use crate::model::Model;
use crate::storage::{MetricsDao, PrepareRequest, StorageData};
use crate::worker::PersistenceWorker;

/// Persistence worker for aggregated metric streams.
///
/// Aggregation results accumulate in an unbounded double-buffered cache
/// between ticks. The build phase drains the cache and rewrites each item
/// as an insert or an update: a series seen within the storage session
/// window already has a row, so it becomes an update; anything else is a
/// fresh insert. With sessions disabled every item maps to an insert and
/// the session table stays empty.
pub struct MetricsPersistentWorker<T: StorageData> {
    model: Arc<Model>,
    dao: Arc<dyn MetricsDao<T>>,
    cache: ReadWriteSafeCache<T, BufferList<T>>,
    enable_session: bool,
    session_timeout: Duration,
    /// Series id -> last time the series was written this session.
    sessions: Mutex<HashMap<String, Instant>>,
}

impl<T: StorageData> MetricsPersistentWorker<T> {
    pub fn new(model: Arc<Model>, dao: Arc<dyn MetricsDao<T>>, config: &CoreConfig) -> Self {
        Self {
            model,
            dao,
            cache: ReadWriteSafeCache::new(BufferList::new(), BufferList::new()),
            enable_session: config.enable_database_session,
            session_timeout: config.session_timeout(),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Non-blocking insertion into the active cache buffer. Back-pressure
    /// is applied upstream, in the stream processors.
    pub fn offer(&self, item: T) {
        self.cache.write(item);
    }

    /// Series currently inside the session window.
    pub fn active_sessions(&self) -> usize {
        self.sessions.lock().len()
    }
}

impl<T: StorageData> PersistenceWorker for MetricsPersistentWorker<T> {
    fn name(&self) -> &str {
        self.model.name()
    }

    fn build_batch_requests(&self) -> Vec<PrepareRequest> {
        let drained = self.cache.read();
        if drained.is_empty() {
            return Vec::new();
        }
        debug!(model = self.model.name(), items = drained.len(), "building batch requests");

        let mut requests = Vec::with_capacity(drained.len());
        let mut sessions = self.sessions.lock();
        let now = Instant::now();
        for item in &drained {
            let id = item.storage_id();
            let in_session = self.enable_session && sessions.contains_key(id);
            let prepared = if in_session {
                self.dao.prepare_update(&self.model, item)
            } else {
                self.dao.prepare_insert(&self.model, item)
            };
            match prepared {
                Ok(request) => {
                    if self.enable_session {
                        sessions.insert(id.to_string(), now);
                    }
                    requests.push(request);
                }
                // A broken entry never aborts the batch.
                Err(err) => {
                    error!(
                        model = self.model.name(),
                        id,
                        error = %err,
                        "dropping entry that failed to prepare"
                    );
                }
            }
        }
        requests
    }

    fn end_of_round(&self) {
        if !self.enable_session {
            return;
        }
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        let timeout = self.session_timeout;
        sessions.retain(|_, last_written| last_written.elapsed() < timeout);
        let expired = before - sessions.len();
        if expired > 0 {
            debug!(model = self.model.name(), expired, "expired storage sessions");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CoreError, CoreResult};
    use crate::model::Downsampling;
    use crate::worker::StreamKind;

    #[derive(Clone)]
    struct Metric {
        id: String,
        fail: bool,
    }

    impl Metric {
        fn named(id: &str) -> Self {
            Self {
                id: id.to_string(),
                fail: false,
            }
        }
    }

    impl StorageData for Metric {
        fn storage_id(&self) -> &str {
            &self.id
        }
    }

    #[derive(Debug, PartialEq)]
    enum Op {
        Insert,
        Update,
    }

    struct FakeDao;

    impl MetricsDao<Metric> for FakeDao {
        fn prepare_insert(&self, model: &Model, item: &Metric) -> CoreResult<PrepareRequest> {
            if item.fail {
                return Err(CoreError::prepare(model.name(), "unmappable item"));
            }
            Ok(PrepareRequest::new(model, Op::Insert))
        }

        fn prepare_update(&self, model: &Model, item: &Metric) -> CoreResult<PrepareRequest> {
            if item.fail {
                return Err(CoreError::prepare(model.name(), "unmappable item"));
            }
            Ok(PrepareRequest::new(model, Op::Update))
        }
    }

    fn worker(config: &CoreConfig) -> MetricsPersistentWorker<Metric> {
        let model = Arc::new(Model::new(
            "service_resp_time",
            StreamKind::Metrics,
            Downsampling::Minute,
            false,
        ));
        MetricsPersistentWorker::new(model, Arc::new(FakeDao), config)
    }

    fn ops(requests: Vec<PrepareRequest>) -> Vec<Op> {
        requests
            .into_iter()
            .map(|request| request.downcast::<Op>().expect("op payload"))
            .collect()
    }

    #[test]
    fn first_write_inserts_then_session_updates() {
        let worker = worker(&CoreConfig::default());
        worker.offer(Metric::named("svc-1"));
        assert_eq!(ops(worker.build_batch_requests()), vec![Op::Insert]);

        worker.offer(Metric::named("svc-1"));
        worker.offer(Metric::named("svc-2"));
        let second = ops(worker.build_batch_requests());
        assert_eq!(second, vec![Op::Update, Op::Insert]);
        assert_eq!(worker.active_sessions(), 2);
    }

    #[test]
    fn disabled_sessions_always_insert() {
        let config = CoreConfig {
            enable_database_session: false,
            ..CoreConfig::default()
        };
        let worker = worker(&config);
        worker.offer(Metric::named("svc-1"));
        assert_eq!(ops(worker.build_batch_requests()), vec![Op::Insert]);
        worker.offer(Metric::named("svc-1"));
        assert_eq!(ops(worker.build_batch_requests()), vec![Op::Insert]);
        assert_eq!(worker.active_sessions(), 0);
    }

    #[test]
    fn end_of_round_expires_stale_sessions() {
        let config = CoreConfig {
            storage_session_timeout: 30,
            ..CoreConfig::default()
        };
        let worker = worker(&config);
        worker.offer(Metric::named("svc-1"));
        worker.build_batch_requests();
        assert_eq!(worker.active_sessions(), 1);

        std::thread::sleep(Duration::from_millis(60));
        worker.end_of_round();
        assert_eq!(worker.active_sessions(), 0);

        // Back outside the session window, the series inserts again.
        worker.offer(Metric::named("svc-1"));
        assert_eq!(ops(worker.build_batch_requests()), vec![Op::Insert]);
    }

    #[test]
    fn broken_entries_are_skipped_not_fatal() {
        let worker = worker(&CoreConfig::default());
        worker.offer(Metric::named("svc-1"));
        worker.offer(Metric {
            id: "svc-bad".to_string(),
            fail: true,
        });
        worker.offer(Metric::named("svc-2"));
        let requests = worker.build_batch_requests();
        assert_eq!(requests.len(), 2);
        // The failed entry never entered the session window.
        assert_eq!(worker.active_sessions(), 2);
    }
}

//! Storage driver boundary.
//!
//! The pipeline hands drivers opaque [`PrepareRequest`] values through the
//! [`BatchDao`]; what a request means (an insert statement, a bulk-index
//! entry, a KV put) is entirely the driver's business. The mapper traits
//! ([`MetricsDao`], [`RecordDao`]) are the only place where cached items are
//! turned into driver payloads.

use std::any::Any;
use std::fmt;

use futures::future::BoxFuture;

use crate::error::CoreResult;
use crate::model::Model;

/// Payload accepted by the persistence pipeline.
///
/// The pipeline never looks past the id, which keys storage sessions and
/// names the item in per-entry failure logs.
pub trait StorageData: Send + Sync + 'static {
    fn storage_id(&self) -> &str;
}

/// Driver-specific write descriptor.
///
/// A plain value with no identity: the core moves batches of these from the
/// prepare stage to [`BatchDao::flush`] without inspecting the payload.
pub struct PrepareRequest {
    model: String,
    payload: Box<dyn Any + Send>,
}

impl PrepareRequest {
    pub fn new<P>(model: &Model, payload: P) -> Self
    where
        P: Send + 'static,
    {
        Self {
            model: model.name().to_string(),
            payload: Box::new(payload),
        }
    }

    /// Name of the target model, for logs and driver-side routing.
    pub fn model_name(&self) -> &str {
        &self.model
    }

    /// Recover the driver payload. Fails with `self` intact when the
    /// request was built with a different payload type.
    pub fn downcast<P: 'static>(self) -> Result<P, PrepareRequest> {
        let Self { model, payload } = self;
        match payload.downcast::<P>() {
            Ok(payload) => Ok(*payload),
            Err(payload) => Err(Self { model, payload }),
        }
    }

    pub fn payload_ref<P: 'static>(&self) -> Option<&P> {
        self.payload.downcast_ref()
    }
}

impl fmt::Debug for PrepareRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrepareRequest")
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

/// Asynchronous batched storage driver.
///
/// `flush` submits a prepared batch; completion, success or failure, is
/// observable only through the returned future. Implementations are free to
/// split, reorder, and parallelize internally. Idempotence is not part of
/// this contract; workers key their writes deterministically instead.
pub trait BatchDao: Send + Sync {
    fn flush(&self, requests: Vec<PrepareRequest>) -> BoxFuture<'static, CoreResult<()>>;
}

/// Maps aggregated metric items to driver requests.
///
/// The metrics worker chooses `prepare_insert` for series outside the
/// current storage session and `prepare_update` for series inside it.
pub trait MetricsDao<T: StorageData>: Send + Sync {
    fn prepare_insert(&self, model: &Model, item: &T) -> CoreResult<PrepareRequest>;
    fn prepare_update(&self, model: &Model, item: &T) -> CoreResult<PrepareRequest>;
}

/// Maps sampled records (top-N) to driver insert requests.
pub trait RecordDao<T: StorageData>: Send + Sync {
    fn prepare_insert(&self, model: &Model, item: &T) -> CoreResult<PrepareRequest>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Downsampling;
    use crate::worker::StreamKind;

    #[test]
    fn downcast_recovers_the_payload() {
        let model = Model::new("segment", StreamKind::Metrics, Downsampling::Second, true);
        let request = PrepareRequest::new(&model, String::from("INSERT INTO segment ..."));
        assert_eq!(request.model_name(), "segment");
        assert!(request.payload_ref::<u32>().is_none());
        let sql: String = request.downcast().expect("payload type matches");
        assert!(sql.starts_with("INSERT"));
    }

    #[test]
    fn downcast_mismatch_returns_the_request() {
        let model = Model::new("segment", StreamKind::Metrics, Downsampling::Second, true);
        let request = PrepareRequest::new(&model, 42u64);
        let request = request.downcast::<String>().expect_err("wrong type");
        assert_eq!(request.model_name(), "segment");
        assert_eq!(request.downcast::<u64>().expect("original type"), 42);
    }
}

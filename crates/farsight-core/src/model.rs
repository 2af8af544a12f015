//! Schema descriptors for persisted streams.
//!
//! Models are registered declaratively at boot, one per scope and
//! downsampling; the persistence pipeline holds them as opaque references
//! and never introspects columns.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::worker::StreamKind;

/// Time resolution of a persisted series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Downsampling {
    Second,
    Minute,
    Hour,
    Day,
}

impl fmt::Display for Downsampling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Downsampling::Second => write!(f, "second"),
            Downsampling::Minute => write!(f, "minute"),
            Downsampling::Hour => write!(f, "hour"),
            Downsampling::Day => write!(f, "day"),
        }
    }
}

/// Immutable descriptor of one storage table or index.
#[derive(Debug)]
pub struct Model {
    name: String,
    kind: StreamKind,
    downsampling: Downsampling,
    record: bool,
}

impl Model {
    pub fn new(name: &str, kind: StreamKind, downsampling: Downsampling, record: bool) -> Self {
        Self {
            name: name.to_string(),
            kind,
            downsampling,
            record,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn downsampling(&self) -> Downsampling {
        self.downsampling
    }

    /// Record models hold raw sampled rows rather than aggregations.
    pub fn is_record(&self) -> bool {
        self.record
    }
}

/// Reacts to model registration, e.g. by creating the backing table.
pub trait ModelListener: Send + Sync {
    fn model_added(&self, model: &Arc<Model>);
}

struct RegistryInner {
    models: Vec<Arc<Model>>,
    listeners: Vec<Arc<dyn ModelListener>>,
}

/// Append-only registry of every model known to the process.
///
/// Listeners subscribed after some models already exist are replayed the
/// full history, so storage providers can subscribe at any point during
/// boot.
pub struct ModelRegistry {
    inner: Mutex<RegistryInner>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                models: Vec::new(),
                listeners: Vec::new(),
            }),
        }
    }

    pub fn add(&self, model: Model) -> Arc<Model> {
        let model = Arc::new(model);
        let mut inner = self.inner.lock();
        debug!(model = model.name(), downsampling = %model.downsampling(), "model registered");
        inner.models.push(Arc::clone(&model));
        for listener in &inner.listeners {
            listener.model_added(&model);
        }
        model
    }

    pub fn subscribe(&self, listener: Arc<dyn ModelListener>) {
        let mut inner = self.inner.lock();
        for model in &inner.models {
            listener.model_added(model);
        }
        inner.listeners.push(listener);
    }

    pub fn all_models(&self) -> Vec<Arc<Model>> {
        self.inner.lock().models.clone()
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

use std::fmt::Display;

/// A specialized error type for the persistence core.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Configuration value was invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// A single cached entry could not be turned into a prepared request.
    #[error("prepare failed for model {model}: {reason}")]
    Prepare { model: String, reason: String },
    /// The storage driver reported a failed batch.
    #[error("flush failed: {0}")]
    Flush(String),
    /// A build task unwound; the tick is reported as failed.
    #[error("worker task panicked: {0}")]
    WorkerPanic(String),
    /// Component was used after teardown.
    #[error("component is shut down")]
    Shutdown,
    /// Internal error (channel breakage, thread spawn failure, etc.).
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Create an invalid configuration error from a displayable value.
    pub fn invalid_config<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::InvalidConfig(msg.to_string())
    }

    /// Create a per-item prepare error for the given model.
    pub fn prepare<T>(model: &str, reason: T) -> Self
    where
        T: Display,
    {
        Self::Prepare {
            model: model.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Create a flush error from a displayable value.
    pub fn flush<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::Flush(msg.to_string())
    }

    /// Create an internal error from a displayable value.
    pub fn internal<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::Internal(msg.to_string())
    }
}

/// A Result type alias for persistence core operations.
pub type CoreResult<T> = Result<T, CoreError>;

//! Error handling for the forecasting lifecycle engine
//!
//! Every stage of a retraining run reports failures through [`ForecastError`].
//! The orchestrator converts these into a structured `RetrainResult`, so only
//! library callers working with individual components see the enum directly.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Main error type for the lifecycle engine
#[derive(Error, Debug)]
pub enum ForecastError {
    #[error("No samples for device {device_id} between {since} and {until}")]
    NoData {
        device_id: String,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    },

    #[error("Insufficient labeled samples: {found} (need at least {required}, {match_failures} unmatched)")]
    InsufficientLabeledSamples {
        found: usize,
        required: usize,
        match_failures: usize,
    },

    #[error("Samples out of order at index {index}: {current} precedes {previous}")]
    UnorderedInput {
        index: usize,
        previous: DateTime<Utc>,
        current: DateTime<Utc>,
    },

    #[error("Training failed: {message}")]
    Training { message: String },

    #[error("Retrain already in progress for device {device_id} (waited {waited_ms} ms)")]
    RetrainInProgress { device_id: String, waited_ms: u64 },

    #[error("Run cancelled before stage {stage}")]
    Cancelled { stage: String },

    #[error("Model version {version} already exists")]
    VersionCollision { version: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Validation error: {field} - {message}")]
    Validation { field: String, message: String },

    #[error("Resource not found: {resource} - {id}")]
    NotFound { resource: String, id: String },

    #[error("I/O operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization failed: {context}")]
    Serialization {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Database operation failed: {operation} - {source}")]
    Database {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Mutex lock failed: {resource}")]
    MutexPoisoned { resource: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Type alias for Result with ForecastError
pub type ForecastResult<T> = Result<T, ForecastError>;

impl ForecastError {
    /// Create a training error
    pub fn training(message: impl Into<String>) -> Self {
        Self::Training {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a validation error
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a not found error
    pub fn not_found(resource: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: id.into(),
        }
    }

    /// Create an I/O error
    pub fn io(operation: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    /// Create a serialization error
    pub fn serialization(context: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Serialization {
            context: context.into(),
            source,
        }
    }

    /// Create a database error
    pub fn database(
        operation: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Database {
            operation: operation.into(),
            source: Box::new(source),
        }
    }

    /// Create a cancellation error for the stage that was about to start
    pub fn cancelled(stage: impl Into<String>) -> Self {
        Self::Cancelled {
            stage: stage.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Stable snake_case label recorded with failed runs.
    pub fn kind(&self) -> &'static str {
        match self {
            ForecastError::NoData { .. } => "no_data",
            ForecastError::InsufficientLabeledSamples { .. } => "insufficient_labeled_samples",
            ForecastError::UnorderedInput { .. } => "unordered_input",
            ForecastError::Training { .. } => "training",
            ForecastError::RetrainInProgress { .. } => "retrain_in_progress",
            ForecastError::Cancelled { .. } => "cancelled",
            ForecastError::VersionCollision { .. } => "version_collision",
            ForecastError::Config { .. } => "config",
            ForecastError::Validation { .. } => "validation",
            ForecastError::NotFound { .. } => "not_found",
            ForecastError::Io { .. } => "io",
            ForecastError::Serialization { .. } => "serialization",
            ForecastError::Database { .. } => "database",
            ForecastError::MutexPoisoned { .. } => "mutex_poisoned",
            ForecastError::Internal { .. } => "internal",
        }
    }

    /// Whether a caller may simply try the same run again later.
    ///
    /// Data shortages need new samples first, and integration defects or
    /// training failures would fail the same way again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ForecastError::RetrainInProgress { .. })
    }
}

/// Helper trait for safe mutex operations
///
/// Returns a ForecastError on poison instead of panicking.
pub trait SafeLock<T: ?Sized> {
    fn safe_lock(&self) -> ForecastResult<std::sync::MutexGuard<'_, T>>;
}

impl<T: ?Sized> SafeLock<T> for std::sync::Mutex<T> {
    fn safe_lock(&self) -> ForecastResult<std::sync::MutexGuard<'_, T>> {
        self.lock().map_err(|_| ForecastError::MutexPoisoned {
            resource: "generic_mutex".to_string(),
        })
    }
}

/// Helper trait for safe RwLock read operations
pub trait SafeReadLock<T: ?Sized> {
    fn safe_read(&self) -> ForecastResult<std::sync::RwLockReadGuard<'_, T>>;
}

impl<T: ?Sized> SafeReadLock<T> for std::sync::RwLock<T> {
    fn safe_read(&self) -> ForecastResult<std::sync::RwLockReadGuard<'_, T>> {
        self.read().map_err(|_| ForecastError::MutexPoisoned {
            resource: "rwlock_read".to_string(),
        })
    }
}

/// Helper trait for safe RwLock write operations
pub trait SafeWriteLock<T: ?Sized> {
    fn safe_write(&self) -> ForecastResult<std::sync::RwLockWriteGuard<'_, T>>;
}

impl<T: ?Sized> SafeWriteLock<T> for std::sync::RwLock<T> {
    fn safe_write(&self) -> ForecastResult<std::sync::RwLockWriteGuard<'_, T>> {
        self.write().map_err(|_| ForecastError::MutexPoisoned {
            resource: "rwlock_write".to_string(),
        })
    }
}

/// Convert from sled errors
impl From<sled::Error> for ForecastError {
    fn from(err: sled::Error) -> Self {
        ForecastError::database("sled_operation", err)
    }
}

/// Convert from serde_json errors
impl From<serde_json::Error> for ForecastError {
    fn from(err: serde_json::Error) -> Self {
        ForecastError::serialization("json_operation", err)
    }
}

/// Convert from std::io errors
impl From<std::io::Error> for ForecastError {
    fn from(err: std::io::Error) -> Self {
        ForecastError::io("io_operation", err)
    }
}

/// Convert from figment errors
impl From<figment::Error> for ForecastError {
    fn from(err: figment::Error) -> Self {
        ForecastError::config(err.to_string())
    }
}

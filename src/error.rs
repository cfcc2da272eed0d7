//! Error taxonomy for the health-data ingestion and analysis core. Each
//! subsystem gets its own `thiserror`-derived enum rather than one crate-wide
//! error, so a caller can match on the kind of failure that is meaningful at
//! its layer (a storage retry loop cares about `StorageError`, the HTTP binding
//! cares about `ControlPlaneError`). Errors compose upward via `#[from]` rather
//! than being converted to strings at each hop.

use thiserror::Error;

/// Result alias for the structured/blob store layer.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Result alias for the analysis pipeline.
pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

/// Result alias for the upload control plane.
pub type ControlPlaneResult<T> = std::result::Result<T, ControlPlaneError>;

/// StorageFailure: network/IO errors against the object or structured store.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("item not found: {0}")]
    NotFound(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{context}: {source}")]
    WithContext {
        context: String,
        source: Box<StorageError>,
    },

    #[error("{0}")]
    Other(String),
}

impl StorageError {
    pub fn context(self, context: impl Into<String>) -> Self {
        StorageError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        StorageError::NotFound(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        StorageError::Validation(msg.into())
    }

    pub fn other(msg: impl Into<String>) -> Self {
        StorageError::Other(msg.into())
    }

    /// True for errors worth retrying with backoff.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            StorageError::Database(_) | StorageError::Io(_) | StorageError::Other(_)
        )
    }
}

/// Extension trait mirroring `anyhow::Context` for the typed storage error.
pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> StorageResult<T>;
}

impl<T> ResultExt<T> for StorageResult<T> {
    fn context(self, context: impl Into<String>) -> StorageResult<T> {
        self.map_err(|e| e.context(context))
    }
}

/// DataValidationFailure reasons.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DataValidationReason {
    #[error("actigraphy sequence is empty")]
    EmptyActigraphy,

    #[error("actigraphy sequence has {0} points, exceeding the 20160 cap")]
    ActigraphyTooLarge(usize),

    #[error("non-finite value encountered at sample index {0}")]
    NonFiniteValue(usize),
}

/// Pipeline-internal error taxonomy.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// DataValidationFailure: empty/too-large/non-finite actigraphy.
    #[error("data validation failed: {0}")]
    DataValidation(#[from] DataValidationReason),

    /// IntegrityFailure: weight checksum mismatch or unrecognized shapes.
    #[error("model integrity check failed for variant {variant}: expected {expected}, got {actual}")]
    Integrity {
        variant: String,
        expected: String,
        actual: String,
    },

    /// InferenceFailure: runtime failure inside the model (retried up to 2x by
    /// the caller).
    #[error("inference failed: {0}")]
    Inference(String),

    /// StorageFailure surfacing up through the pipeline (e.g. weight file
    /// read).
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Timeout: job exceeded its wall-clock cap.
    #[error("pipeline exceeded its wall-clock budget")]
    Timeout,
}

impl PipelineError {
    /// A short machine-readable reason code, persisted on the failed
    /// `ProcessingJob`.
    pub fn reason_code(&self) -> &'static str {
        match self {
            PipelineError::DataValidation(DataValidationReason::EmptyActigraphy) => {
                "empty_actigraphy"
            }
            PipelineError::DataValidation(DataValidationReason::ActigraphyTooLarge(_)) => {
                "data_too_large"
            }
            PipelineError::DataValidation(DataValidationReason::NonFiniteValue(_)) => {
                "non_finite_value"
            }
            PipelineError::Integrity { .. } => "model_integrity_failure",
            PipelineError::Inference(_) => "inference_failure",
            PipelineError::Storage(_) => "storage_failure",
            PipelineError::Timeout => "timeout",
        }
    }
}

/// Ingress-facing error taxonomy. The HTTP binding maps these to RFC 7807
/// Problem Details; nothing below this layer knows about HTTP status codes.
#[derive(Error, Debug)]
pub enum ControlPlaneError {
    /// ValidationFailure: malformed payload, count out of bounds, type
    /// mismatch.
    #[error("validation failed: {0}")]
    Validation(String),

    /// AuthorizationFailure: caller acting on another user's resource.
    #[error("not authorized to act on this resource")]
    Authorization,

    /// ResourceNotFound: also returned for "found but wrong user".
    #[error("resource not found: {0}")]
    NotFound(String),

    /// StorageFailure surfaced to the caller as 503.
    #[error("service temporarily unavailable: {0}")]
    ServiceUnavailable(String),

    /// A pipeline error surfaced synchronously (rare: only for inline preflight
    /// checks).
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

impl From<StorageError> for ControlPlaneError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound(msg) => ControlPlaneError::NotFound(msg),
            StorageError::Validation(msg) => ControlPlaneError::Validation(msg),
            other => ControlPlaneError::ServiceUnavailable(other.to_string()),
        }
    }
}

impl ControlPlaneError {
    pub fn validation(msg: impl Into<String>) -> Self {
        ControlPlaneError::Validation(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_wraps_without_losing_source() {
        let err = StorageError::not_found("job 1").context("loading processing job");
        assert!(err.to_string().contains("loading processing job"));
        assert!(err.to_string().contains("job 1"));
    }

    #[test]
    fn reason_codes_are_stable() {
        assert_eq!(
            PipelineError::from(DataValidationReason::EmptyActigraphy).reason_code(),
            "empty_actigraphy"
        );
        assert_eq!(
            PipelineError::from(DataValidationReason::ActigraphyTooLarge(30_000)).reason_code(),
            "data_too_large"
        );
    }

    #[test]
    fn storage_not_found_maps_to_control_plane_not_found() {
        let e: ControlPlaneError = StorageError::not_found("x").into();
        assert!(matches!(e, ControlPlaneError::NotFound(_)));
    }
}

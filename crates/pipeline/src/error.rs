//! `FlowMetrics` Pipeline Error System
//!
//! Error taxonomy for the ingestion → processing → storage pipeline.
//! Job-level failures stay isolated to their job; store-level failures degrade
//! the reported health score instead of stopping ingestion.

use thiserror::Error;

/// Pipeline result type for all operations
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Main error type for pipeline operations
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Ingestion rejected at the boundary (pipeline not running)
    #[error("Ingestion rejected: {reason}")]
    Ingestion {
        /// Rejection reason
        reason: String,
    },

    /// A processor step failed; the owning job is marked failed
    #[error("Processing failed in stage '{stage}': {reason}")]
    Processing {
        /// Processor stage that failed
        stage: String,
        /// Reason for failure
        reason: String,
    },

    /// A store write/query failed
    #[error("Storage operation failed: {operation} - {reason}")]
    Storage {
        /// Operation that failed
        operation: String,
        /// Reason for failure
        reason: String,
    },

    /// Cache operation failed
    #[error("Cache operation failed: {operation} - {reason}")]
    Cache {
        /// Operation that failed
        operation: String,
        /// Reason for failure
        reason: String,
    },

    /// Invalid configuration (fatal at construction/start)
    #[error("Configuration error: {message}")]
    Configuration {
        /// Error message
        message: String,
    },

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// `SQLite` errors
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Redis errors
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Generic internal error (use sparingly)
    #[error("Internal error: {message}")]
    Internal {
        /// Error message
        message: String,
    },
}

impl PipelineError {
    /// Create ingestion error
    pub fn ingestion(reason: impl Into<String>) -> Self {
        Self::Ingestion {
            reason: reason.into(),
        }
    }

    /// Ingestion rejection for a non-running pipeline
    #[must_use]
    pub fn not_running() -> Self {
        Self::Ingestion {
            reason: "pipeline is not running".to_string(),
        }
    }

    /// Create processing error
    pub fn processing(stage: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Processing {
            stage: stage.into(),
            reason: reason.into(),
        }
    }

    /// Create storage error
    pub fn storage(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Storage {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create cache error
    pub fn cache(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Cache {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create internal error (use sparingly)
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Check if the caller may usefully retry the operation
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Ingestion { .. } => true,
            Self::Processing { .. } => false,
            Self::Storage { .. } | Self::Cache { .. } => true,
            Self::Configuration { .. } => false,
            Self::Serialization(_) => false,
            Self::Io(_) => true,
            Self::Sqlite(_) => true,
            Self::Redis(_) => true,
            Self::Internal { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PipelineError::processing("analyzer", "empty series");
        assert_eq!(
            err.to_string(),
            "Processing failed in stage 'analyzer': empty series"
        );
    }

    #[test]
    fn test_not_running_is_retryable() {
        assert!(PipelineError::not_running().is_retryable());
        assert!(!PipelineError::configuration("bad backend").is_retryable());
    }
}

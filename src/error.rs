//! Error types for pipeline runs.
//!
//! Every stage failure aborts the whole run. The codes are stable so a
//! scheduler can branch on them without parsing messages.

use thiserror::Error;

use crate::transform::TransformError;
use crate::watermark::StorageError;
use crate::writer::UploadError;

/// Error codes for programmatic handling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// E001: Configuration missing or invalid
    E001Configuration,
    /// E002: Source or storage unreachable
    E002Connection,
    /// E003: Query rejected by the source database
    E003Query,
    /// E004: Unexpected schema shape during transform
    E004Transform,
    /// E005: Parquet encoding or scratch I/O failed
    E005Write,
    /// E006: Object storage write failed
    E006Upload,
    /// E007: Watermark store failed or rejected the commit
    E007Storage,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::E001Configuration => "E001",
            Self::E002Connection => "E002",
            Self::E003Query => "E003",
            Self::E004Transform => "E004",
            Self::E005Write => "E005",
            Self::E006Upload => "E006",
            Self::E007Storage => "E007",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that abort a pipeline run
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Required setting missing or invalid
    #[error("[{code}] Invalid configuration: {message}")]
    Configuration { code: &'static str, message: String },

    /// Source database or object storage unreachable
    #[error("[{code}] Connection to {target} failed: {message}")]
    Connection {
        code: &'static str,
        target: String,
        message: String,
    },

    /// Query rejected or watermark could not be bound
    #[error("[{code}] Query failed: {message}")]
    Query { code: &'static str, message: String },

    /// Transform could not handle the extracted schema
    #[error("[{code}] Transform failed: {source}")]
    Transform {
        code: &'static str,
        #[source]
        source: TransformError,
    },

    /// Arrow conversion, Parquet encoding or scratch I/O failed
    #[error("[{code}] Write operation failed: {message}")]
    Write { code: &'static str, message: String },

    /// Artifact could not be published
    #[error("[{code}] Upload failed: {source}")]
    Upload {
        code: &'static str,
        #[source]
        source: UploadError,
    },

    /// Watermark could not be read or committed
    #[error("[{code}] Watermark store error: {source}")]
    Storage {
        code: &'static str,
        #[source]
        source: StorageError,
    },
}

impl PipelineError {
    /// Create a configuration error with error code
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            code: ErrorCode::E001Configuration.as_str(),
            message: message.into(),
        }
    }

    /// Create a connection error with error code
    pub fn connection(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connection {
            code: ErrorCode::E002Connection.as_str(),
            target: target.into(),
            message: message.into(),
        }
    }

    /// Create a query error with error code
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            code: ErrorCode::E003Query.as_str(),
            message: message.into(),
        }
    }

    /// Create a write error with error code
    pub fn write(message: impl Into<String>) -> Self {
        Self::Write {
            code: ErrorCode::E005Write.as_str(),
            message: message.into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Configuration { .. } => ErrorCode::E001Configuration,
            Self::Connection { .. } => ErrorCode::E002Connection,
            Self::Query { .. } => ErrorCode::E003Query,
            Self::Transform { .. } => ErrorCode::E004Transform,
            Self::Write { .. } => ErrorCode::E005Write,
            Self::Upload { .. } => ErrorCode::E006Upload,
            Self::Storage { .. } => ErrorCode::E007Storage,
        }
    }
}

impl From<TransformError> for PipelineError {
    fn from(source: TransformError) -> Self {
        Self::Transform {
            code: ErrorCode::E004Transform.as_str(),
            source,
        }
    }
}

impl From<UploadError> for PipelineError {
    fn from(source: UploadError) -> Self {
        Self::Upload {
            code: ErrorCode::E006Upload.as_str(),
            source,
        }
    }
}

impl From<StorageError> for PipelineError {
    fn from(source: StorageError) -> Self {
        Self::Storage {
            code: ErrorCode::E007Storage.as_str(),
            source,
        }
    }
}

/// Result type alias for PipelineError
pub type Result<T> = std::result::Result<T, PipelineError>;

//! Error types for media-bridge
//!
//! This module provides comprehensive error handling for the library, including:
//! - Domain-specific error types (Registry, Job, Client)
//! - HTTP status code mapping for API integration
//! - Structured error responses with machine-readable error codes

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;
use utoipa::ToSchema;

use crate::types::{ArtifactToken, JobId, JobStatus};

/// Result type alias for media-bridge operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for media-bridge
///
/// This is the primary error type used throughout the library. Each variant includes
/// contextual information to help diagnose issues.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "storage_dir")
        key: Option<String>,
    },

    /// Invalid input supplied by a caller; never retried
    #[error("validation error: {0}")]
    Validation(String),

    /// Artifact registry error
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Conversion job error
    #[error("job error: {0}")]
    Job(#[from] JobError),

    /// Remote conversion backend error
    #[error("conversion client error: {0}")]
    Client(#[from] ClientError),

    /// Synchronous download pipeline failure (stream error, partial transfer)
    #[error("download failed: {0}")]
    DownloadFailed(String),

    /// Request rejected by the admission gate
    #[error("rate limited, retry after {retry_after_seconds}s")]
    RateLimited {
        /// Seconds the caller should wait before retrying
        retry_after_seconds: u64,
        /// Optional human-readable reason from the gate
        reason: Option<String>,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Requested resource does not exist (or has expired)
    #[error("not found: {0}")]
    NotFound(String),

    /// Shutdown in progress - not accepting new jobs
    #[error("shutdown in progress: not accepting new jobs")]
    ShuttingDown,

    /// Network error
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// API server error
    #[error("API server error: {0}")]
    ApiServerError(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Artifact registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Writing artifact bytes to durable storage failed; partial bytes were cleaned up
    #[error("failed to write artifact to {path}: {reason}")]
    StorageWrite {
        /// Destination path of the failed write
        path: PathBuf,
        /// The underlying I/O failure
        reason: String,
    },

    /// No live artifact exists for the given token (unknown or expired)
    #[error("artifact {token} not found")]
    NotFound {
        /// The token that did not resolve
        token: ArtifactToken,
    },
}

/// Conversion job errors
#[derive(Debug, Error)]
pub enum JobError {
    /// Job not found in the active set
    #[error("job {id} not found")]
    NotFound {
        /// The job ID that was not found
        id: JobId,
    },

    /// Job already reached a terminal state
    #[error("job {id} is already {status}")]
    AlreadyTerminal {
        /// The job ID that is already terminal
        id: JobId,
        /// The terminal status it holds
        status: JobStatus,
    },

    /// Remote submission was rejected before the job ever started processing
    #[error("submission failed: {reason}")]
    SubmissionFailed {
        /// The reason the remote backend rejected the submission
        reason: String,
    },

    /// Consecutive status polls failed until the retry ceiling was reached
    #[error("job {id} failed after {attempts} consecutive polling failures")]
    PollRetriesExhausted {
        /// The affected job ID
        id: JobId,
        /// Number of consecutive failed polls (equals the configured ceiling)
        attempts: u32,
    },

    /// Remote backend reported ready without a usable result reference
    #[error("job {id} reported ready without a result reference")]
    MissingDownloadRef {
        /// The affected job ID
        id: JobId,
    },

    /// Job was cancelled by the user
    #[error("job {id} was cancelled")]
    Cancelled {
        /// The cancelled job ID
        id: JobId,
    },
}

/// Errors returned by the remote conversion backend client
///
/// Every call against the backend fails with one of these, carrying an
/// HTTP-status-like code where one is available.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Backend returned a non-success HTTP status
    #[error("backend returned status {code}: {message}")]
    Status {
        /// HTTP status code from the backend
        code: u16,
        /// Message body or reason phrase
        message: String,
    },

    /// Request exceeded its bounded timeout
    #[error("request to backend timed out after {seconds}s")]
    Timeout {
        /// The timeout that was exceeded
        seconds: u64,
    },

    /// Connection-level failure (DNS, refused, reset, TLS)
    #[error("transport error: {0}")]
    Transport(String),

    /// Backend response could not be decoded
    #[error("invalid backend response: {0}")]
    InvalidResponse(String),
}

impl ClientError {
    /// Whether this failure is transient and worth counting against the
    /// poll retry ceiling rather than failing the job outright.
    ///
    /// Timeouts, transport faults and backend 5xx responses are transient;
    /// 4xx responses and undecodable bodies are not.
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::Timeout { .. } | ClientError::Transport(_) => true,
            ClientError::Status { code, .. } => *code >= 500,
            ClientError::InvalidResponse(_) => false,
        }
    }
}

/// API error response format
///
/// This structure is returned by API endpoints when an error occurs.
/// It follows a standard format with machine-readable error codes,
/// human-readable messages, and optional contextual details.
///
/// # Example JSON Response
///
/// ```json
/// {
///   "error": {
///     "code": "not_found",
///     "message": "artifact not found"
///   }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ApiError {
    /// The error details
    pub error: ErrorDetail,
}

/// Detailed error information for API responses
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorDetail {
    /// Machine-readable error code (e.g., "not_found", "validation_error")
    pub code: String,

    /// Human-readable error message, safe to show to end users
    pub message: String,

    /// Optional additional context about the error
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    /// Create a new API error with code and message
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail {
                code: code.into(),
                message: message.into(),
                details: None,
            },
        }
    }

    /// Create an API error with additional details
    pub fn with_details(
        code: impl Into<String>,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            error: ErrorDetail {
                code: code.into(),
                message: message.into(),
                details: Some(details),
            },
        }
    }

    /// Create a "not found" error
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::new("not_found", format!("{} not found", resource.into()))
    }

    /// Create an "internal server error"
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new("internal_error", message)
    }
}

/// Convert errors to HTTP status codes for API responses
///
/// This trait maps domain errors to appropriate HTTP status codes.
pub trait ToHttpStatus {
    /// Get the HTTP status code for this error
    fn status_code(&self) -> u16;

    /// Get the machine-readable error code
    fn error_code(&self) -> &str;
}

impl ToHttpStatus for Error {
    fn status_code(&self) -> u16 {
        match self {
            // 400 Bad Request - client error (invalid input)
            Error::Config { .. } => 400,
            Error::Validation(_) => 400,

            // 404 Not Found
            Error::NotFound(_) => 404,
            Error::Registry(RegistryError::NotFound { .. }) => 404,
            Error::Job(JobError::NotFound { .. }) => 404,

            // 409 Conflict - job already settled
            Error::Job(JobError::AlreadyTerminal { .. }) => 409,

            // 422 Unprocessable Entity - semantic job failures
            Error::Job(_) => 422,
            Error::DownloadFailed(_) => 422,

            // 429 Too Many Requests
            Error::RateLimited { .. } => 429,

            // 500 Internal Server Error - server-side issues
            Error::Registry(RegistryError::StorageWrite { .. }) => 500,
            Error::Io(_) => 500,
            Error::Serialization(_) => 500,
            Error::ApiServerError(_) => 500,
            Error::Other(_) => 500,

            // 502 Bad Gateway - external service errors
            Error::Client(_) => 502,
            Error::Network(_) => 502,

            // 503 Service Unavailable
            Error::ShuttingDown => 503,
        }
    }

    fn error_code(&self) -> &str {
        match self {
            Error::Config { .. } => "config_error",
            Error::Validation(_) => "validation_error",
            Error::Registry(e) => match e {
                RegistryError::StorageWrite { .. } => "storage_error",
                RegistryError::NotFound { .. } => "not_found",
            },
            Error::Job(e) => match e {
                JobError::NotFound { .. } => "job_not_found",
                JobError::AlreadyTerminal { .. } => "job_already_terminal",
                JobError::SubmissionFailed { .. } => "submission_failed",
                JobError::PollRetriesExhausted { .. } => "poll_retries_exhausted",
                JobError::MissingDownloadRef { .. } => "missing_download_ref",
                JobError::Cancelled { .. } => "job_cancelled",
            },
            Error::Client(_) => "backend_error",
            Error::DownloadFailed(_) => "download_failed",
            Error::RateLimited { .. } => "rate_limited",
            Error::Io(_) => "io_error",
            Error::NotFound(_) => "not_found",
            Error::ShuttingDown => "shutting_down",
            Error::Network(_) => "network_error",
            Error::Serialization(_) => "serialization_error",
            Error::ApiServerError(_) => "api_server_error",
            Error::Other(_) => "internal_error",
        }
    }
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        let code = error.error_code().to_string();
        let details = match &error {
            Error::Job(JobError::NotFound { id }) => Some(serde_json::json!({ "job_id": id })),
            Error::Job(JobError::AlreadyTerminal { id, status }) => Some(serde_json::json!({
                "job_id": id,
                "status": status,
            })),
            Error::RateLimited {
                retry_after_seconds,
                ..
            } => Some(serde_json::json!({ "retry_after_seconds": retry_after_seconds })),
            _ => None,
        };

        // Registry and I/O failures must not leak paths or internals to clients;
        // the specific cause is already logged server-side.
        let message = match &error {
            Error::Registry(RegistryError::StorageWrite { .. }) | Error::Io(_) => {
                "internal storage error".to_string()
            }
            other => other.to_string(),
        };

        ApiError {
            error: ErrorDetail {
                code,
                message,
                details,
            },
        }
    }
}

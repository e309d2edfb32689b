use crate::cache::CacheError;
use crate::config::ValidationError;
use http::StatusCode;
use thiserror::Error;

/// Result type alias for ingest operations
pub type Result<T, E = IngestError> = std::result::Result<T, E>;

/// Errors that can occur while accepting an event
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Invalid project id: {0}")]
    InvalidProjectId(String),

    #[error("Unknown project or public key for project {0}")]
    ProjectNotFound(u64),

    #[error("Failed to read request body: {0}")]
    RequestBodyError(String),

    #[error("Request body exceeds {0} bytes")]
    PayloadTooLarge(usize),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(#[from] ValidationError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl IngestError {
    /// Status returned to the client. Invalid projects and unreadable bodies
    /// are reported as not found, matching what Sentry clients expect.
    pub fn status_code(&self) -> StatusCode {
        match self {
            IngestError::InvalidProjectId(_)
            | IngestError::ProjectNotFound(_)
            | IngestError::RequestBodyError(_) => StatusCode::NOT_FOUND,
            IngestError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

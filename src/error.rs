//! Classified errors returned by the service layer.
//!
//! Services return [`ServiceError`] so the HTTP layer can pick a status code
//! without inspecting message text. Plumbing failures (store, sinks) arrive
//! as `anyhow::Error` and land in [`ServiceError::Internal`].

use thiserror::Error;

use crate::face::ExtractError;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Unavailable(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ServiceError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        ServiceError::BadRequest(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        ServiceError::NotFound(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        ServiceError::Conflict(message.into())
    }

    /// Machine-readable code used in JSON error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::BadRequest(_) => "bad_request",
            ServiceError::NotFound(_) => "not_found",
            ServiceError::Conflict(_) => "conflict",
            ServiceError::Unavailable(_) => "unavailable",
            ServiceError::Internal(_) => "internal",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            ServiceError::BadRequest(_) => 400,
            ServiceError::NotFound(_) => 404,
            ServiceError::Conflict(_) => 409,
            ServiceError::Unavailable(_) => 503,
            ServiceError::Internal(_) => 500,
        }
    }
}

impl From<ExtractError> for ServiceError {
    fn from(err: ExtractError) -> Self {
        match err {
            ExtractError::NoFace(_) => ServiceError::BadRequest(err.to_string()),
            ExtractError::Backend(_) => ServiceError::Unavailable(err.to_string()),
        }
    }
}

pub type ServiceResult<T> = std::result::Result<T, ServiceError>;

//! Caller-facing error taxonomy.
//!
//! Module errors are classified into a [`ServiceError`] at the service
//! boundary; each variant maps to one HTTP status. Transfer failures never
//! reach this type: they are recorded on the entry instead.

use thiserror::Error;

use crate::catalog::CatalogError;
use crate::source::SourceError;
use crate::transfer::TransferError;

/// Errors returned by service operations.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Malformed name, unknown field or oversized body.
    #[error("{0}")]
    Validation(String),

    /// Missing or wrong token or admin key.
    #[error("access denied")]
    Unauthorized,

    /// Unknown source, catalog entry or local entry.
    #[error("{0}")]
    NotFound(String),

    /// The entry is not in a state that allows the operation.
    #[error("{0}")]
    Conflict(String),

    /// A source catalog has not been built yet.
    #[error("{0}")]
    NotReady(String),

    /// Unexpected filesystem, process or internal failure.
    #[error("{0}")]
    Internal(String),
}

impl ServiceError {
    /// HTTP status code for this error.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::Unauthorized => 403,
            Self::NotFound(_) => 404,
            Self::Conflict(_) => 405,
            Self::NotReady(_) => 503,
            Self::Internal(_) => 500,
        }
    }

    /// Shorthand for [`ServiceError::Validation`].
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Shorthand for [`ServiceError::NotFound`].
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    /// Shorthand for [`ServiceError::Conflict`].
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }
}

impl From<CatalogError> for ServiceError {
    fn from(error: CatalogError) -> Self {
        match error {
            CatalogError::InvalidName { .. } => Self::Validation(error.to_string()),
            CatalogError::NotFound { .. } => Self::NotFound(error.to_string()),
            CatalogError::Io { .. } | CatalogError::Json { .. } => Self::Internal(error.to_string()),
        }
    }
}

impl From<SourceError> for ServiceError {
    fn from(error: SourceError) -> Self {
        match error {
            SourceError::RefreshInProgress { .. } => Self::Conflict(error.to_string()),
            _ => Self::Internal(error.to_string()),
        }
    }
}

impl From<TransferError> for ServiceError {
    fn from(error: TransferError) -> Self {
        match error {
            TransferError::UnsafePath { .. }
            | TransferError::LimitExceeded { .. }
            | TransferError::Upload { .. } => {
                Self::Validation(error.to_string())
            }
            _ => Self::Internal(error.to_string()),
        }
    }
}

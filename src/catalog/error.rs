//! Error types for the local catalog.

use std::path::PathBuf;

use thiserror::Error;

/// Errors from catalog persistence and entry lifecycle operations.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// A user, source or id component is not a safe path segment.
    #[error("invalid {kind} name: {value:?}")]
    InvalidName {
        /// Which component was rejected.
        kind: &'static str,
        /// The rejected value.
        value: String,
    },

    /// No entry exists for the key.
    #[error("no catalog entry for {key}")]
    NotFound {
        /// The `user/source/id` key.
        key: String,
    },

    /// File system error on a catalog document or data directory.
    #[error("IO error at {path}: {source}")]
    Io {
        /// The path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// A catalog document could not be parsed or serialized.
    #[error("invalid catalog document {path}: {source}")]
    Json {
        /// The document path.
        path: PathBuf,
        /// The underlying serde error.
        #[source]
        source: serde_json::Error,
    },
}

impl CatalogError {
    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates a JSON error.
    pub fn json(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Self::Json {
            path: path.into(),
            source,
        }
    }
}

//! Error types for source connectors.

use std::path::PathBuf;

use thiserror::Error;

use crate::transfer::TransferError;

/// Errors from catalog refreshes and metadata lookups.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The remote could not be reached or answered with an error.
    #[error(transparent)]
    Transfer(#[from] TransferError),

    /// A remote document did not have the expected shape.
    #[error("could not parse {url}: {message}")]
    Parse {
        /// Where the document came from.
        url: String,
        /// What was wrong with it.
        message: String,
    },

    /// File system error on a persisted catalog or cache file.
    #[error("IO error at {path}: {source}")]
    Io {
        /// The path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// A persisted catalog or cache file could not be parsed or serialized.
    #[error("invalid JSON in {path}: {source}")]
    Json {
        /// The file path.
        path: PathBuf,
        /// The underlying serde error.
        #[source]
        source: serde_json::Error,
    },

    /// A refresh of this connector is already running.
    #[error("catalog refresh already in progress for {source_name}")]
    RefreshInProgress {
        /// Connector name.
        source_name: String,
    },
}

impl SourceError {
    /// Creates a parse error.
    pub fn parse(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Parse {
            url: url.into(),
            message: message.into(),
        }
    }

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

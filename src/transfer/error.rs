//! Error types for the transfer pipeline.
//!
//! Transfer failures are never returned to API callers; they are logged and
//! recorded on the catalog entry as `failed`. The variants therefore carry
//! enough context (URL, path, exit code, stderr) to diagnose from the log alone.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while moving bytes onto local disk.
#[derive(Debug, Error)]
pub enum TransferError {
    /// The shared HTTP client could not be constructed.
    #[error("failed to build HTTP client: {0}")]
    ClientBuild(#[source] reqwest::Error),

    /// Network-level error (DNS resolution, connection refused, TLS errors, etc.)
    #[error("network error fetching {url}: {source}")]
    Network {
        /// The URL that failed.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// Connect or read timed out.
    #[error("timeout fetching {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// The redirect limit was exceeded.
    #[error("too many redirects fetching {url}")]
    TooManyRedirects {
        /// The original URL.
        url: String,
    },

    /// Non-success HTTP response.
    #[error("HTTP {status} fetching {url}")]
    HttpStatus {
        /// The URL that returned an error status.
        url: String,
        /// The HTTP status code.
        status: u16,
    },

    /// The provided URL is malformed or invalid.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },

    /// File system error while writing, reading or deleting.
    #[error("IO error at {path}: {source}")]
    Io {
        /// The path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Received file size does not match the declared content length.
    #[error(
        "integrity check failed for {path}: expected {expected_bytes} bytes, got {actual_bytes}"
    )]
    Integrity {
        /// File that failed verification.
        path: PathBuf,
        /// Expected size in bytes.
        expected_bytes: u64,
        /// Actual size in bytes.
        actual_bytes: u64,
    },

    /// The job's cancellation token fired.
    #[error("transfer cancelled")]
    Cancelled,

    /// An external tool could not be started.
    #[error("failed to start {program}: {source}")]
    Spawn {
        /// Program name or path.
        program: String,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// An external tool exited unsuccessfully.
    #[error("{program} exited with {}: {stderr}", describe_exit(.code.as_ref()))]
    Process {
        /// Program name or path.
        program: String,
        /// Exit code, `None` when killed by a signal.
        code: Option<i32>,
        /// Trimmed standard error output.
        stderr: String,
    },

    /// An uploaded file name was absolute, contained `..`, or was empty.
    #[error("unsafe upload path: {name:?}")]
    UnsafePath {
        /// The offending name as sent by the client.
        name: String,
    },

    /// Cumulative upload size exceeded the configured limit.
    #[error("upload exceeds limit of {limit} bytes")]
    LimitExceeded {
        /// The configured per-entry limit.
        limit: u64,
    },

    /// The upload body could not be read.
    #[error("malformed upload: {message}")]
    Upload {
        /// Description from the multipart parser.
        message: String,
    },
}

fn describe_exit(code: Option<&i32>) -> String {
    code.map_or_else(|| "signal".to_string(), |c| format!("status {c}"))
}

impl TransferError {
    /// Classifies a reqwest error into timeout, redirect or generic network failure.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        let url = url.into();
        if source.is_timeout() {
            Self::Timeout { url }
        } else if source.is_redirect() {
            Self::TooManyRedirects { url }
        } else {
            Self::Network { url, source }
        }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates an integrity mismatch error.
    pub fn integrity(path: impl Into<PathBuf>, expected_bytes: u64, actual_bytes: u64) -> Self {
        Self::Integrity {
            path: path.into(),
            expected_bytes,
            actual_bytes,
        }
    }

    /// Creates a spawn error.
    pub fn spawn(program: impl Into<String>, source: std::io::Error) -> Self {
        Self::Spawn {
            program: program.into(),
            source,
        }
    }

    /// Returns true if this error was caused by cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

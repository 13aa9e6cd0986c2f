//! Error types for episode-dl
//!
//! Every failure in the pipeline is an [`Error`]. Callers that only need to
//! decide *what to do* about a failure (retry, report, resume later) use
//! [`Error::kind`], which folds the variants into the small [`ErrorKind`]
//! taxonomy carried by [`EpisodeResult`](crate::types::EpisodeResult).

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for episode-dl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for episode-dl
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "max_concurrent_episodes")
        key: Option<String>,
    },

    /// Invalid input handed to the scheduler (duplicate ids, empty url list, ...)
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Network error from the HTTP client
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Server answered with a status that is not usable
    #[error("HTTP {status} from {url}")]
    Http {
        /// HTTP status code
        status: u16,
        /// URL that produced the status
        url: String,
    },

    /// No response (or no chunk) within the per-attempt timeout
    #[error("timed out after {timeout_ms} ms waiting for {url}")]
    Timeout {
        /// URL being fetched
        url: String,
        /// Timeout that elapsed
        timeout_ms: u64,
    },

    /// The body ended before the advertised length was reached
    #[error("incomplete body from {url}: got {received} of {expected} bytes")]
    IncompleteBody {
        /// URL being fetched
        url: String,
        /// Bytes expected on disk when the body ended
        expected: u64,
        /// Bytes actually on disk
        received: u64,
    },

    /// Server ignored or mangled a range request
    #[error("range mismatch from {url}: requested offset {requested}, server sent {served}")]
    RangeMismatch {
        /// URL being fetched
        url: String,
        /// Offset that was requested
        requested: u64,
        /// Offset the server reported in Content-Range
        served: u64,
    },

    /// Downloaded content did not match the expected checksum or ETag
    #[error("integrity check failed for {path}: expected {expected}, got {actual}")]
    Integrity {
        /// File that failed verification (already deleted)
        path: PathBuf,
        /// Expected digest or ETag
        expected: String,
        /// Actual digest or ETag
        actual: String,
    },

    /// Resource does not exist (or is refused) on the server
    #[error("resource not available at {url} (HTTP {status})")]
    NotFound {
        /// URL that was not found
        url: String,
        /// HTTP status code (404, 410, 403, ...)
        status: u16,
    },

    /// The assembly step (mux / danmaku conversion) failed
    #[error("assembly error: {0}")]
    Assembly(#[from] AssemblyError),

    /// Cooperative cancellation; on-disk state is left resumable
    #[error("cancelled")]
    Cancelled,

    /// Local filesystem failure while writing stream data or outputs
    #[error("disk error at {path}: {source}")]
    Disk {
        /// Path being written
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Insufficient disk space
    #[error("insufficient disk space: need {required} bytes, have {available} bytes")]
    InsufficientSpace {
        /// Number of bytes required for the episode
        required: u64,
        /// Number of bytes currently available on disk
        available: u64,
    },

    /// I/O error not tied to a specific stream file
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation not supported (missing binary, not implemented, etc.)
    #[error("not supported: {0}")]
    NotSupported(String),
}

/// Errors produced by the assembly step
#[derive(Debug, Error)]
pub enum AssemblyError {
    /// External tool could not be started
    #[error("failed to execute {tool}: {reason}")]
    Spawn {
        /// Tool name (e.g. "ffmpeg")
        tool: String,
        /// The reason spawning failed
        reason: String,
    },

    /// External tool exited unsuccessfully
    #[error("{tool} exited with {status}: {stderr}")]
    ExitStatus {
        /// Tool name
        tool: String,
        /// Exit status description
        status: String,
        /// Tail of the tool's stderr
        stderr: String,
    },

    /// External tool exceeded its timeout and was killed
    #[error("{tool} timed out after {timeout_secs} s")]
    TimedOut {
        /// Tool name
        tool: String,
        /// Timeout that elapsed
        timeout_secs: u64,
    },

    /// Tool reported success but produced no output file
    #[error("{tool} reported success but {path} is missing")]
    MissingOutput {
        /// Tool name
        tool: String,
        /// Expected output path
        path: PathBuf,
    },

    /// Nothing to assemble
    #[error("no inputs to assemble for {path}")]
    NoInputs {
        /// Intended output path
        path: PathBuf,
    },
}

/// Error taxonomy surfaced in episode results
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Connection reset, timeout, 5xx, incomplete body; retried
    TransientNetwork,
    /// Checksum/ETag mismatch; not retried, file discarded
    Integrity,
    /// 404 and other refusals; not retried
    NotFound,
    /// External assembly step failed; intermediates preserved
    Assembly,
    /// Cooperative stop; resumable
    Cancelled,
    /// Local disk failure; fatal for the episode
    Disk,
    /// Invalid configuration or input
    Config,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::TransientNetwork => "transient network error",
            ErrorKind::Integrity => "integrity error",
            ErrorKind::NotFound => "not found",
            ErrorKind::Assembly => "assembly error",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Disk => "disk error",
            ErrorKind::Config => "configuration error",
        };
        f.write_str(name)
    }
}

impl Error {
    /// Build a [`Error::Disk`] for `path`
    pub fn disk(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Disk {
            path: path.into(),
            source,
        }
    }

    /// Build a configuration error pointing at `key`
    pub fn config(key: &str, message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            key: Some(key.to_string()),
        }
    }

    /// Classify an HTTP status into the matching error
    pub fn from_status(status: u16, url: &str) -> Self {
        match status {
            404 | 410 | 401 | 403 | 451 => Error::NotFound {
                url: url.to_string(),
                status,
            },
            _ => Error::Http {
                status,
                url: url.to_string(),
            },
        }
    }

    /// Map this error onto the result taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Network(_)
            | Error::Timeout { .. }
            | Error::IncompleteBody { .. }
            | Error::RangeMismatch { .. } => ErrorKind::TransientNetwork,
            // Only server-side and throttling statuses reach Http; the rest are NotFound
            Error::Http { status, .. } => {
                if *status >= 500 || *status == 408 || *status == 429 {
                    ErrorKind::TransientNetwork
                } else {
                    ErrorKind::NotFound
                }
            }
            Error::Integrity { .. } => ErrorKind::Integrity,
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::Assembly(_) => ErrorKind::Assembly,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Disk { .. } | Error::InsufficientSpace { .. } => ErrorKind::Disk,
            Error::Io(e) => match e.kind() {
                std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::NotConnected
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::UnexpectedEof => ErrorKind::TransientNetwork,
                _ => ErrorKind::Disk,
            },
            Error::Config { .. } | Error::InvalidInput(_) | Error::NotSupported(_) => {
                ErrorKind::Config
            }
        }
    }

    /// Whether this failure must abort the whole run, not just one episode
    ///
    /// Only an exhausted filesystem qualifies: every other episode would hit
    /// the same wall.
    pub fn is_run_fatal(&self) -> bool {
        match self {
            Error::Disk { source, .. } | Error::Io(source) => {
                source.kind() == std::io::ErrorKind::StorageFull
            }
            _ => false,
        }
    }
}

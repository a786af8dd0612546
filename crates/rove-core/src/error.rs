//! Error types for rove-core.
//!
//! Configuration problems are fatal at startup. Script and tail errors are
//! scoped to a single slot and never halt the supervisor tick for others.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error for rove-core operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Script(#[from] ScriptError),

    #[error(transparent)]
    Tail(#[from] TailError),

    #[error(transparent)]
    Lock(#[from] crate::lock::LockError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("background task failed: {0}")]
    Task(String),
}

/// Configuration failures. Every variant aborts startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {0}: {1}")]
    ReadFailed(String, String),

    #[error("failed to parse config: {0}")]
    ParseFailed(String),

    #[error("failed to serialize config: {0}")]
    SerializeFailed(String),

    #[error("configuration failure in section {section} for value {field}: {message}")]
    InvalidRegex {
        section: String,
        field: String,
        message: String,
    },

    #[error("configuration failure in section {section}: {field} is required")]
    MissingScript { section: String, field: String },

    #[error(
        "configuration failure in section {section} for value {field}: {path} does not exist under any environment"
    )]
    ScriptNotFound {
        section: String,
        field: String,
        path: String,
    },

    #[error("configuration failure in section {section} for value {field}: {reason}")]
    InvalidValue {
        section: String,
        field: String,
        reason: String,
    },

    #[error("environment scan folder {} does not exist", .0.display())]
    ScanBaseMissing(PathBuf),
}

/// Failures running an operator-supplied script.
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("{configured} was resolved to {resolved} but it doesn't exist")]
    NotFound { configured: String, resolved: String },

    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },

    #[error("{program} has written errors:\n{}", .lines.join("\n"))]
    Stderr { program: String, lines: Vec<String> },

    #[error("{program} exited with {code}")]
    ExitCode { program: String, code: i32 },

    #[error("{program} was terminated by a signal")]
    Terminated { program: String },
}

/// Failures opening or reading a tailed log file.
#[derive(Debug, Error)]
pub enum TailError {
    #[error("log file {} does not exist", .0.display())]
    Missing(PathBuf),

    #[error("failed to open log file {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

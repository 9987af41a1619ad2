//! Error taxonomy shared by the command engine, disks, VMs and the manager.
//!
//! Process execution never fails silently: every failure mode a caller may
//! want to branch on gets its own variant. Planner outcomes are deliberately
//! *not* here — "this host does not meet the spec" is an expected result,
//! returned as a value, not an error.

use std::path::PathBuf;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A binary, working directory, script or VM artifact is missing.
    #[error("not found: {0}")]
    NotFound(String),

    /// The call required elevation and the current process is not elevated.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The deadline elapsed before the process exited and both streams
    /// reached end-of-stream.
    #[error("command `{command}` timed out after {timeout_secs}s")]
    Timeout { command: String, timeout_secs: u64 },

    /// The process could not be spawned or waited on.
    #[error("failed to execute `{command}`: {source}")]
    ExecutionFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// A caller-supplied output/error/exit-code handler returned an error.
    /// Kept distinct so it is never mistaken for a genuine command failure.
    #[error("output handler failed for `{command}`: {source}")]
    HandlerFailed {
        command: String,
        #[source]
        source: anyhow::Error,
    },

    /// Default policy: non-zero exit code or non-empty stderr with no
    /// handler supplied.
    #[error("`{command}` reported an error (exit {exit_code}): {stderr}")]
    CommandReportedError {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    /// The operation is not available on this provider.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// A disk or VM with this identity already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// A VM spec failed validation before any side effect happened.
    #[error("invalid spec: {0}")]
    InvalidSpec(String),

    /// A VM start/stop sequence failed; the instance has been marked Failed.
    #[error("vm `{name}` {operation} failed: {message}")]
    VmOperationFailed {
        name: String,
        operation: &'static str,
        message: String,
    },

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Attach a path to an io::Error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io { path: path.into(), source }
    }
}

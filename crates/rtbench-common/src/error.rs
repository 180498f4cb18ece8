//! Unified error types for the rtbench workspace.
//!
//! Library crates return these structured errors; only the driver binaries
//! decide that an error is fatal and terminate the process.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum BenchError {
    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A configuration value is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// A required resource was not found.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Type of the missing resource.
        kind: &'static str,
        /// Identifier of the missing resource.
        id: String,
    },

    /// A resource with the same identifier is already live.
    #[error("{kind} already exists: {id}")]
    AlreadyExists {
        /// Type of the conflicting resource.
        kind: &'static str,
        /// Identifier of the conflicting resource.
        id: String,
    },

    /// A system call failed.
    #[error("{call} failed: {source}")]
    Syscall {
        /// Name of the failing call.
        call: &'static str,
        /// Underlying OS error.
        source: std::io::Error,
    },

    /// The supervisor control socket could not be reached.
    #[error("cannot connect to supervisor at {address}: {message}")]
    Transport {
        /// Socket path that was dialled.
        address: PathBuf,
        /// Transport-level failure description.
        message: String,
    },

    /// A supervisor request was rejected or failed.
    #[error("supervisor {operation} failed: {message}")]
    Supervisor {
        /// Operation that failed (e.g. "create task").
        operation: &'static str,
        /// Status message returned by the supervisor.
        message: String,
    },

    /// A CNI plugin invocation failed.
    #[error("CNI network {network}: {message}")]
    Cni {
        /// Network the failing plugin belongs to.
        network: String,
        /// Plugin error description.
        message: String,
    },

    /// Content could not be parsed.
    #[error("cannot parse {what}: {message}")]
    Parse {
        /// What was being parsed.
        what: &'static str,
        /// Why parsing failed.
        message: String,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl BenchError {
    /// Builds a [`BenchError::Supervisor`] from any displayable status.
    pub fn supervisor(operation: &'static str, status: impl std::fmt::Display) -> Self {
        Self::Supervisor {
            operation,
            message: status.to_string(),
        }
    }

    /// Builds a [`BenchError::Io`] for the given path.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, BenchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supervisor_error_names_operation() {
        let err = BenchError::supervisor("start task", "task not found");
        assert_eq!(err.to_string(), "supervisor start task failed: task not found");
    }

    #[test]
    fn io_error_includes_path() {
        let err = BenchError::io(
            "/proc/meminfo",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert!(err.to_string().starts_with("I/O error at /proc/meminfo"));
    }
}

//! Error types for command execution

use std::time::Duration;
use thiserror::Error;

/// Unified error type for command execution
#[derive(Error, Debug)]
pub enum Error {
    /// Failed to spawn a process
    #[error("failed to spawn process: {reason}")]
    SpawnFailed {
        /// The reason for the spawn failure
        reason: String,
    },

    /// Command not found
    #[error("command not found: {command}")]
    CommandNotFound {
        /// The command that was not found
        command: String,
    },

    /// The command did not finish within its time bound
    #[error("command timed out after {}s: {command}", after.as_secs())]
    TimedOut {
        /// The command line that timed out
        command: String,
        /// The bound that was exceeded
        after: Duration,
    },

    /// I/O error
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a spawn failed error
    pub fn spawn_failed(reason: impl Into<String>) -> Self {
        Self::SpawnFailed {
            reason: reason.into(),
        }
    }

    /// Map a spawn-time I/O error, distinguishing a missing binary
    pub(crate) fn from_spawn(program: &str, err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            Self::CommandNotFound {
                command: program.to_string(),
            }
        } else {
            Self::spawn_failed(format!("{}: {}", program, err))
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

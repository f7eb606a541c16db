//! Error types for remote execution.

use std::fmt;

use thiserror::Error;

/// Step of the remote execution protocol that failed.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ExecutionPhase {
    /// Opening, verifying, or authenticating the session.
    Connect,
    /// Reading the local workload or copying it to the instance.
    Transfer,
    /// Starting the remote command.
    Execute,
    /// Collecting output and the exit status.
    ReadOutput,
}

impl ExecutionPhase {
    /// Short lowercase label used in messages and log fields.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Transfer => "transfer",
            Self::Execute => "execute",
            Self::ReadOutput => "read output",
        }
    }
}

impl fmt::Display for ExecutionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of a remote execution, tagged with the phase that raised it.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("remote {phase} failed: {message}")]
pub struct RemoteExecutionError {
    /// Phase that failed.
    pub phase: ExecutionPhase,
    /// Description of the underlying cause.
    pub message: String,
}

impl RemoteExecutionError {
    /// Builds an error for `phase` from any displayable cause.
    #[must_use]
    pub fn new(phase: ExecutionPhase, cause: impl fmt::Display) -> Self {
        Self {
            phase,
            message: cause.to_string(),
        }
    }
}

/// Failure of [`super::RemoteExecutor::execute_until_cancelled`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ExecuteError {
    /// A protocol step failed.
    #[error(transparent)]
    Remote(#[from] RemoteExecutionError),
    /// Cancellation fired; the session was interrupted and closed.
    #[error("remote execution was cancelled")]
    Cancelled,
}

/// Error reported by a [`super::RemoteSession`] or
/// [`super::SessionConnector`] implementation.
///
/// The executor attaches the [`ExecutionPhase`] when it converts this into a
/// [`RemoteExecutionError`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("{message}")]
pub struct SessionError {
    /// Description of the failure.
    pub message: String,
}

impl SessionError {
    /// Creates a session error from a message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub(crate) fn in_phase(self, phase: ExecutionPhase) -> RemoteExecutionError {
        RemoteExecutionError {
            phase,
            message: self.message,
        }
    }
}

//! Error types for operations.

use poolsync_engine::EngineError;
use poolsync_protocol::{Fault, ProtocolError};
use thiserror::Error;

/// Result type for operations.
pub type OperationResult<T> = Result<T, OperationError>;

/// The terminal error stored on a failed operation.
pub type OperationFailure = OperationError;

/// Why an operation did not succeed.
///
/// The error stored on a failed operation is always the one that caused the
/// failure; errors raised while rolling back are logged, never stored.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OperationError {
    /// A capability check failed before anything was sent to the server.
    #[error("capability check failed: {0}")]
    CapabilityCheckFailed(String),

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// A call failed.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// A server-side task finished with an error.
    #[error("task failed: {0}")]
    TaskFailed(Fault),

    /// The operation could not be planned from the store.
    #[error("cannot plan operation: {0}")]
    Planning(String),

    /// Something expected did not happen in time.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The server returned something unexpected.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The operation body panicked.
    #[error("operation panicked: {0}")]
    Panicked(String),
}

impl OperationError {
    /// Returns the server fault behind this error, if any.
    pub fn fault(&self) -> Option<&Fault> {
        match self {
            OperationError::TaskFailed(fault) => Some(fault),
            OperationError::Engine(error) => error.fault(),
            _ => None,
        }
    }

    /// Returns true for cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, OperationError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_is_reachable_through_engine_errors() {
        let err = OperationError::from(EngineError::Server(Fault::code(Fault::HANDLE_INVALID)));
        assert_eq!(err.fault().map(|f| f.code.as_str()), Some(Fault::HANDLE_INVALID));
        assert!(OperationError::TaskFailed(Fault::code("X")).fault().is_some());
        assert!(OperationError::Cancelled.fault().is_none());
    }

    #[test]
    fn display() {
        assert_eq!(OperationError::Cancelled.to_string(), "operation cancelled");
        assert_eq!(
            OperationError::Engine(EngineError::NotConnected).to_string(),
            "not connected to server"
        );
    }
}

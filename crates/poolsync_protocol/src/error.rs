//! Error types for protocol parsing.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while interpreting raw wire values.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    /// A single event could not be interpreted.
    #[error("malformed event: {0}")]
    MalformedEvent(String),

    /// An object record could not be interpreted.
    #[error("malformed {object_type} record: {reason}")]
    MalformedRecord {
        /// Class of the record.
        object_type: String,
        /// What was wrong.
        reason: String,
    },

    /// A task record could not be interpreted.
    #[error("malformed task: {0}")]
    MalformedTask(String),

    /// A response did not have the expected shape.
    #[error("unexpected response shape: expected {expected}")]
    UnexpectedShape {
        /// Description of the expected shape.
        expected: &'static str,
    },
}

impl ProtocolError {
    /// Creates a malformed event error.
    pub fn malformed_event(reason: impl Into<String>) -> Self {
        Self::MalformedEvent(reason.into())
    }

    /// Returns true if this error concerns one event only.
    ///
    /// Such errors are skipped by the synchronizer instead of ending the poll loop.
    pub fn is_event_local(&self) -> bool {
        matches!(
            self,
            ProtocolError::MalformedEvent(_) | ProtocolError::MalformedRecord { .. }
        )
    }
}

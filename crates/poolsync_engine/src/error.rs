//! Error types for the engine.

use poolsync_protocol::{Fault, FaultKind, ProtocolError};
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur while talking to a pool.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Network or TLS failure below the RPC layer.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether reconnecting can help.
        retryable: bool,
    },

    /// The credentials were rejected.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The server no longer recognizes the session.
    #[error("session expired")]
    SessionExpired,

    /// The contacted host is not the coordinator.
    #[error("host is not the pool coordinator; coordinator is {address}")]
    Redirect {
        /// Address of the coordinator.
        address: String,
    },

    /// A redirect was followed and the new host redirected again.
    #[error("redirected again to {address} after following a coordinator redirect")]
    RedirectLoop {
        /// Address of the second redirect.
        address: String,
    },

    /// The server rejected a call.
    #[error("server fault: {0}")]
    Server(Fault),

    /// The peer certificate was rejected.
    #[error("certificate rejected: {0}")]
    CertificateRejected(String),

    /// The event stream or session was lost during steady-state operation.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// No session is established.
    #[error("not connected to server")]
    NotConnected,

    /// The synchronizer has no usable token and must full-load.
    #[error("full reload required: {0}")]
    ReloadRequired(String),

    /// The server returned something that could not be interpreted.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl EngineError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Maps a server fault onto the taxonomy.
    pub fn from_fault(fault: Fault) -> Self {
        match fault.kind() {
            FaultKind::SessionInvalid => EngineError::SessionExpired,
            FaultKind::AuthenticationFailed => EngineError::Authentication(fault.to_string()),
            FaultKind::NotCoordinator => match fault.redirect_address() {
                Some(address) => EngineError::Redirect {
                    address: address.to_string(),
                },
                None => EngineError::Server(fault),
            },
            _ => EngineError::Server(fault),
        }
    }

    /// Returns true if reconnecting and trying again can help.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Transport { retryable, .. } => *retryable,
            EngineError::ConnectionLost(_) | EngineError::SessionExpired => true,
            EngineError::Server(fault) => fault.kind() == FaultKind::HostUnreachable,
            _ => false,
        }
    }

    /// Returns true if the session must be rebuilt from scratch.
    pub fn requires_reconnect(&self) -> bool {
        matches!(
            self,
            EngineError::SessionExpired
                | EngineError::Transport { .. }
                | EngineError::ConnectionLost(_)
                | EngineError::ReloadRequired(_)
        )
    }

    /// Returns true for errors no reconnect attempt can fix.
    pub fn is_fatal_for_connect(&self) -> bool {
        matches!(
            self,
            EngineError::Authentication(_)
                | EngineError::CertificateRejected(_)
                | EngineError::RedirectLoop { .. }
                | EngineError::Transport {
                    retryable: false,
                    ..
                }
        )
    }

    /// Returns the server fault, if this is one.
    pub fn fault(&self) -> Option<&Fault> {
        match self {
            EngineError::Server(fault) => Some(fault),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_mapping() {
        assert_eq!(
            EngineError::from_fault(Fault::code(Fault::SESSION_INVALID)),
            EngineError::SessionExpired
        );
        assert!(matches!(
            EngineError::from_fault(Fault::code(Fault::SESSION_AUTHENTICATION_FAILED)),
            EngineError::Authentication(_)
        ));
        assert_eq!(
            EngineError::from_fault(Fault::new(Fault::HOST_IS_SLAVE, ["10.0.0.9"])),
            EngineError::Redirect {
                address: "10.0.0.9".into()
            }
        );
        assert!(matches!(
            EngineError::from_fault(Fault::code(Fault::HOST_IS_SLAVE)),
            EngineError::Server(_)
        ));
        assert!(EngineError::from_fault(Fault::code(Fault::HANDLE_INVALID))
            .fault()
            .is_some());
    }

    #[test]
    fn retryable_errors() {
        assert!(EngineError::transport_retryable("connection reset").is_retryable());
        assert!(!EngineError::transport_fatal("tls handshake failed").is_retryable());
        assert!(EngineError::Server(Fault::code(Fault::HOST_OFFLINE)).is_retryable());
        assert!(!EngineError::Server(Fault::code(Fault::HANDLE_INVALID)).is_retryable());
        assert!(!EngineError::Authentication("bad".into()).is_retryable());
    }

    #[test]
    fn session_expiry_means_reconnect() {
        assert!(EngineError::SessionExpired.requires_reconnect());
        assert!(!EngineError::Server(Fault::code("X")).requires_reconnect());
    }

    #[test]
    fn fatal_connect_errors() {
        assert!(EngineError::Authentication("bad".into()).is_fatal_for_connect());
        assert!(EngineError::RedirectLoop {
            address: "a".into()
        }
        .is_fatal_for_connect());
        assert!(!EngineError::transport_retryable("reset").is_fatal_for_connect());
    }

    #[test]
    fn error_display() {
        assert_eq!(EngineError::NotConnected.to_string(), "not connected to server");
        let err = EngineError::Redirect {
            address: "10.0.0.2".into(),
        };
        assert!(err.to_string().contains("10.0.0.2"));
    }
}

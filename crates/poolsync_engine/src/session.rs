//! Login sessions.

use crate::config::Credentials;
use crate::error::{EngineError, EngineResult};
use crate::transport::{RpcChannel, RpcRequest, RpcResponse};
use parking_lot::RwLock;
use poolsync_protocol::{ProtocolError, Value};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No session.
    LoggedOut,
    /// Login in flight.
    LoggingIn,
    /// Session identifier held.
    LoggedIn,
}

/// A login session against one endpoint.
///
/// Knows nothing about objects. The identifier it holds is attached to every
/// call by [`crate::Transport`].
pub struct Session {
    channel: Arc<dyn RpcChannel>,
    state: RwLock<SessionState>,
    id: RwLock<Option<String>>,
    username: RwLock<Option<String>>,
}

impl Session {
    /// Creates a logged-out session over a channel.
    pub fn new(channel: Arc<dyn RpcChannel>) -> Self {
        Self {
            channel,
            state: RwLock::new(SessionState::LoggedOut),
            id: RwLock::new(None),
            username: RwLock::new(None),
        }
    }

    /// Logs in.
    ///
    /// Fails with [`EngineError::Authentication`] on bad credentials and with
    /// [`EngineError::Redirect`] when the endpoint is not the coordinator.
    pub async fn login(&self, credentials: &Credentials) -> EngineResult<()> {
        *self.state.write() = SessionState::LoggingIn;
        let request = RpcRequest::new(
            "session.login_with_password",
            vec![
                Value::from(credentials.username()),
                Value::from(credentials.secret()),
            ],
        );

        let outcome = match self.channel.invoke(request).await {
            Ok(RpcResponse::Success(value)) => value
                .as_text()
                .map(str::to_string)
                .ok_or(EngineError::Protocol(ProtocolError::UnexpectedShape {
                    expected: "session identifier",
                })),
            Ok(RpcResponse::Fault(fault)) => Err(EngineError::from_fault(fault)),
            Ok(RpcResponse::TimedOut) => Err(EngineError::transport_retryable("login timed out")),
            Err(failure) => Err(failure.into()),
        };

        match outcome {
            Ok(id) => {
                *self.id.write() = Some(id);
                *self.username.write() = Some(credentials.username().to_string());
                *self.state.write() = SessionState::LoggedIn;
                info!(address = self.address(), user = credentials.username(), "logged in");
                Ok(())
            }
            Err(error) => {
                *self.state.write() = SessionState::LoggedOut;
                debug!(address = self.address(), %error, "login failed");
                Err(error)
            }
        }
    }

    /// Logs out. Always succeeds locally, whatever the server says.
    pub async fn logout(&self) {
        let id = self.id.write().take();
        *self.state.write() = SessionState::LoggedOut;
        let Some(id) = id else {
            return;
        };
        let request = RpcRequest::new("session.logout", vec![Value::from(id)]);
        match self.channel.invoke(request).await {
            Ok(RpcResponse::Success(_)) => debug!(address = self.address(), "logged out"),
            other => debug!(address = self.address(), ?other, "logout not acknowledged"),
        }
    }

    /// Drops the session identifier without telling the server.
    pub fn invalidate(&self) {
        self.id.write().take();
        *self.state.write() = SessionState::LoggedOut;
    }

    /// Returns the session identifier.
    pub fn id(&self) -> Option<String> {
        self.id.read().clone()
    }

    /// Returns the user that logged in.
    pub fn username(&self) -> Option<String> {
        self.username.read().clone()
    }

    /// Returns the lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    /// Returns true while a session identifier is held.
    pub fn is_logged_in(&self) -> bool {
        self.state() == SessionState::LoggedIn
    }

    /// Address of the endpoint.
    pub fn address(&self) -> &str {
        self.channel.address()
    }

    pub(crate) fn channel(&self) -> &Arc<dyn RpcChannel> {
        &self.channel
    }

    #[cfg(test)]
    pub(crate) fn set_logged_in_for_test(&self, id: &str) {
        *self.id.write() = Some(id.to_string());
        *self.state.write() = SessionState::LoggedIn;
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("address", &self.address())
            .field("state", &self.state())
            .finish()
    }
}

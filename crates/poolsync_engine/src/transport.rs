//! Transport layer: the wire seam plus session-carrying calls.
//!
//! [`RpcChannel`] is what a real RPC client (or the simulated pool) implements.
//! [`Transport`] sits on top of a logged-in [`Session`] and turns raw
//! responses into results, faults into [`EngineError`]s and long-poll expiry
//! into [`LongPoll::TimedOut`].

use crate::certificate::Certificate;
use crate::error::{EngineError, EngineResult};
use crate::session::Session;
use async_trait::async_trait;
use poolsync_protocol::{Fault, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// One remote call.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcRequest {
    /// Method name, e.g. `host.get_all_records`.
    pub method: String,
    /// Positional parameters.
    pub params: Vec<Value>,
    /// For long polls, how long the server may hold the call.
    pub timeout: Option<Duration>,
}

impl RpcRequest {
    /// Creates a request.
    pub fn new(method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            method: method.into(),
            params,
            timeout: None,
        }
    }

    /// Marks this as a long poll the server may hold for `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Raw outcome of a call that reached the server.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcResponse {
    /// The call succeeded.
    Success(Value),
    /// The server rejected the call.
    Fault(Fault),
    /// A long poll elapsed with nothing new.
    TimedOut,
}

/// Category of failure below the RPC layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The peer closed or reset the connection.
    ConnectionReset,
    /// TLS negotiation failed.
    Tls,
    /// Any other I/O error.
    Io,
}

/// A call that never reached the server, or whose reply was lost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportFailure {
    /// Category.
    pub kind: FailureKind,
    /// Detail.
    pub message: String,
}

impl TransportFailure {
    /// Creates a failure.
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for TransportFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl From<TransportFailure> for EngineError {
    fn from(failure: TransportFailure) -> Self {
        EngineError::Transport {
            retryable: failure.kind != FailureKind::Tls,
            message: failure.to_string(),
        }
    }
}

/// Result of a long poll.
#[derive(Debug, Clone, PartialEq)]
pub enum LongPoll<T> {
    /// New data arrived.
    Ready(T),
    /// Nothing new before the timeout. Not an error: poll again with the same cursor.
    TimedOut,
}

/// A connection to one server endpoint.
///
/// Implementations must be safe to call concurrently: the poll loop holds a
/// long poll open while operations issue ordinary calls.
#[async_trait]
pub trait RpcChannel: Send + Sync {
    /// Issues one call.
    async fn invoke(&self, request: RpcRequest) -> Result<RpcResponse, TransportFailure>;

    /// Address of the endpoint.
    fn address(&self) -> &str;

    /// Certificate presented by the peer, if the channel is encrypted.
    fn peer_certificate(&self) -> Option<Certificate> {
        None
    }
}

/// Opens channels to endpoints.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Opens a channel to `address`.
    async fn open(&self, address: &str) -> EngineResult<Arc<dyn RpcChannel>>;
}

/// Issues calls on behalf of a logged-in session.
#[derive(Clone)]
pub struct Transport {
    session: Arc<Session>,
    grace: Duration,
}

impl Transport {
    /// Creates a transport over `session`. Long polls are abandoned client-side
    /// `grace` after their server timeout.
    pub fn new(session: Arc<Session>, grace: Duration) -> Self {
        Self { session, grace }
    }

    /// Returns the session.
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    fn request(&self, method: &str, params: Vec<Value>) -> EngineResult<RpcRequest> {
        let id = self.session.id().ok_or(EngineError::NotConnected)?;
        let mut full = Vec::with_capacity(params.len() + 1);
        full.push(Value::from(id));
        full.extend(params);
        Ok(RpcRequest::new(method, full))
    }

    fn map_fault(&self, method: &str, fault: Fault) -> EngineError {
        let error = EngineError::from_fault(fault);
        if error == EngineError::SessionExpired {
            debug!(method, "server rejected session");
            self.session.invalidate();
        }
        error
    }

    /// Issues a call and waits for its result.
    pub async fn call(&self, method: &str, params: Vec<Value>) -> EngineResult<Value> {
        let request = self.request(method, params)?;
        trace!(method, "call");
        match self.session.channel().invoke(request).await? {
            RpcResponse::Success(value) => Ok(value),
            RpcResponse::Fault(fault) => Err(self.map_fault(method, fault)),
            RpcResponse::TimedOut => Err(EngineError::transport_retryable(format!(
                "{method} timed out"
            ))),
        }
    }

    /// Issues a call the server may hold for up to `timeout`.
    pub async fn long_poll(
        &self,
        method: &str,
        params: Vec<Value>,
        timeout: Duration,
    ) -> EngineResult<LongPoll<Value>> {
        let request = self.request(method, params)?.with_timeout(timeout);
        let channel = self.session.channel();
        let guarded = tokio::time::timeout(timeout + self.grace, channel.invoke(request)).await;
        match guarded {
            Err(_) => {
                debug!(method, "long poll abandoned after grace period");
                Ok(LongPoll::TimedOut)
            }
            Ok(response) => match response? {
                RpcResponse::Success(value) => Ok(LongPoll::Ready(value)),
                RpcResponse::TimedOut => Ok(LongPoll::TimedOut),
                RpcResponse::Fault(fault) => Err(self.map_fault(method, fault)),
            },
        }
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("address", &self.session.address())
            .field("grace", &self.grace)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credentials;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Replays canned responses and records requests.
    struct Scripted {
        responses: Mutex<VecDeque<Result<RpcResponse, TransportFailure>>>,
        seen: Mutex<Vec<RpcRequest>>,
        hang: bool,
    }

    impl Scripted {
        fn new(responses: Vec<Result<RpcResponse, TransportFailure>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                seen: Mutex::new(Vec::new()),
                hang: false,
            })
        }
    }

    #[async_trait]
    impl RpcChannel for Scripted {
        async fn invoke(&self, request: RpcRequest) -> Result<RpcResponse, TransportFailure> {
            self.seen.lock().push(request);
            if self.hang {
                std::future::pending::<()>().await;
            }
            self.responses
                .lock()
                .pop_front()
                .unwrap_or(Ok(RpcResponse::TimedOut))
        }

        fn address(&self) -> &str {
            "scripted"
        }
    }

    async fn logged_in(channel: Arc<Scripted>) -> Transport {
        let session = Arc::new(Session::new(channel));
        session.login(&Credentials::new("root", "pw")).await.unwrap();
        Transport::new(session, Duration::from_millis(10))
    }

    #[tokio::test]
    async fn call_prepends_session_id() {
        let channel = Scripted::new(vec![
            Ok(RpcResponse::Success(Value::from("OpaqueRef:session"))),
            Ok(RpcResponse::Success(Value::Integer(7))),
        ]);
        let transport = logged_in(channel.clone()).await;

        let value = transport.call("host.get_all_records", vec![]).await.unwrap();
        assert_eq!(value, Value::Integer(7));

        let seen = channel.seen.lock();
        assert_eq!(seen[1].method, "host.get_all_records");
        assert_eq!(seen[1].params, vec![Value::from("OpaqueRef:session")]);
    }

    #[tokio::test]
    async fn session_fault_invalidates_session() {
        let channel = Scripted::new(vec![
            Ok(RpcResponse::Success(Value::from("s1"))),
            Ok(RpcResponse::Fault(Fault::code(Fault::SESSION_INVALID))),
        ]);
        let transport = logged_in(channel).await;

        let err = transport.call("pool.get_all_records", vec![]).await.unwrap_err();
        assert_eq!(err, EngineError::SessionExpired);
        assert!(!transport.session().is_logged_in());
        assert_eq!(
            transport.call("pool.get_all_records", vec![]).await.unwrap_err(),
            EngineError::NotConnected
        );
    }

    #[tokio::test]
    async fn timed_out_long_poll_is_not_an_error() {
        let channel = Scripted::new(vec![
            Ok(RpcResponse::Success(Value::from("s1"))),
            Ok(RpcResponse::TimedOut),
        ]);
        let transport = logged_in(channel).await;
        let result = transport
            .long_poll("event.from", vec![], Duration::from_millis(5))
            .await
            .unwrap();
        assert_eq!(result, LongPoll::TimedOut);
    }

    #[tokio::test]
    async fn hung_long_poll_is_abandoned() {
        let channel = Arc::new(Scripted {
            responses: Mutex::new(VecDeque::new()),
            seen: Mutex::new(Vec::new()),
            hang: true,
        });
        let session = Arc::new(Session::new(channel));
        session.set_logged_in_for_test("s1");
        let transport = Transport::new(session, Duration::from_millis(10));
        let result = transport
            .long_poll("event.from", vec![], Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(result, LongPoll::TimedOut);
    }

    #[test]
    fn tls_failures_are_not_retryable() {
        let tls: EngineError = TransportFailure::new(FailureKind::Tls, "bad handshake").into();
        assert!(!tls.is_retryable());
        let reset: EngineError = TransportFailure::new(FailureKind::ConnectionReset, "eof").into();
        assert!(reset.is_retryable());
    }
}

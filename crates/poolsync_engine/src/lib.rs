//! # poolsync engine
//!
//! Keeps an `ObjectStore` current against one pool and owns the connection
//! that makes that possible.
//!
//! This crate provides:
//! - The wire seam (`RpcChannel`, `Connector`) that a real RPC client implements
//! - `Session`: login, logout and the session identifier
//! - `Transport`: session-carrying calls and long polls
//! - `EventSynchronizer`: full load, then an ordered event poll loop
//! - `Connection`: composes the above, follows coordinator redirects,
//!   tracks pool membership and reconnects after the event stream is lost
//!
//! ## Data flow
//!
//! 1. `Connection::connect` opens a channel, validates the peer certificate
//!    and logs in (following one coordinator redirect)
//! 2. The synchronizer loads every tracked class, then asks for a token
//! 3. A background task long-polls for events and applies them in id order
//! 4. Readers use the store synchronously; nothing they do touches the network
//!
//! ## Key Invariants
//!
//! - The token is requested only after the snapshot is loaded
//! - A token is never reused across a reconnect
//! - A malformed event is skipped, never fatal
//! - Loss of the event stream is always reported through `SyncNotice::ConnectionLost`

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

mod certificate;
mod config;
mod connection;
mod error;
mod membership;
mod session;
mod synchronizer;
mod transport;

pub use certificate::{Certificate, CertificatePolicy, CertificateValidator, PolicyValidator, Verdict};
pub use config::{ConnectionConfig, Credentials, RetryConfig};
pub use connection::{Connection, ConnectionState};
pub use error::{EngineError, EngineResult};
pub use membership::{MembershipTracker, PoolMembership};
pub use session::{Session, SessionState};
pub use synchronizer::{apply_event, EventSynchronizer, PollStep, SyncExit, SyncNotice, SyncStats};
pub use transport::{
    Connector, FailureKind, LongPoll, RpcChannel, RpcRequest, RpcResponse, Transport,
    TransportFailure,
};

//! # poolsync testkit
//!
//! Test utilities for poolsync.
//!
//! This crate provides:
//! - `SimulatedPool`, an in-process server speaking the wire contract:
//!   object tables, an event log with long-poll wake-up, sessions,
//!   coordinator redirects, stepped server-side tasks and fault injection
//! - `SimulatedConnector`/`SimulatedChannel`, loopback implementations of
//!   the engine's wire seam
//! - Fixtures: ready-made pools built from JSON, credentials, test configs
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use poolsync_testkit::prelude::*;
//!
//! let pool = three_host_pool();
//! let connection = Arc::new(Connection::new(fast_config(&host_address(1)), pool.connector()));
//! connection.connect(credentials()).await?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod channel;
pub mod fixtures;
pub mod generators;
mod pool;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::channel::{SimulatedChannel, SimulatedConnector};
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::pool::SimulatedPool;
}

pub use channel::{SimulatedChannel, SimulatedConnector};
pub use fixtures::*;
pub use generators::*;
pub use pool::SimulatedPool;

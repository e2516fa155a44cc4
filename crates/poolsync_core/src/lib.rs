//! # poolsync core
//!
//! The in-memory mirror of a pool's server objects.
//!
//! This crate provides:
//! - `ObjectStore`, the table of records keyed by (type, reference)
//! - Advisory per-object locks used by operations to claim objects
//! - A staleness flag set while the event stream is down
//! - Typed views (`Host`, `Pool`, `Pif`, `Bond`, `Network`) derived on read
//!
//! The store performs no network I/O. It is owned explicitly and shared by
//! `Arc`; nothing in poolsync reaches it through global state.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod store;
pub mod views;

pub use store::{ObjectKey, ObjectStore, StoreSummary};

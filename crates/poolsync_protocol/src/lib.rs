//! # poolsync protocol
//!
//! Data model shared by every poolsync layer.
//!
//! This crate provides:
//! - `Value`, the dynamic structured value carried by the wire
//! - `ObjectRef` and `ObjectType`, the key of every mirrored server object
//! - `ObjectRecord`, a typed bag of fields
//! - `Event` and `EventBatch`, the incremental change stream
//! - `SyncToken`, the cursor into that stream
//! - `Fault` and `TaskRecord`, server-side failures and tasks
//!
//! This is a pure data crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod event;
mod fault;
mod record;
mod reference;
mod task;
mod token;
mod value;

pub use error::{ProtocolError, ProtocolResult};
pub use event::{Event, EventBatch, EventOperation};
pub use fault::{Fault, FaultKind};
pub use record::ObjectRecord;
pub use reference::{ObjectRef, ObjectType, NULL_REF};
pub use task::{TaskRecord, TaskStatus};
pub use token::SyncToken;
pub use value::Value;

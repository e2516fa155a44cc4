//! # poolsync_ops
//!
//! Long-running, cancellable, multi-step operations against a pool.
//!
//! An [`Operation`] is submitted to the [`OperationEngine`], which runs it on
//! the tokio runtime and hands back an [`OperationHandle`]. Operations talk
//! to the pool through an [`OperationContext`]: synchronous calls,
//! asynchronous calls whose server task is polled with its progress mapped
//! onto a [`ProgressRange`], advisory object locks, and waiting for objects to
//! show up in the store.
//!
//! Multi-step work is expressed as [`Step`]s run by [`run_steps`], which
//! undoes completed steps newest first when a later one fails.
//!
//! ```rust,ignore
//! let engine = OperationEngine::new(connection.clone(), EngineConfig::default());
//! let request = BondRequest::new("bond0", ["eth1", "eth2"]);
//! let op = CreateBondOperation::new(request, &connection.store())?;
//! let done = engine.submit(Box::new(op)).wait().await;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod api;
mod async_call;
mod bond;
mod capability;
mod composite;
mod config;
mod context;
mod engine;
mod error;
mod operation;
mod progress;
#[cfg(test)]
mod testing;

pub use api::PoolApi;
pub use async_call::AsyncCallOperation;
pub use bond::{
    plan_bond, BondMode, BondPlan, BondRequest, CreateBondOperation, DestroyBondOperation,
    HostBondPlan,
};
pub use capability::{CapabilityCheck, ObjectExists, ObjectsNotLocked};
pub use composite::{roll_back, run_steps, Compensation, Completed, CompositeOperation, Step};
pub use config::EngineConfig;
pub use context::OperationContext;
pub use engine::OperationEngine;
pub use error::{OperationError, OperationFailure, OperationResult};
pub use operation::{Operation, OperationHandle, OperationSnapshot, OperationState};
pub use progress::ProgressRange;

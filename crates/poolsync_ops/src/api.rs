//! The seam between operations and a live connection.

use async_trait::async_trait;
use poolsync_core::ObjectStore;
use poolsync_engine::{Connection, EngineResult};
use poolsync_protocol::Value;
use std::sync::Arc;

/// What an operation needs from a connection: calls and the object store.
#[async_trait]
pub trait PoolApi: Send + Sync {
    /// Issues a call on the current session.
    async fn call(&self, method: &str, params: Vec<Value>) -> EngineResult<Value>;

    /// Returns the store the connection keeps current.
    fn store(&self) -> Arc<ObjectStore>;
}

#[async_trait]
impl PoolApi for Connection {
    async fn call(&self, method: &str, params: Vec<Value>) -> EngineResult<Value> {
        Connection::call(self, method, params).await
    }

    fn store(&self) -> Arc<ObjectStore> {
        Connection::store(self)
    }
}

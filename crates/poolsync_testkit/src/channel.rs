//! Loopback channels into a [`SimulatedPool`].

use crate::pool::SimulatedPool;
use async_trait::async_trait;
use poolsync_engine::{
    Certificate, Connector, EngineError, EngineResult, RpcChannel, RpcRequest, RpcResponse,
    TransportFailure,
};
use std::sync::Arc;

/// A channel to one address of a simulated pool.
pub struct SimulatedChannel {
    pool: SimulatedPool,
    address: String,
    certificate: Option<Certificate>,
}

impl SimulatedChannel {
    /// Creates a channel to `address`.
    pub fn new(pool: SimulatedPool, address: impl Into<String>) -> Self {
        let certificate = pool.certificate();
        Self {
            pool,
            address: address.into(),
            certificate,
        }
    }
}

#[async_trait]
impl RpcChannel for SimulatedChannel {
    async fn invoke(&self, request: RpcRequest) -> Result<RpcResponse, TransportFailure> {
        self.pool.handle(&self.address, request).await
    }

    fn address(&self) -> &str {
        &self.address
    }

    fn peer_certificate(&self) -> Option<Certificate> {
        self.certificate.clone()
    }
}

/// Opens [`SimulatedChannel`]s; refuses unknown or offline addresses.
#[derive(Clone)]
pub struct SimulatedConnector {
    pool: SimulatedPool,
}

impl SimulatedConnector {
    /// Creates a connector.
    pub fn new(pool: SimulatedPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Connector for SimulatedConnector {
    async fn open(&self, address: &str) -> EngineResult<Arc<dyn RpcChannel>> {
        if !self.pool.is_known(address) {
            return Err(EngineError::transport_retryable(format!("no route to {address}")));
        }
        if !self.pool.is_reachable(address) {
            return Err(EngineError::transport_retryable(format!(
                "connection to {address} refused"
            )));
        }
        Ok(Arc::new(SimulatedChannel::new(self.pool.clone(), address)))
    }
}

impl SimulatedPool {
    /// Returns a connector into this pool.
    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(SimulatedConnector::new(self.clone()))
    }
}

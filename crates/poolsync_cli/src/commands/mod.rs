//! CLI command implementations.

pub mod bond;
pub mod watch;

use poolsync_core::StoreSummary;
use poolsync_engine::{Connection, ConnectionState};
use poolsync_testkit::{credentials, fast_config, host_address, SimulatedPool};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Store and connection state, for printing.
#[derive(Debug, Serialize)]
pub struct StoreReport {
    /// Address connected to.
    pub address: String,
    /// Whether a session is live.
    pub connected: bool,
    /// Pool member addresses.
    pub members: Vec<String>,
    /// Whether the store is stale.
    pub stale: bool,
    /// Records per type.
    pub counts: BTreeMap<String, usize>,
    /// Objects held busy by operations.
    pub locked: usize,
}

impl StoreReport {
    /// Builds a report.
    pub fn new(state: ConnectionState, summary: StoreSummary) -> Self {
        Self {
            address: state.address,
            connected: state.connected,
            members: state.members,
            stale: summary.stale,
            counts: summary.counts,
            locked: summary.locked,
        }
    }

    /// Prints the report as text.
    pub fn print_text(&self) {
        println!("Connection");
        println!("  Address:   {}", self.address);
        println!("  Connected: {}", self.connected);
        println!("  Members:   {}", self.members.join(", "));
        println!("  Stale:     {}", self.stale);
        println!("Objects");
        for (class, count) in &self.counts {
            println!("  {class:<10} {count}");
        }
        if self.locked > 0 {
            println!("  ({} locked)", self.locked);
        }
    }
}

/// Connects to host 1 of `pool` with the fixture credentials.
pub async fn connect(pool: &SimulatedPool) -> Result<Arc<Connection>, Box<dyn std::error::Error>> {
    let connection = Arc::new(Connection::new(
        fast_config(&host_address(1)),
        pool.connector(),
    ));
    connection.connect(credentials()).await?;
    Ok(connection)
}

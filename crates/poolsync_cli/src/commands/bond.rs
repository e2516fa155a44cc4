//! Bond command implementation.

use super::{connect, StoreReport};
use poolsync_ops::{
    BondMode, BondRequest, CreateBondOperation, EngineConfig, OperationEngine, OperationState,
    PoolApi,
};
use poolsync_testkit::{host_ref, pool_with_hosts};
use std::sync::Arc;
use std::time::Duration;

/// Runs the bond command.
pub async fn run(
    hosts: usize,
    devices: Vec<String>,
    fail_on: Option<usize>,
    mode: &str,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let mode = match mode {
        "balance-slb" => BondMode::BalanceSlb,
        "active-backup" => BondMode::ActiveBackup,
        "lacp" => BondMode::Lacp,
        other => return Err(format!("unknown bond mode {other}").into()),
    };
    let pool = pool_with_hosts(hosts.max(1), false);
    if let Some(host) = fail_on {
        pool.fail_bonds_on_host(host_ref(host));
    }
    let connection = connect(&pool).await?;

    let request = BondRequest::new("bond", devices).with_mode(mode);
    let operation = CreateBondOperation::new(request, &connection.store())?;
    for host in &operation.plan().hosts {
        println!(
            "plan: {} bonds {} member(s){}",
            host.host_name,
            host.members.len(),
            if host.coordinator { " (coordinator)" } else { "" }
        );
    }

    let engine = OperationEngine::new(
        Arc::clone(&connection) as Arc<dyn PoolApi>,
        EngineConfig::default().with_task_poll_interval(Duration::from_millis(50)),
    );
    let handle = engine.submit(Box::new(operation));
    let mut ticker = tokio::time::interval(Duration::from_millis(100));
    while !handle.state().is_terminal() {
        ticker.tick().await;
        let snapshot = handle.snapshot();
        println!("{:>3}% {}", snapshot.whole_percent(), snapshot.state);
    }
    let done = handle.wait().await;

    let report = StoreReport::new(connection.state(), connection.store().summary());
    connection.disconnect().await;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        report.print_text();
    }

    match done.state {
        OperationState::Succeeded => {
            println!("{}: succeeded", done.title);
            Ok(())
        }
        state => {
            let reason = done.error.map(|e| e.to_string()).unwrap_or_default();
            Err(format!("{}: {state} {reason}", done.title).into())
        }
    }
}

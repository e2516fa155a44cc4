//! Watch command implementation.

use super::{connect, StoreReport};
use poolsync_engine::SyncNotice;
use poolsync_protocol::{ObjectRecord, ObjectRef, ObjectType};
use poolsync_testkit::{host_ref, pool_with_hosts};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{sleep, timeout};

/// Runs the watch command.
pub async fn run(hosts: usize, events: usize, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let pool = pool_with_hosts(hosts.max(1), false);
    let connection = connect(&pool).await?;
    let mut notices = connection.subscribe();

    let writer = pool.clone();
    let generator = tokio::spawn(async move {
        for i in 0..events {
            let vm = ObjectRef::new(format!("OpaqueRef:vm-{i}"));
            writer.put_object(
                vm,
                ObjectRecord::new(ObjectType::Vm)
                    .field("name_label", format!("vm{i}"))
                    .field("resident_on", host_ref(i % hosts.max(1) + 1))
                    .field("power_state", "Running"),
            );
            sleep(Duration::from_millis(20)).await;
        }
    });

    let mut applied = 0;
    while applied < events {
        match timeout(Duration::from_secs(5), notices.recv()).await {
            Ok(Ok(notice)) => {
                if format != "json" {
                    print_notice(&notice);
                }
                if matches!(notice, SyncNotice::Applied { .. }) {
                    applied += 1;
                }
            }
            Ok(Err(RecvError::Lagged(missed))) => println!("... {missed} notices dropped"),
            Ok(Err(RecvError::Closed)) | Err(_) => break,
        }
    }
    generator.await?;

    let report = StoreReport::new(connection.state(), connection.store().summary());
    connection.disconnect().await;
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&report)?),
        _ => report.print_text(),
    }
    Ok(())
}

fn print_notice(notice: &SyncNotice) {
    match notice {
        SyncNotice::Reloaded { objects, token } => println!("reloaded {objects} objects at {token}"),
        SyncNotice::Applied {
            id,
            class,
            reference,
            operation,
        } => println!("#{id:<5} {operation:?} {class} {reference}"),
        SyncNotice::Skipped { reason } => println!("skipped: {reason}"),
        SyncNotice::ConnectionLost { reason } => println!("connection lost: {reason}"),
        SyncNotice::Reconnected { address } => println!("reconnected to {address}"),
    }
}

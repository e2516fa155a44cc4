//! Ready-made pools and configurations.

use crate::pool::SimulatedPool;
use poolsync_engine::{ConnectionConfig, Credentials, RetryConfig};
use poolsync_protocol::{ObjectRecord, ObjectRef, ObjectType, Value};
use serde_json::json;
use std::time::Duration;

/// User name every fixture pool accepts.
pub const USERNAME: &str = "root";
/// Password every fixture pool accepts.
pub const PASSWORD: &str = "xenroot";
/// Devices every fixture host has.
pub const DEVICES: [&str; 3] = ["eth0", "eth1", "eth2"];

/// Returns the fixture credentials.
pub fn credentials() -> Credentials {
    Credentials::new(USERNAME, PASSWORD)
}

/// Address of host `i` (1-based).
pub fn host_address(i: usize) -> String {
    format!("10.0.0.{i}")
}

/// Reference of host `i`.
pub fn host_ref(i: usize) -> ObjectRef {
    ObjectRef::new(format!("OpaqueRef:host-{i}"))
}

/// Reference of the PIF for `device` on host `i`.
pub fn pif_ref(i: usize, device: &str) -> ObjectRef {
    ObjectRef::new(format!("OpaqueRef:pif-{i}-{device}"))
}

/// Reference of the network `device` is attached to.
pub fn network_ref(device: &str) -> ObjectRef {
    ObjectRef::new(format!("OpaqueRef:net-{device}"))
}

/// Reference of the pool object.
pub fn pool_ref() -> ObjectRef {
    ObjectRef::new("OpaqueRef:pool")
}

/// Converts JSON into a wire value. Strings that look like references become refs.
pub fn from_json(json: &serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Integer(i),
            None => Value::Float(n.as_f64().unwrap_or_default()),
        },
        serde_json::Value::String(s) => match ObjectRef::parse(s) {
            Some(r) if s.starts_with("OpaqueRef:") => Value::Ref(r),
            _ => Value::Text(s.clone()),
        },
        serde_json::Value::Array(items) => Value::Array(items.iter().map(from_json).collect()),
        serde_json::Value::Object(map) => {
            Value::Map(map.iter().map(|(k, v)| (k.clone(), from_json(v))).collect())
        }
    }
}

/// Builds a record of `class` from a JSON object.
pub fn record_from_json(class: ObjectType, json: &serde_json::Value) -> ObjectRecord {
    match from_json(json) {
        Value::Map(fields) => ObjectRecord::with_fields(class, fields),
        _ => ObjectRecord::new(class),
    }
}

/// Builds a pool of `count` hosts with host 1 as coordinator.
///
/// Every host has PIFs `eth0` (management), `eth1` and `eth2`, each on the
/// shared network for that device. Tasks finish after two polls.
pub fn pool_with_hosts(count: usize, ha_enabled: bool) -> SimulatedPool {
    let pool = SimulatedPool::new(USERNAME, PASSWORD);
    pool.set_coordinator_address(&host_address(1));
    pool.set_task_steps(2);

    pool.put_object(
        pool_ref(),
        record_from_json(
            ObjectType::Pool,
            &json!({
                "name_label": "simulated pool",
                "master": host_ref(1).as_str(),
                "ha_enabled": ha_enabled,
            }),
        ),
    );

    for device in DEVICES {
        let pifs: Vec<String> = (1..=count).map(|i| pif_ref(i, device).to_string()).collect();
        pool.put_object(
            network_ref(device),
            record_from_json(
                ObjectType::Network,
                &json!({ "name_label": format!("Network {device}"), "PIFs": pifs }),
            ),
        );
    }

    for i in 1..=count {
        pool.put_object(
            host_ref(i),
            record_from_json(
                ObjectType::Host,
                &json!({
                    "name_label": format!("host{i}"),
                    "address": host_address(i),
                    "enabled": true,
                }),
            ),
        );
        for (n, device) in DEVICES.iter().enumerate() {
            pool.put_object(
                pif_ref(i, device),
                record_from_json(
                    ObjectType::Pif,
                    &json!({
                        "device": device,
                        "host": host_ref(i).as_str(),
                        "network": network_ref(device).as_str(),
                        "MAC": format!("02:00:00:00:{i:02x}:{n:02x}"),
                        "management": n == 0,
                        "physical": true,
                        "bond_slave_of": poolsync_protocol::NULL_REF,
                        "bond_master_of": [],
                    }),
                ),
            );
        }
    }
    pool
}

/// A three-host pool without high availability.
pub fn three_host_pool() -> SimulatedPool {
    pool_with_hosts(3, false)
}

/// A connection configuration with short timeouts suited to tests.
pub fn fast_config(address: &str) -> ConnectionConfig {
    ConnectionConfig::new(address)
        .with_poll_timeout(Duration::from_millis(200))
        .with_poll_grace(Duration::from_millis(200))
        .with_retry(
            RetryConfig::new(3)
                .with_initial_delay(Duration::from_millis(20))
                .with_max_delay(Duration::from_millis(100))
                .with_jitter(false),
        )
}

//! Typed views over stored records.
//!
//! Views are small owned structs built from a record at read time. They are
//! never cached: every call re-reads the store, so a view can be stale only
//! for as long as the caller holds it.

use crate::store::ObjectStore;
use poolsync_protocol::{ObjectRecord, ObjectRef, ObjectType};

/// A physical host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Host {
    /// Host reference.
    pub reference: ObjectRef,
    /// Display name.
    pub name: String,
    /// Management address.
    pub address: String,
    /// Whether the host accepts new work.
    pub enabled: bool,
}

impl Host {
    /// Builds the view; `None` if the record is not a host.
    pub fn from_record(reference: ObjectRef, record: &ObjectRecord) -> Option<Self> {
        (record.object_type() == &ObjectType::Host).then(|| Self {
            reference,
            name: record.text("name_label").unwrap_or_default().to_string(),
            address: record.text("address").unwrap_or_default().to_string(),
            enabled: record.flag("enabled"),
        })
    }
}

/// The pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pool {
    /// Pool reference.
    pub reference: ObjectRef,
    /// Display name.
    pub name: String,
    /// The coordinator host.
    pub coordinator: Option<ObjectRef>,
    /// Whether high availability is on, which lets the coordinator move.
    pub ha_enabled: bool,
}

impl Pool {
    /// Builds the view; `None` if the record is not a pool.
    pub fn from_record(reference: ObjectRef, record: &ObjectRecord) -> Option<Self> {
        (record.object_type() == &ObjectType::Pool).then(|| Self {
            reference,
            name: record.text("name_label").unwrap_or_default().to_string(),
            coordinator: record.reference("master"),
            ha_enabled: record.flag("ha_enabled"),
        })
    }
}

/// A network interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pif {
    /// PIF reference.
    pub reference: ObjectRef,
    /// Device name, e.g. `eth0`.
    pub device: String,
    /// Owning host.
    pub host: Option<ObjectRef>,
    /// Attached network.
    pub network: Option<ObjectRef>,
    /// MAC address.
    pub mac: String,
    /// Whether this PIF carries the host's management interface.
    pub management: bool,
    /// Whether this is a physical NIC (as opposed to a bond master or VLAN).
    pub physical: bool,
    /// Bond this PIF is a member of.
    pub bond_slave_of: Option<ObjectRef>,
    /// Bonds this PIF is the master of.
    pub bond_master_of: Vec<ObjectRef>,
}

impl Pif {
    /// Builds the view; `None` if the record is not a PIF.
    pub fn from_record(reference: ObjectRef, record: &ObjectRecord) -> Option<Self> {
        (record.object_type() == &ObjectType::Pif).then(|| Self {
            reference,
            device: record.text("device").unwrap_or_default().to_string(),
            host: record.reference("host"),
            network: record.reference("network"),
            mac: record.text("MAC").unwrap_or_default().to_string(),
            management: record.flag("management"),
            physical: record.flag("physical"),
            bond_slave_of: record.reference("bond_slave_of"),
            bond_master_of: record.references("bond_master_of"),
        })
    }
}

/// A NIC bond.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bond {
    /// Bond reference.
    pub reference: ObjectRef,
    /// The bond's master PIF.
    pub master: Option<ObjectRef>,
    /// Member PIFs.
    pub slaves: Vec<ObjectRef>,
}

impl Bond {
    /// Builds the view; `None` if the record is not a bond.
    pub fn from_record(reference: ObjectRef, record: &ObjectRecord) -> Option<Self> {
        (record.object_type() == &ObjectType::Bond).then(|| Self {
            reference,
            master: record.reference("master"),
            slaves: record.references("slaves"),
        })
    }
}

/// A network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Network {
    /// Network reference.
    pub reference: ObjectRef,
    /// Display name.
    pub name: String,
    /// PIFs attached to this network.
    pub pifs: Vec<ObjectRef>,
}

impl Network {
    /// Builds the view; `None` if the record is not a network.
    pub fn from_record(reference: ObjectRef, record: &ObjectRecord) -> Option<Self> {
        (record.object_type() == &ObjectType::Network).then(|| Self {
            reference,
            name: record.text("name_label").unwrap_or_default().to_string(),
            pifs: record.references("PIFs"),
        })
    }
}

fn all<T, F>(store: &ObjectStore, object_type: &ObjectType, build: F) -> Vec<T>
where
    F: Fn(ObjectRef, &ObjectRecord) -> Option<T>,
{
    let mut records = store.get_all(object_type);
    records.sort_by(|a, b| a.0.cmp(&b.0));
    records
        .into_iter()
        .filter_map(|(r, record)| build(r, &record))
        .collect()
}

/// Returns one host.
pub fn host(store: &ObjectStore, reference: &ObjectRef) -> Option<Host> {
    store
        .get(&ObjectType::Host, reference)
        .and_then(|record| Host::from_record(reference.clone(), &record))
}

/// Returns every host, ordered by reference.
pub fn hosts(store: &ObjectStore) -> Vec<Host> {
    all(store, &ObjectType::Host, Host::from_record)
}

/// Returns the pool, if loaded.
pub fn pool(store: &ObjectStore) -> Option<Pool> {
    all(store, &ObjectType::Pool, Pool::from_record)
        .into_iter()
        .next()
}

/// Returns the coordinator host, if known.
pub fn coordinator(store: &ObjectStore) -> Option<Host> {
    pool(store)
        .and_then(|p| p.coordinator)
        .and_then(|r| host(store, &r))
}

/// Returns the management address of every host.
pub fn member_addresses(store: &ObjectStore) -> Vec<String> {
    hosts(store)
        .into_iter()
        .map(|h| h.address)
        .filter(|a| !a.is_empty())
        .collect()
}

/// Returns one PIF.
pub fn pif(store: &ObjectStore, reference: &ObjectRef) -> Option<Pif> {
    store
        .get(&ObjectType::Pif, reference)
        .and_then(|record| Pif::from_record(reference.clone(), &record))
}

/// Returns every PIF owned by a host, ordered by device name.
pub fn pifs_on_host(store: &ObjectStore, host: &ObjectRef) -> Vec<Pif> {
    let mut pifs: Vec<Pif> = all(store, &ObjectType::Pif, Pif::from_record)
        .into_iter()
        .filter(|p| p.host.as_ref() == Some(host))
        .collect();
    pifs.sort_by(|a, b| a.device.cmp(&b.device));
    pifs
}

/// Returns one bond.
pub fn bond(store: &ObjectStore, reference: &ObjectRef) -> Option<Bond> {
    store
        .get(&ObjectType::Bond, reference)
        .and_then(|record| Bond::from_record(reference.clone(), &record))
}

/// Returns every bond whose master PIF sits on `network`.
pub fn bonds_on_network(store: &ObjectStore, network: &ObjectRef) -> Vec<Bond> {
    all(store, &ObjectType::Bond, Bond::from_record)
        .into_iter()
        .filter(|b| {
            b.master
                .as_ref()
                .and_then(|m| pif(store, m))
                .and_then(|p| p.network)
                .as_ref()
                == Some(network)
        })
        .collect()
}

/// Returns the host a bond lives on, via its master PIF.
pub fn bond_host(store: &ObjectStore, bond: &Bond) -> Option<ObjectRef> {
    bond.master
        .as_ref()
        .and_then(|m| pif(store, m))
        .and_then(|p| p.host)
}

/// Returns one network.
pub fn network(store: &ObjectStore, reference: &ObjectRef) -> Option<Network> {
    store
        .get(&ObjectType::Network, reference)
        .and_then(|record| Network::from_record(reference.clone(), &record))
}

#[cfg(test)]
mod tests {
    use super::*;
    use poolsync_protocol::Value;

    fn r(s: &str) -> ObjectRef {
        ObjectRef::new(s)
    }

    fn seeded() -> ObjectStore {
        let store = ObjectStore::new();
        store.put(
            ObjectType::Pool,
            r("OpaqueRef:pool"),
            ObjectRecord::new(ObjectType::Pool)
                .field("name_label", "lab")
                .field("master", r("OpaqueRef:h1"))
                .field("ha_enabled", true),
        );
        for (h, addr) in [("OpaqueRef:h1", "10.0.0.1"), ("OpaqueRef:h2", "10.0.0.2")] {
            store.put(
                ObjectType::Host,
                r(h),
                ObjectRecord::new(ObjectType::Host)
                    .field("name_label", h)
                    .field("address", addr)
                    .field("enabled", true),
            );
        }
        store.put(
            ObjectType::Pif,
            r("OpaqueRef:p-eth1"),
            ObjectRecord::new(ObjectType::Pif)
                .field("device", "eth1")
                .field("host", r("OpaqueRef:h1"))
                .field("physical", true),
        );
        store.put(
            ObjectType::Pif,
            r("OpaqueRef:p-eth0"),
            ObjectRecord::new(ObjectType::Pif)
                .field("device", "eth0")
                .field("host", r("OpaqueRef:h1"))
                .field("management", true)
                .field("physical", true),
        );
        store.put(
            ObjectType::Pif,
            r("OpaqueRef:p-bond"),
            ObjectRecord::new(ObjectType::Pif)
                .field("device", "bond0")
                .field("host", r("OpaqueRef:h1"))
                .field("network", r("OpaqueRef:net"))
                .field("bond_master_of", Value::from(vec![r("OpaqueRef:bond")])),
        );
        store.put(
            ObjectType::Bond,
            r("OpaqueRef:bond"),
            ObjectRecord::new(ObjectType::Bond)
                .field("master", r("OpaqueRef:p-bond"))
                .field("slaves", Value::from(vec![r("OpaqueRef:p-eth0"), r("OpaqueRef:p-eth1")])),
        );
        store
    }

    #[test]
    fn pool_and_coordinator() {
        let store = seeded();
        let pool = pool(&store).unwrap();
        assert!(pool.ha_enabled);
        assert_eq!(coordinator(&store).unwrap().address, "10.0.0.1");
        assert_eq!(member_addresses(&store), vec!["10.0.0.1", "10.0.0.2"]);
    }

    #[test]
    fn pifs_sorted_by_device() {
        let store = seeded();
        let devices: Vec<_> = pifs_on_host(&store, &r("OpaqueRef:h1"))
            .into_iter()
            .map(|p| p.device)
            .collect();
        assert_eq!(devices, vec!["bond0", "eth0", "eth1"]);
        assert!(pifs_on_host(&store, &r("OpaqueRef:h2")).is_empty());
    }

    #[test]
    fn bonds_by_network() {
        let store = seeded();
        let bonds = bonds_on_network(&store, &r("OpaqueRef:net"));
        assert_eq!(bonds.len(), 1);
        assert_eq!(bonds[0].slaves.len(), 2);
        assert_eq!(bond_host(&store, &bonds[0]), Some(r("OpaqueRef:h1")));
        assert!(bonds_on_network(&store, &r("OpaqueRef:other")).is_empty());
    }

    #[test]
    fn views_reject_other_types() {
        let record = ObjectRecord::new(ObjectType::Vm);
        assert!(Host::from_record(r("OpaqueRef:x"), &record).is_none());
        assert!(Pif::from_record(r("OpaqueRef:x"), &record).is_none());
    }

    #[test]
    fn views_are_rederived() {
        let store = seeded();
        let before = host(&store, &r("OpaqueRef:h2")).unwrap();
        store.remove(&ObjectType::Host, &r("OpaqueRef:h2"));
        assert!(host(&store, &r("OpaqueRef:h2")).is_none());
        assert_eq!(before.address, "10.0.0.2");
    }
}

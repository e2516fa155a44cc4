//! The object store.

use parking_lot::RwLock;
use poolsync_protocol::{ObjectRecord, ObjectRef, ObjectType};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, warn};

/// Key of one object: its type plus its reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// Class of the object.
    pub object_type: ObjectType,
    /// Reference of the object.
    pub reference: ObjectRef,
}

impl ObjectKey {
    /// Creates a key.
    pub fn new(object_type: ObjectType, reference: ObjectRef) -> Self {
        Self {
            object_type,
            reference,
        }
    }
}

/// Per-type object counts plus the staleness flag, for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreSummary {
    /// Number of records per type, by wire name.
    pub counts: BTreeMap<String, usize>,
    /// Number of objects currently advisory-locked.
    pub locked: usize,
    /// Whether the store is stale.
    pub stale: bool,
}

type Table = HashMap<ObjectRef, ObjectRecord>;

/// Authoritative in-memory table of server objects.
///
/// All mutations take one global write lock, so a reader always sees either
/// the whole of a mutation or none of it. Reads never touch the network.
///
/// References equal to the null sentinel are treated as absent: they are
/// never stored, never found and never locked.
pub struct ObjectStore {
    /// Records, by type then reference.
    tables: RwLock<HashMap<ObjectType, Table>>,
    /// Advisory busy flags.
    locks: RwLock<HashSet<ObjectKey>>,
    /// Set while the event stream is down.
    stale: AtomicBool,
    /// Bumped on every mutation.
    revision: AtomicU64,
}

impl ObjectStore {
    /// Creates an empty store.
    ///
    /// A new store is stale until its first full load completes.
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            locks: RwLock::new(HashSet::new()),
            stale: AtomicBool::new(true),
            revision: AtomicU64::new(0),
        }
    }

    fn bump(&self) {
        self.revision.fetch_add(1, Ordering::SeqCst);
    }

    /// Inserts or replaces a record. Last write wins.
    ///
    /// Returns false, storing nothing, if the reference is null or the
    /// record's type tag differs from `object_type`.
    pub fn put(&self, object_type: ObjectType, reference: ObjectRef, record: ObjectRecord) -> bool {
        if reference.is_null() {
            debug!(%object_type, "ignoring put for null reference");
            return false;
        }
        if record.object_type() != &object_type {
            warn!(
                %object_type,
                record_type = %record.object_type(),
                %reference,
                "refusing to store record under a different type"
            );
            return false;
        }
        self.tables
            .write()
            .entry(object_type)
            .or_default()
            .insert(reference, record);
        self.bump();
        true
    }

    /// Removes a record if present; a no-op otherwise.
    pub fn remove(&self, object_type: &ObjectType, reference: &ObjectRef) -> Option<ObjectRecord> {
        let removed = self
            .tables
            .write()
            .get_mut(object_type)
            .and_then(|table| table.remove(reference));
        if removed.is_some() {
            self.bump();
        }
        removed
    }

    /// Looks up one record.
    pub fn get(&self, object_type: &ObjectType, reference: &ObjectRef) -> Option<ObjectRecord> {
        if reference.is_null() {
            return None;
        }
        self.tables
            .read()
            .get(object_type)
            .and_then(|table| table.get(reference))
            .cloned()
    }

    /// Returns true if a record exists.
    pub fn contains(&self, object_type: &ObjectType, reference: &ObjectRef) -> bool {
        self.tables
            .read()
            .get(object_type)
            .is_some_and(|table| table.contains_key(reference))
    }

    /// Returns every record of a type.
    ///
    /// The result is a copy taken under the read lock; later mutations do not
    /// change it.
    pub fn get_all(&self, object_type: &ObjectType) -> Vec<(ObjectRef, ObjectRecord)> {
        self.find(object_type, |_| true)
    }

    /// Returns every record of a type that satisfies `predicate`.
    pub fn find<F>(&self, object_type: &ObjectType, predicate: F) -> Vec<(ObjectRef, ObjectRecord)>
    where
        F: Fn(&ObjectRecord) -> bool,
    {
        self.tables
            .read()
            .get(object_type)
            .map(|table| {
                table
                    .iter()
                    .filter(|(_, record)| predicate(record))
                    .map(|(r, record)| (r.clone(), record.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Returns the number of records of a type.
    pub fn len(&self, object_type: &ObjectType) -> usize {
        self.tables
            .read()
            .get(object_type)
            .map(HashMap::len)
            .unwrap_or(0)
    }

    /// Returns the number of records of every type.
    pub fn total_len(&self) -> usize {
        self.tables.read().values().map(HashMap::len).sum()
    }

    /// Returns true if the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.total_len() == 0
    }

    /// Removes every record of one type, and nothing else.
    ///
    /// Returns the number of records removed.
    pub fn clear_type(&self, object_type: &ObjectType) -> usize {
        let removed = self
            .tables
            .write()
            .remove(object_type)
            .map(|table| table.len())
            .unwrap_or(0);
        self.bump();
        removed
    }

    /// Atomically replaces every record of one type.
    ///
    /// Used by the full load so that objects deleted while disconnected
    /// disappear. Null references and mistyped records are skipped.
    pub fn replace_type<I>(&self, object_type: ObjectType, records: I) -> usize
    where
        I: IntoIterator<Item = (ObjectRef, ObjectRecord)>,
    {
        let table: Table = records
            .into_iter()
            .filter(|(r, record)| !r.is_null() && record.object_type() == &object_type)
            .collect();
        let count = table.len();
        self.tables.write().insert(object_type, table);
        self.bump();
        count
    }

    /// Removes every record of every type.
    pub fn clear(&self) {
        self.tables.write().clear();
        self.bump();
    }

    /// Returns the types that currently hold records.
    pub fn types(&self) -> Vec<ObjectType> {
        let mut types: Vec<_> = self
            .tables
            .read()
            .iter()
            .filter(|(_, table)| !table.is_empty())
            .map(|(t, _)| t.clone())
            .collect();
        types.sort();
        types
    }

    /// Returns counts per type for diagnostics.
    pub fn summary(&self) -> StoreSummary {
        let counts = self
            .tables
            .read()
            .iter()
            .map(|(t, table)| (t.to_string(), table.len()))
            .collect();
        StoreSummary {
            counts,
            locked: self.locks.read().len(),
            stale: self.is_stale(),
        }
    }

    /// Returns a counter bumped by every mutation.
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    /// Sets the advisory busy flag on an object.
    ///
    /// Returns false if it was already set or the reference is null. The flag
    /// is cooperative: the store enforces nothing, callers check it.
    pub fn lock(&self, object_type: ObjectType, reference: ObjectRef) -> bool {
        if reference.is_null() {
            return false;
        }
        self.locks
            .write()
            .insert(ObjectKey::new(object_type, reference))
    }

    /// Clears the advisory busy flag. Returns false if it was not set.
    pub fn unlock(&self, object_type: &ObjectType, reference: &ObjectRef) -> bool {
        self.locks
            .write()
            .remove(&ObjectKey::new(object_type.clone(), reference.clone()))
    }

    /// Returns true if the advisory busy flag is set.
    pub fn is_locked(&self, object_type: &ObjectType, reference: &ObjectRef) -> bool {
        self.locks
            .read()
            .contains(&ObjectKey::new(object_type.clone(), reference.clone()))
    }

    /// Marks the store as stale: readable but no longer updated.
    pub fn mark_stale(&self) {
        self.stale.store(true, Ordering::SeqCst);
    }

    /// Marks the store as current.
    pub fn mark_fresh(&self) {
        self.stale.store(false, Ordering::SeqCst);
    }

    /// Returns true while the store is not being kept current.
    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::SeqCst)
    }
}

impl Default for ObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn host(name: &str) -> ObjectRecord {
        ObjectRecord::new(ObjectType::Host).field("name_label", name)
    }

    fn r(s: &str) -> ObjectRef {
        ObjectRef::new(s)
    }

    #[test]
    fn put_get_remove() {
        let store = ObjectStore::new();
        assert!(store.put(ObjectType::Host, r("OpaqueRef:h1"), host("a")));
        assert_eq!(store.get(&ObjectType::Host, &r("OpaqueRef:h1")), Some(host("a")));

        // Last write wins.
        store.put(ObjectType::Host, r("OpaqueRef:h1"), host("b"));
        assert_eq!(store.get(&ObjectType::Host, &r("OpaqueRef:h1")), Some(host("b")));
        assert_eq!(store.len(&ObjectType::Host), 1);

        assert!(store.remove(&ObjectType::Host, &r("OpaqueRef:h1")).is_some());
        assert!(store.get(&ObjectType::Host, &r("OpaqueRef:h1")).is_none());
    }

    #[test]
    fn remove_unknown_is_noop() {
        let store = ObjectStore::new();
        store.put(ObjectType::Host, r("OpaqueRef:h1"), host("a"));
        let before = store.revision();
        assert!(store.remove(&ObjectType::Host, &r("OpaqueRef:zz")).is_none());
        assert!(store.remove(&ObjectType::Vm, &r("OpaqueRef:h1")).is_none());
        assert_eq!(store.revision(), before);
        assert_eq!(store.total_len(), 1);
    }

    #[test]
    fn lookup_is_per_type() {
        let store = ObjectStore::new();
        store.put(ObjectType::Host, r("OpaqueRef:x"), host("a"));
        assert!(store.get(&ObjectType::Vm, &r("OpaqueRef:x")).is_none());
    }

    #[test]
    fn null_reference_is_absent() {
        let store = ObjectStore::new();
        assert!(!store.put(ObjectType::Host, ObjectRef::null(), host("a")));
        assert!(store.get(&ObjectType::Host, &ObjectRef::null()).is_none());
        assert!(!store.lock(ObjectType::Host, ObjectRef::null()));
        assert!(store.is_empty());
    }

    #[test]
    fn mistyped_record_is_refused() {
        let store = ObjectStore::new();
        assert!(!store.put(ObjectType::Vm, r("OpaqueRef:h1"), host("a")));
        assert!(store.is_empty());
    }

    #[test]
    fn get_all_is_a_snapshot() {
        let store = ObjectStore::new();
        store.put(ObjectType::Host, r("OpaqueRef:h1"), host("a"));
        store.put(ObjectType::Host, r("OpaqueRef:h2"), host("b"));

        let snapshot = store.get_all(&ObjectType::Host);
        store.remove(&ObjectType::Host, &r("OpaqueRef:h1"));
        store.put(ObjectType::Host, r("OpaqueRef:h2"), host("changed"));
        store.put(ObjectType::Host, r("OpaqueRef:h3"), host("c"));

        assert_eq!(snapshot.len(), 2);
        assert!(snapshot
            .iter()
            .any(|(reference, record)| reference == &r("OpaqueRef:h2") && record == &host("b")));
    }

    #[test]
    fn clear_type_only_touches_that_type() {
        let store = ObjectStore::new();
        store.put(ObjectType::Host, r("OpaqueRef:h1"), host("a"));
        store.put(ObjectType::Host, r("OpaqueRef:h2"), host("b"));
        store.put(
            ObjectType::Vm,
            r("OpaqueRef:v1"),
            ObjectRecord::new(ObjectType::Vm),
        );

        assert_eq!(store.clear_type(&ObjectType::Host), 2);
        assert_eq!(store.len(&ObjectType::Host), 0);
        assert_eq!(store.len(&ObjectType::Vm), 1);
        assert_eq!(store.types(), vec![ObjectType::Vm]);
    }

    #[test]
    fn replace_type_drops_missing_objects() {
        let store = ObjectStore::new();
        store.put(ObjectType::Host, r("OpaqueRef:gone"), host("old"));
        let count = store.replace_type(
            ObjectType::Host,
            vec![
                (r("OpaqueRef:h1"), host("a")),
                (ObjectRef::null(), host("null")),
                (r("OpaqueRef:v"), ObjectRecord::new(ObjectType::Vm)),
            ],
        );
        assert_eq!(count, 1);
        assert!(!store.contains(&ObjectType::Host, &r("OpaqueRef:gone")));
        assert!(store.contains(&ObjectType::Host, &r("OpaqueRef:h1")));
    }

    #[test]
    fn advisory_locks() {
        let store = ObjectStore::new();
        assert!(store.lock(ObjectType::Bond, r("OpaqueRef:b")));
        assert!(!store.lock(ObjectType::Bond, r("OpaqueRef:b")));
        assert!(store.is_locked(&ObjectType::Bond, &r("OpaqueRef:b")));
        assert!(!store.is_locked(&ObjectType::Pif, &r("OpaqueRef:b")));
        assert_eq!(store.summary().locked, 1);
        assert!(store.unlock(&ObjectType::Bond, &r("OpaqueRef:b")));
        assert!(!store.unlock(&ObjectType::Bond, &r("OpaqueRef:b")));
    }

    #[test]
    fn staleness_flag() {
        let store = ObjectStore::new();
        assert!(store.is_stale());
        store.mark_fresh();
        assert!(!store.is_stale());
        store.mark_stale();
        assert!(store.summary().stale);
    }

    #[test]
    fn concurrent_writers_and_readers() {
        let store = Arc::new(ObjectStore::new());
        let writers: Vec<_> = (0..4)
            .map(|w| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        store.put(
                            ObjectType::Host,
                            r(&format!("OpaqueRef:{w}-{i}")),
                            host(&format!("{w}-{i}")),
                        );
                    }
                })
            })
            .collect();
        let reader = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                for _ in 0..100 {
                    for (reference, record) in store.get_all(&ObjectType::Host) {
                        let name = record.text("name_label").unwrap();
                        assert_eq!(reference.as_str(), format!("OpaqueRef:{name}"));
                    }
                }
            })
        };
        for w in writers {
            w.join().unwrap();
        }
        reader.join().unwrap();
        assert_eq!(store.len(&ObjectType::Host), 400);
    }
}

//! Property-based test generators using proptest.

use poolsync_protocol::{Event, ObjectRecord, ObjectRef, ObjectType};
use proptest::prelude::*;

/// Strategy for a reference drawn from a small pool, so sequences revisit objects.
pub fn reference_strategy(distinct: u8) -> impl Strategy<Value = ObjectRef> {
    (0..distinct.max(1)).prop_map(|i| ObjectRef::new(format!("OpaqueRef:obj-{i}")))
}

/// Strategy for one of the classes the engine names.
pub fn class_strategy() -> impl Strategy<Value = ObjectType> {
    prop_oneof![
        Just(ObjectType::Host),
        Just(ObjectType::Vm),
        Just(ObjectType::Network),
        Just(ObjectType::Pif),
    ]
}

/// Strategy for a record of `class` with a few fields.
pub fn record_strategy(class: ObjectType) -> impl Strategy<Value = ObjectRecord> {
    (
        prop::string::string_regex("[a-z]{1,8}").expect("Invalid regex"),
        any::<i64>(),
        any::<bool>(),
    )
        .prop_map(move |(name, n, flag)| {
            ObjectRecord::new(class.clone())
                .field("name_label", name)
                .field("counter", n)
                .field("enabled", flag)
        })
}

#[derive(Debug, Clone)]
enum Change {
    Put(ObjectType, ObjectRef, ObjectRecord, bool),
    Delete(ObjectType, ObjectRef),
}

fn change_strategy(distinct: u8) -> impl Strategy<Value = Change> {
    (class_strategy(), reference_strategy(distinct), any::<u8>()).prop_flat_map(
        |(class, reference, kind)| {
            let c = class.clone();
            let r = reference.clone();
            if kind % 4 == 0 {
                Just(Change::Delete(class, reference)).boxed()
            } else {
                (record_strategy(c.clone()), any::<bool>())
                    .prop_map(move |(record, added)| Change::Put(c.clone(), r.clone(), record, added))
                    .boxed()
            }
        },
    )
}

/// Strategy for an event sequence with strictly increasing ids.
///
/// Targets repeat, deletes of never-added objects occur, and ids have gaps.
pub fn event_sequence_strategy(max_len: usize, distinct: u8) -> impl Strategy<Value = Vec<Event>> {
    prop::collection::vec((change_strategy(distinct), 1u64..4), 0..max_len).prop_map(|changes| {
        let mut id = 0;
        changes
            .into_iter()
            .map(|(change, gap)| {
                id += gap;
                match change {
                    Change::Put(_, reference, record, true) => Event::added(id, reference, record),
                    Change::Put(_, reference, record, false) => {
                        Event::modified(id, reference, record)
                    }
                    Change::Delete(class, reference) => Event::deleted(id, class, reference),
                }
            })
            .collect()
    })
}

//! Incremental change events.

use crate::error::{ProtocolError, ProtocolResult};
use crate::record::ObjectRecord;
use crate::reference::{ObjectRef, ObjectType};
use crate::value::Value;
use serde::{Deserialize, Serialize};

/// What happened to the event's target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventOperation {
    /// The object was created.
    Added,
    /// The object changed; the snapshot holds its full new state.
    Modified,
    /// The object was destroyed.
    Deleted,
}

impl EventOperation {
    /// Parses the wire form (`add`, `mod`, `del`, or the long names).
    pub fn from_wire(name: &str) -> Option<Self> {
        match name {
            "add" | "added" => Some(EventOperation::Added),
            "mod" | "modified" => Some(EventOperation::Modified),
            "del" | "deleted" => Some(EventOperation::Deleted),
            _ => None,
        }
    }

    /// Returns the short wire form.
    pub fn wire_name(self) -> &'static str {
        match self {
            EventOperation::Added => "add",
            EventOperation::Modified => "mod",
            EventOperation::Deleted => "del",
        }
    }

    /// Returns true if events of this kind carry a snapshot.
    pub fn carries_snapshot(self) -> bool {
        !matches!(self, EventOperation::Deleted)
    }
}

/// A single change event.
///
/// Events for one target must be applied in non-decreasing `id` order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Position in the server's event stream.
    pub id: u64,
    /// Class of the target.
    pub class: ObjectType,
    /// What happened.
    pub operation: EventOperation,
    /// The object concerned.
    pub target: ObjectRef,
    /// Full new state (`Added`/`Modified` only).
    pub snapshot: Option<ObjectRecord>,
}

impl Event {
    /// Creates an `Added` event; the class is taken from the record.
    pub fn added(id: u64, target: ObjectRef, snapshot: ObjectRecord) -> Self {
        Self {
            id,
            class: snapshot.object_type().clone(),
            operation: EventOperation::Added,
            target,
            snapshot: Some(snapshot),
        }
    }

    /// Creates a `Modified` event; the class is taken from the record.
    pub fn modified(id: u64, target: ObjectRef, snapshot: ObjectRecord) -> Self {
        Self {
            operation: EventOperation::Modified,
            ..Self::added(id, target, snapshot)
        }
    }

    /// Creates a `Deleted` event.
    pub fn deleted(id: u64, class: ObjectType, target: ObjectRef) -> Self {
        Self {
            id,
            class,
            operation: EventOperation::Deleted,
            target,
            snapshot: None,
        }
    }

    /// Interprets one raw wire event.
    pub fn from_value(value: &Value) -> ProtocolResult<Self> {
        let map = value
            .as_map()
            .ok_or_else(|| ProtocolError::malformed_event("event is not a map"))?;

        let id = map
            .get("id")
            .and_then(Value::as_integer)
            .filter(|id| *id >= 0)
            .ok_or_else(|| ProtocolError::malformed_event("missing or negative id"))?
            as u64;

        let class = map
            .get("class")
            .and_then(Value::as_text)
            .filter(|c| !c.is_empty())
            .map(ObjectType::from_wire)
            .ok_or_else(|| ProtocolError::malformed_event(format!("event {id}: missing class")))?;

        let operation = map
            .get("operation")
            .and_then(Value::as_text)
            .and_then(EventOperation::from_wire)
            .ok_or_else(|| {
                ProtocolError::malformed_event(format!("event {id}: unknown operation"))
            })?;

        let target = match map.get("ref") {
            Some(Value::Ref(r)) => r.clone().into_option(),
            Some(Value::Text(s)) => ObjectRef::parse(s),
            _ => None,
        }
        .ok_or_else(|| ProtocolError::malformed_event(format!("event {id}: missing ref")))?;

        let snapshot = if operation.carries_snapshot() {
            let raw = map.get("snapshot").ok_or_else(|| {
                ProtocolError::malformed_event(format!("event {id}: missing snapshot"))
            })?;
            Some(ObjectRecord::from_value(class.clone(), raw)?)
        } else {
            None
        };

        Ok(Self {
            id,
            class,
            operation,
            target,
            snapshot,
        })
    }

    /// Converts to the wire form.
    pub fn to_value(&self) -> Value {
        let mut pairs = vec![
            ("id", Value::Integer(self.id as i64)),
            ("class", Value::from(self.class.wire_name().to_ascii_lowercase())),
            ("operation", Value::from(self.operation.wire_name())),
            ("ref", Value::from(&self.target)),
        ];
        if let Some(ref snapshot) = self.snapshot {
            pairs.push(("snapshot", snapshot.to_value()));
        }
        Value::map(pairs)
    }
}

/// One long-poll response: raw events plus the cursor that follows them.
///
/// Events are kept raw until [`EventBatch::parse_events`] so that a single
/// malformed entry can be skipped without losing the rest of the batch.
#[derive(Debug, Clone, PartialEq)]
pub struct EventBatch {
    /// Raw events as returned by the server.
    pub events: Vec<Value>,
    /// Cursor to use for the next poll.
    pub token: String,
}

impl EventBatch {
    /// Creates a batch from typed events.
    pub fn new(events: &[Event], token: impl Into<String>) -> Self {
        Self {
            events: events.iter().map(Event::to_value).collect(),
            token: token.into(),
        }
    }

    /// Interprets an `event.from` response.
    pub fn from_value(value: &Value) -> ProtocolResult<Self> {
        let map = value.as_map().ok_or(ProtocolError::UnexpectedShape {
            expected: "event batch map",
        })?;
        let events = map
            .get("events")
            .and_then(Value::as_array)
            .ok_or(ProtocolError::UnexpectedShape {
                expected: "events array",
            })?
            .to_vec();
        let token = map
            .get("token")
            .and_then(Value::as_text)
            .ok_or(ProtocolError::UnexpectedShape {
                expected: "token text",
            })?
            .to_string();
        Ok(Self { events, token })
    }

    /// Converts to the wire form.
    pub fn to_value(&self) -> Value {
        Value::map([
            ("events", Value::Array(self.events.clone())),
            ("token", Value::from(self.token.clone())),
        ])
    }

    /// Parses every event, returning the good ones in id order and the
    /// failures separately.
    ///
    /// The sort is stable, so events sharing an id keep their server order.
    pub fn parse_events(&self) -> (Vec<Event>, Vec<ProtocolError>) {
        let mut events = Vec::with_capacity(self.events.len());
        let mut errors = Vec::new();
        for raw in &self.events {
            match Event::from_value(raw) {
                Ok(event) => events.push(event),
                Err(e) => errors.push(e),
            }
        }
        events.sort_by_key(|e| e.id);
        (events, errors)
    }

    /// Returns true if the batch carries no events.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(name: &str) -> ObjectRecord {
        ObjectRecord::new(ObjectType::Host).field("name_label", name)
    }

    #[test]
    fn operation_wire_names() {
        assert_eq!(EventOperation::from_wire("add"), Some(EventOperation::Added));
        assert_eq!(EventOperation::from_wire("modified"), Some(EventOperation::Modified));
        assert_eq!(EventOperation::from_wire("del"), Some(EventOperation::Deleted));
        assert_eq!(EventOperation::from_wire("upsert"), None);
        assert!(!EventOperation::Deleted.carries_snapshot());
    }

    #[test]
    fn parse_wire_event() {
        let event = Event::modified(5, ObjectRef::new("OpaqueRef:h2"), host("h2"));
        let parsed = Event::from_value(&event.to_value()).unwrap();
        assert_eq!(parsed, event);
        assert_eq!(parsed.class, ObjectType::Host);
    }

    #[test]
    fn deleted_event_has_no_snapshot() {
        let raw = Value::map([
            ("id", Value::Integer(9)),
            ("class", Value::from("vm")),
            ("operation", Value::from("del")),
            ("ref", Value::from("OpaqueRef:vm1")),
        ]);
        let event = Event::from_value(&raw).unwrap();
        assert_eq!(event.operation, EventOperation::Deleted);
        assert_eq!(event.class, ObjectType::Vm);
        assert!(event.snapshot.is_none());
    }

    #[test]
    fn malformed_events() {
        let missing_snapshot = Value::map([
            ("id", Value::Integer(1)),
            ("class", Value::from("host")),
            ("operation", Value::from("add")),
            ("ref", Value::from("OpaqueRef:h")),
        ]);
        assert!(Event::from_value(&missing_snapshot).is_err());

        let null_ref = Value::map([
            ("id", Value::Integer(1)),
            ("class", Value::from("host")),
            ("operation", Value::from("del")),
            ("ref", Value::from("OpaqueRef:NULL")),
        ]);
        assert!(Event::from_value(&null_ref).is_err());

        assert!(Event::from_value(&Value::Integer(3)).is_err());
    }

    #[test]
    fn batch_sorts_and_separates_failures() {
        let a = Event::added(7, ObjectRef::new("OpaqueRef:a"), host("a"));
        let b = Event::deleted(3, ObjectType::Host, ObjectRef::new("OpaqueRef:b"));
        let mut batch = EventBatch::new(&[a.clone(), b.clone()], "T1");
        batch.events.push(Value::from("garbage"));

        let decoded = EventBatch::from_value(&batch.to_value()).unwrap();
        assert_eq!(decoded.token, "T1");

        let (events, errors) = decoded.parse_events();
        assert_eq!(events, vec![b, a]);
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn batch_shape_errors() {
        assert!(EventBatch::from_value(&Value::Null).is_err());
        let no_token = Value::map([("events", Value::Array(vec![]))]);
        assert!(EventBatch::from_value(&no_token).is_err());
    }
}

//! Object records.

use crate::error::{ProtocolError, ProtocolResult};
use crate::reference::{ObjectRef, ObjectType};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One server object: a type tag plus its fields.
///
/// The type tag is fixed at construction; there is no way to change it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectRecord {
    object_type: ObjectType,
    fields: BTreeMap<String, Value>,
}

impl ObjectRecord {
    /// Creates a record with no fields.
    pub fn new(object_type: ObjectType) -> Self {
        Self {
            object_type,
            fields: BTreeMap::new(),
        }
    }

    /// Creates a record from a field map.
    pub fn with_fields(object_type: ObjectType, fields: BTreeMap<String, Value>) -> Self {
        Self {
            object_type,
            fields,
        }
    }

    /// Interprets a wire snapshot (a map) as a record of the given class.
    pub fn from_value(object_type: ObjectType, value: &Value) -> ProtocolResult<Self> {
        match value {
            Value::Map(fields) => Ok(Self::with_fields(object_type, fields.clone())),
            _ => Err(ProtocolError::MalformedRecord {
                object_type: object_type.to_string(),
                reason: "snapshot is not a map".into(),
            }),
        }
    }

    /// Adds or replaces a field, builder style.
    pub fn field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Returns the type tag.
    pub fn object_type(&self) -> &ObjectType {
        &self.object_type
    }

    /// Returns every field.
    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    /// Returns a field value.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Returns a text field.
    pub fn text(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_text)
    }

    /// Returns a boolean field; missing or non-boolean fields read as `false`.
    pub fn flag(&self, name: &str) -> bool {
        self.get(name).and_then(Value::as_bool).unwrap_or(false)
    }

    /// Returns an integer field.
    pub fn integer(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(Value::as_integer)
    }

    /// Returns a reference field, with the null sentinel mapped to `None`.
    pub fn reference(&self, name: &str) -> Option<ObjectRef> {
        self.get(name).and_then(Value::as_object_ref)
    }

    /// Returns a reference-set field.
    pub fn references(&self, name: &str) -> Vec<ObjectRef> {
        self.get(name).map(Value::as_object_refs).unwrap_or_default()
    }

    /// Converts back to the wire form.
    pub fn to_value(&self) -> Value {
        Value::Map(self.fields.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pif() -> ObjectRecord {
        ObjectRecord::new(ObjectType::Pif)
            .field("device", "eth0")
            .field("host", ObjectRef::new("OpaqueRef:h1"))
            .field("bond_slave_of", ObjectRef::null())
            .field("management", true)
            .field("MTU", 1500i64)
    }

    #[test]
    fn typed_accessors() {
        let record = pif();
        assert_eq!(record.object_type(), &ObjectType::Pif);
        assert_eq!(record.text("device"), Some("eth0"));
        assert_eq!(record.reference("host"), Some(ObjectRef::new("OpaqueRef:h1")));
        assert_eq!(record.reference("bond_slave_of"), None);
        assert!(record.flag("management"));
        assert!(!record.flag("physical"));
        assert_eq!(record.integer("MTU"), Some(1500));
    }

    #[test]
    fn from_value_requires_map() {
        let record = ObjectRecord::from_value(ObjectType::Host, &pif().to_value()).unwrap();
        assert_eq!(record.object_type(), &ObjectType::Host);
        assert_eq!(record.text("device"), Some("eth0"));

        let err = ObjectRecord::from_value(ObjectType::Host, &Value::from("nope")).unwrap_err();
        assert!(err.is_event_local());
    }

    #[test]
    fn reference_sets() {
        let record = ObjectRecord::new(ObjectType::Bond).field(
            "slaves",
            Value::from(vec![ObjectRef::new("OpaqueRef:p1"), ObjectRef::new("OpaqueRef:p2")]),
        );
        assert_eq!(record.references("slaves").len(), 2);
        assert!(record.references("missing").is_empty());
    }

    #[test]
    fn reference_fields_accept_any_opaque_text() {
        let record = ObjectRecord::new(ObjectType::Pif)
            .field("host", "a1b2c3")
            .field("bond_slave_of", crate::NULL_REF);
        assert_eq!(record.reference("host"), ObjectRef::parse("a1b2c3"));
        assert_eq!(record.reference("bond_slave_of"), None);
    }
}

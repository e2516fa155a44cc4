//! Object references and object types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The sentinel reference meaning "no object".
pub const NULL_REF: &str = "OpaqueRef:NULL";

/// Opaque reference to one server object.
///
/// Unique within its type and stable for the object's lifetime. The
/// [`NULL_REF`] sentinel is equivalent to an absent reference everywhere;
/// use [`ObjectRef::parse`] or [`ObjectRef::into_option`] to normalize it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectRef(String);

impl ObjectRef {
    /// Creates a reference from its wire form.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the null sentinel.
    pub fn null() -> Self {
        Self(NULL_REF.to_string())
    }

    /// Parses a reference, mapping the sentinel and the empty string to `None`.
    pub fn parse(value: &str) -> Option<Self> {
        let r = Self::new(value);
        r.into_option()
    }

    /// Returns true for the sentinel or an empty reference.
    pub fn is_null(&self) -> bool {
        self.0.is_empty() || self.0 == NULL_REF
    }

    /// Converts to `None` if this is the sentinel.
    pub fn into_option(self) -> Option<Self> {
        if self.is_null() {
            None
        } else {
            Some(self)
        }
    }

    /// Returns the wire form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Class of a server object.
///
/// The classes the engine itself reasons about are named; every other class
/// the server reports is kept verbatim in `Other`. Comparison is
/// case-insensitive on the wire name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ObjectType {
    /// The pool itself (one per connection).
    Pool,
    /// A physical host.
    Host,
    /// A virtual machine.
    Vm,
    /// A storage repository.
    Sr,
    /// A network.
    Network,
    /// A physical (or bond master) network interface.
    Pif,
    /// A NIC bond.
    Bond,
    /// A server-side task.
    Task,
    /// Any other class, stored lower-cased.
    Other(String),
}

impl ObjectType {
    /// Returns the class name used in `<class>.<method>` calls.
    pub fn wire_name(&self) -> &str {
        match self {
            ObjectType::Pool => "pool",
            ObjectType::Host => "host",
            ObjectType::Vm => "VM",
            ObjectType::Sr => "SR",
            ObjectType::Network => "network",
            ObjectType::Pif => "PIF",
            ObjectType::Bond => "Bond",
            ObjectType::Task => "task",
            ObjectType::Other(name) => name,
        }
    }

    /// Parses a class name in any case.
    pub fn from_wire(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "pool" => ObjectType::Pool,
            "host" => ObjectType::Host,
            "vm" => ObjectType::Vm,
            "sr" => ObjectType::Sr,
            "network" => ObjectType::Network,
            "pif" => ObjectType::Pif,
            "bond" => ObjectType::Bond,
            "task" => ObjectType::Task,
            other => ObjectType::Other(other.to_string()),
        }
    }

    /// Name of the call that enumerates every object of this class.
    pub fn get_all_records_method(&self) -> String {
        format!("{}.get_all_records", self.wire_name())
    }

    /// Returns true if changes to this class can alter pool membership.
    pub fn affects_membership(&self) -> bool {
        matches!(self, ObjectType::Pool | ObjectType::Host)
    }
}

impl From<String> for ObjectType {
    fn from(name: String) -> Self {
        ObjectType::from_wire(&name)
    }
}

impl From<&str> for ObjectType {
    fn from(name: &str) -> Self {
        ObjectType::from_wire(name)
    }
}

impl From<ObjectType> for String {
    fn from(t: ObjectType) -> Self {
        t.wire_name().to_string()
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

//! Preconditions checked before an operation runs.

use poolsync_core::{ObjectKey, ObjectStore};
use poolsync_protocol::{ObjectRef, ObjectType};

/// A precondition evaluated against the store before any call is made.
pub trait CapabilityCheck: Send + Sync {
    /// Short description for logs.
    fn describe(&self) -> String;

    /// Returns the reason the check fails, if it does.
    fn check(&self, store: &ObjectStore) -> Result<(), String>;
}

/// Fails if any of the objects is already in use by another operation.
#[derive(Debug, Clone, Default)]
pub struct ObjectsNotLocked {
    objects: Vec<ObjectKey>,
}

impl ObjectsNotLocked {
    /// Creates an empty check.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an object.
    pub fn with(mut self, object_type: ObjectType, reference: ObjectRef) -> Self {
        self.objects.push(ObjectKey::new(object_type, reference));
        self
    }

    /// Adds several objects of one type.
    pub fn with_all<I>(mut self, object_type: ObjectType, references: I) -> Self
    where
        I: IntoIterator<Item = ObjectRef>,
    {
        self.objects.extend(
            references
                .into_iter()
                .map(|r| ObjectKey::new(object_type.clone(), r)),
        );
        self
    }
}

impl CapabilityCheck for ObjectsNotLocked {
    fn describe(&self) -> String {
        format!("{} objects not in use", self.objects.len())
    }

    fn check(&self, store: &ObjectStore) -> Result<(), String> {
        match self
            .objects
            .iter()
            .find(|key| store.is_locked(&key.object_type, &key.reference))
        {
            Some(key) => Err(format!("{} {} is in use", key.object_type, key.reference)),
            None => Ok(()),
        }
    }
}

/// Fails if the object is not in the store.
#[derive(Debug, Clone)]
pub struct ObjectExists {
    key: ObjectKey,
}

impl ObjectExists {
    /// Creates the check.
    pub fn new(object_type: ObjectType, reference: ObjectRef) -> Self {
        Self {
            key: ObjectKey::new(object_type, reference),
        }
    }
}

impl CapabilityCheck for ObjectExists {
    fn describe(&self) -> String {
        format!("{} {} exists", self.key.object_type, self.key.reference)
    }

    fn check(&self, store: &ObjectStore) -> Result<(), String> {
        if store.contains(&self.key.object_type, &self.key.reference) {
            Ok(())
        } else {
            Err(format!(
                "{} {} does not exist",
                self.key.object_type, self.key.reference
            ))
        }
    }
}

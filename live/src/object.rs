//! Live object handles.

use crate::changeset::ObjectChange;
use crate::collection::{linking_source, list_target, CollectionSource, LiveCollection};
use crate::error::{LiveError, Result};
use crate::publisher::{self, Publisher};
use crate::realm::Realm;
use crate::registry::{Delivery, KeyPathFilter, NotificationToken, ObserverTarget};
use ripple_engine::{ObjectId, Snapshot};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Read one property of `id` from a snapshot, falling back to the
/// descriptor default.
pub(crate) fn read_value(snapshot: &Snapshot, id: &ObjectId, property: &str) -> Result<Value> {
    let record = snapshot.get(id).ok_or(LiveError::InvalidatedObject)?;
    let descriptor = snapshot.schema().require(&id.table)?.require(property)?;
    Ok(record
        .get(property)
        .cloned()
        .unwrap_or_else(|| descriptor.default_value()))
}

/// Every property of `id`, in descriptor order.
pub(crate) fn read_values(snapshot: &Snapshot, id: &ObjectId) -> Result<BTreeMap<String, Value>> {
    let record = snapshot.get(id).ok_or(LiveError::InvalidatedObject)?;
    let object_schema = snapshot.schema().require(&id.table)?;
    Ok(object_schema
        .properties
        .iter()
        .map(|descriptor| {
            let value = record
                .get(&descriptor.name)
                .cloned()
                .unwrap_or_else(|| descriptor.default_value());
            (descriptor.name.clone(), value)
        })
        .collect())
}

pub(crate) fn decode<T: DeserializeOwned>(property: &str, value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| LiveError::Decode {
        property: property.to_string(),
        reason: e.to_string(),
    })
}

/// An object bound to a realm.
///
/// Reads see the realm's current version, or the open write transaction's
/// working state. The handle outlives the object: once it is deleted, reads
/// fail with [`LiveError::InvalidatedObject`].
#[derive(Clone)]
pub struct LiveObject {
    realm: Realm,
    id: ObjectId,
}

impl fmt::Debug for LiveObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveObject")
            .field("realm", &self.realm.id())
            .field("id", &self.id)
            .finish()
    }
}

impl PartialEq for LiveObject {
    fn eq(&self, other: &Self) -> bool {
        self.realm.id() == other.realm.id() && self.id == other.id
    }
}

impl LiveObject {
    pub(crate) fn new(realm: Realm, id: ObjectId) -> Self {
        Self { realm, id }
    }

    pub fn id(&self) -> &ObjectId {
        &self.id
    }

    pub fn realm(&self) -> &Realm {
        &self.realm
    }

    /// Whether the object no longer exists at the realm's version.
    pub fn is_invalidated(&self) -> bool {
        self.realm.with_view(|view| !view.exists(&self.id))
    }

    /// Read a property as JSON.
    pub fn get(&self, property: &str) -> Result<Value> {
        self.realm
            .with_view(|view| read_value(view, &self.id, property))
    }

    /// Read a property and decode it.
    pub fn get_as<T: DeserializeOwned>(&self, property: &str) -> Result<T> {
        decode(property, self.get(property)?)
    }

    /// All properties by name.
    pub fn values(&self) -> Result<BTreeMap<String, Value>> {
        self.realm.with_view(|view| read_values(view, &self.id))
    }

    /// Write a property. Requires an open write transaction.
    pub fn set(&self, property: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        self.realm
            .with_write(|txn| txn.set(&self.id, property, value))
    }

    /// A list property as a live collection.
    pub fn list(&self, property: &str) -> Result<LiveCollection> {
        list_target(&self.realm.schema(), &self.id.table, property)?;
        Ok(LiveCollection::new(
            self.realm.clone(),
            CollectionSource::List {
                owner: self.id.clone(),
                property: property.to_string(),
                filter: None,
            },
        ))
    }

    /// Objects of `table` whose link or list `property` points at this
    /// object, in insertion order. Invalidated once this object is deleted.
    pub fn linking_objects(&self, table: &str, property: &str) -> Result<LiveCollection> {
        let source = linking_source(&self.realm.schema(), &self.id, table, property)?;
        Ok(LiveCollection::new(self.realm.clone(), source))
    }

    /// Register a change callback.
    ///
    /// The first delivery is `Initial`. Later deliveries list the changed
    /// properties, restricted to `key_paths` when it is non-empty; a version
    /// that changes none of them is not delivered. `Deleted` ends the stream.
    ///
    /// A dotted path like `dogs.age` follows links: a changed `age` on any
    /// listed dog is reported as a change to `dogs`.
    pub fn observe<F>(&self, key_paths: &[&str], mut callback: F) -> Result<NotificationToken>
    where
        F: FnMut(ObjectChange<LiveObject>) + Send + 'static,
    {
        let filter = KeyPathFilter::for_paths(&self.realm.schema(), &self.id.table, key_paths)?;
        if self.is_invalidated() {
            return Err(LiveError::InvalidatedObject);
        }

        let id = self.id.clone();
        self.realm.add_observer(
            ObserverTarget::Object(self.id.clone()),
            filter,
            Box::new(move |realm, delivery| {
                let object = LiveObject::new(realm.clone(), id.clone());
                callback(match delivery {
                    Delivery::Initial => ObjectChange::Initial(object),
                    Delivery::Changed(changes) => ObjectChange::Change(object, changes.property_diffs),
                    Delivery::Deleted => ObjectChange::Deleted,
                    Delivery::Error(e) => ObjectChange::Error(e),
                })
            }),
        )
    }

    /// Stream of change events, starting with `Initial`.
    pub fn changeset_publisher(&self, key_paths: &[&str]) -> Publisher<ObjectChange<LiveObject>> {
        publisher::changesets(self, key_paths)
    }

    /// Stream of the object itself, once per delivered version. Finishes
    /// when the object is deleted.
    pub fn value_publisher(&self, key_paths: &[&str]) -> Publisher<LiveObject> {
        publisher::values(self, key_paths)
    }
}

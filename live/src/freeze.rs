//! Frozen, immutable views pinned to one version.
//!
//! Frozen handles hold their snapshot directly, so they are `Send + Sync`
//! and can be read from any thread. They never change and cannot be
//! observed.

use crate::changeset::{CollectionChange, ObjectChange};
use crate::collection::{
    linking_source, list_target, Collection, CollectionSource, LiveCollection,
};
use crate::database::Database;
use crate::error::{LiveError, Result};
use crate::object::{decode, read_value, read_values, LiveObject};
use crate::realm::Realm;
use ripple_engine::{compile, ObjectId, Query, Snapshot, Version};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Produce an immutable copy pinned to the current version.
pub trait Freeze {
    type Frozen;

    fn freeze(&self) -> Result<Self::Frozen>;
}

fn frozen_snapshot(realm: &Realm) -> Result<Arc<Snapshot>> {
    if realm.is_in_write_transaction() {
        return Err(LiveError::FreezeInWriteTransaction);
    }
    Ok(realm.snapshot())
}

/// A whole database frozen at one version.
#[derive(Clone)]
pub struct FrozenRealm {
    db: Database,
    snapshot: Arc<Snapshot>,
}

impl fmt::Debug for FrozenRealm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrozenRealm")
            .field("database", &self.db.id())
            .field("version", &self.snapshot.version())
            .finish()
    }
}

impl FrozenRealm {
    pub fn version(&self) -> Version {
        self.snapshot.version()
    }

    pub fn snapshot(&self) -> &Arc<Snapshot> {
        &self.snapshot
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn object(&self, table: &str, key: &str) -> Result<Option<FrozenObject>> {
        self.snapshot.schema().require(table)?;
        let id = ObjectId::new(table, key);
        Ok(self.snapshot.exists(&id).then(|| FrozenObject {
            db: self.db.id(),
            snapshot: Arc::clone(&self.snapshot),
            id,
        }))
    }

    pub fn objects(&self, table: &str) -> Result<FrozenCollection> {
        self.query(Query::new(table))
    }

    pub fn query(&self, query: Query) -> Result<FrozenCollection> {
        let compiled = compile(self.snapshot.schema(), &query)?;
        Ok(FrozenCollection {
            db: self.db.id(),
            snapshot: Arc::clone(&self.snapshot),
            source: CollectionSource::Results(compiled),
        })
    }
}

/// An object frozen at one version.
#[derive(Clone)]
pub struct FrozenObject {
    db: Uuid,
    snapshot: Arc<Snapshot>,
    id: ObjectId,
}

impl fmt::Debug for FrozenObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrozenObject")
            .field("database", &self.db)
            .field("id", &self.id)
            .field("version", &self.snapshot.version())
            .finish()
    }
}

impl PartialEq for FrozenObject {
    fn eq(&self, other: &Self) -> bool {
        self.db == other.db && self.id == other.id && self.version() == other.version()
    }
}

impl FrozenObject {
    pub fn id(&self) -> &ObjectId {
        &self.id
    }

    pub fn version(&self) -> Version {
        self.snapshot.version()
    }

    pub fn get(&self, property: &str) -> Result<Value> {
        read_value(&self.snapshot, &self.id, property)
    }

    pub fn get_as<T: DeserializeOwned>(&self, property: &str) -> Result<T> {
        decode(property, self.get(property)?)
    }

    pub fn values(&self) -> Result<BTreeMap<String, Value>> {
        read_values(&self.snapshot, &self.id)
    }

    /// A list property, frozen at the same version.
    pub fn list(&self, property: &str) -> Result<FrozenCollection> {
        list_target(self.snapshot.schema(), &self.id.table, property)?;
        Ok(FrozenCollection {
            db: self.db,
            snapshot: Arc::clone(&self.snapshot),
            source: CollectionSource::List {
                owner: self.id.clone(),
                property: property.to_string(),
                filter: None,
            },
        })
    }

    /// Objects linking to this one through `table.property`, frozen at the
    /// same version.
    pub fn linking_objects(&self, table: &str, property: &str) -> Result<FrozenCollection> {
        Ok(FrozenCollection {
            db: self.db,
            snapshot: Arc::clone(&self.snapshot),
            source: linking_source(self.snapshot.schema(), &self.id, table, property)?,
        })
    }

    /// The same object in `realm`, refreshed to at least this version.
    ///
    /// `None` if the object has been deleted since. `realm` must belong to
    /// the database the object was frozen from.
    pub fn thaw(&self, realm: &Realm) -> Result<Option<LiveObject>> {
        realm.database().ensure_is(self.db)?;
        realm.ensure_at_least(self.version())?;
        realm.object(&self.id.table, &self.id.key)
    }
}

/// A collection frozen at one version.
#[derive(Clone)]
pub struct FrozenCollection {
    db: Uuid,
    snapshot: Arc<Snapshot>,
    source: CollectionSource,
}

impl fmt::Debug for FrozenCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrozenCollection")
            .field("database", &self.db)
            .field("source", &self.source)
            .field("version", &self.snapshot.version())
            .finish()
    }
}

impl PartialEq for FrozenCollection {
    fn eq(&self, other: &Self) -> bool {
        self.db == other.db && self.source == other.source && self.version() == other.version()
    }
}

impl FrozenCollection {
    pub fn version(&self) -> Version {
        self.snapshot.version()
    }

    pub fn source(&self) -> &CollectionSource {
        &self.source
    }

    /// The same collection in `realm`, refreshed to at least this version.
    ///
    /// `None` if the owner of a list has been deleted since.
    pub fn thaw(&self, realm: &Realm) -> Result<Option<LiveCollection>> {
        realm.database().ensure_is(self.db)?;
        realm.ensure_at_least(self.version())?;
        let valid = realm.with_view(|view| self.source.is_valid_at(view));
        Ok(valid.then(|| LiveCollection::new(realm.clone(), self.source.clone())))
    }
}

impl Collection for FrozenCollection {
    type Element = FrozenObject;

    fn ids(&self) -> Result<Vec<ObjectId>> {
        self.source
            .ids(&self.snapshot)
            .ok_or(LiveError::InvalidatedObject)
    }

    fn element(&self, id: ObjectId) -> FrozenObject {
        FrozenObject {
            db: self.db,
            snapshot: Arc::clone(&self.snapshot),
            id,
        }
    }
}

impl Freeze for Realm {
    type Frozen = FrozenRealm;

    fn freeze(&self) -> Result<FrozenRealm> {
        Ok(FrozenRealm {
            db: self.database().clone(),
            snapshot: frozen_snapshot(self)?,
        })
    }
}

impl Freeze for LiveObject {
    type Frozen = FrozenObject;

    fn freeze(&self) -> Result<FrozenObject> {
        let snapshot = frozen_snapshot(self.realm())?;
        if !snapshot.exists(self.id()) {
            return Err(LiveError::InvalidatedObject);
        }
        Ok(FrozenObject {
            db: self.realm().database().id(),
            snapshot,
            id: self.id().clone(),
        })
    }
}

impl Freeze for LiveCollection {
    type Frozen = FrozenCollection;

    fn freeze(&self) -> Result<FrozenCollection> {
        let snapshot = frozen_snapshot(self.realm())?;
        if !self.source().is_valid_at(&snapshot) {
            return Err(LiveError::InvalidatedObject);
        }
        Ok(FrozenCollection {
            db: self.realm().database().id(),
            snapshot,
            source: self.source().clone(),
        })
    }
}

impl Freeze for FrozenRealm {
    type Frozen = FrozenRealm;

    fn freeze(&self) -> Result<FrozenRealm> {
        Ok(self.clone())
    }
}

impl Freeze for FrozenObject {
    type Frozen = FrozenObject;

    fn freeze(&self) -> Result<FrozenObject> {
        Ok(self.clone())
    }
}

impl Freeze for FrozenCollection {
    type Frozen = FrozenCollection;

    fn freeze(&self) -> Result<FrozenCollection> {
        Ok(self.clone())
    }
}

impl<O: Freeze> Freeze for ObjectChange<O> {
    type Frozen = ObjectChange<O::Frozen>;

    fn freeze(&self) -> Result<Self::Frozen> {
        Ok(match self {
            ObjectChange::Initial(o) => ObjectChange::Initial(o.freeze()?),
            ObjectChange::Change(o, properties) => ObjectChange::Change(o.freeze()?, properties.clone()),
            ObjectChange::Deleted => ObjectChange::Deleted,
            ObjectChange::Error(e) => ObjectChange::Error(e.clone()),
        })
    }
}

impl<C: Freeze> Freeze for CollectionChange<C> {
    type Frozen = CollectionChange<C::Frozen>;

    fn freeze(&self) -> Result<Self::Frozen> {
        Ok(match self {
            CollectionChange::Initial(c) => CollectionChange::Initial(c.freeze()?),
            CollectionChange::Update(c, changes) => CollectionChange::Update(c.freeze()?, changes.clone()),
            CollectionChange::Deleted => CollectionChange::Deleted,
            CollectionChange::Error(e) => CollectionChange::Error(e.clone()),
        })
    }
}

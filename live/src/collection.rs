//! Live collections: query results, list properties and the objects
//! linking to an object.

use crate::changeset::CollectionChange;
use crate::error::{LiveError, Result};
use crate::object::LiveObject;
use crate::publisher::{self, Publisher};
use crate::realm::Realm;
use crate::registry::{Delivery, KeyPathFilter, NotificationToken, ObserverTarget};
use ripple_engine::{
    compile, CompiledQuery, Expr, ObjectId, PropertyType, Query, Record, Schema, Snapshot,
};
use serde_json::Value;
use std::fmt;

/// Where the elements of a collection come from.
///
/// A source is plain data: it can be evaluated against any snapshot of the
/// same database, which is what lets collections be frozen, handed over and
/// diffed off-thread.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CollectionSource {
    /// Objects matching a query
    Results(CompiledQuery),
    /// The keys held by a list property, optionally filtered
    List {
        owner: ObjectId,
        property: String,
        filter: Option<CompiledQuery>,
    },
    /// Objects of `table` whose link or list `property` points at `target`,
    /// in insertion order, optionally filtered
    LinkingObjects {
        target: ObjectId,
        table: String,
        property: String,
        filter: Option<CompiledQuery>,
    },
}

impl CollectionSource {
    /// Element identities at `snapshot`, in collection order.
    ///
    /// `None` when the list owner or link target does not exist at that
    /// version.
    pub fn ids(&self, snapshot: &Snapshot) -> Option<Vec<ObjectId>> {
        match self {
            CollectionSource::Results(query) => Some(query.evaluate(snapshot)),
            CollectionSource::List {
                owner,
                property,
                filter,
            } => {
                let record = snapshot.get(owner)?;
                let target = snapshot
                    .schema()
                    .get_object(&owner.table)?
                    .descriptor(property)?
                    .target
                    .clone()?;
                let ids = record
                    .list(property)
                    .into_iter()
                    .map(|key| ObjectId::new(target.clone(), key));
                Some(match filter {
                    Some(query) => ids
                        .filter(|id| {
                            snapshot
                                .get(id)
                                .is_some_and(|record| query.matches(snapshot, record))
                        })
                        .collect(),
                    None => ids.collect(),
                })
            }
            CollectionSource::LinkingObjects {
                target,
                table,
                property,
                filter,
            } => {
                if !snapshot.exists(target) {
                    return None;
                }
                Some(
                    snapshot
                        .records(table)
                        .into_iter()
                        .filter(|record| links_to(record, property, &target.key))
                        .filter(|record| filter.as_ref().map_or(true, |q| q.matches(snapshot, record)))
                        .map(|record| record.id.clone())
                        .collect(),
                )
            }
        }
    }

    /// Table the elements live in.
    pub fn element_table(&self, schema: &Schema) -> Result<String> {
        match self {
            CollectionSource::Results(query) => Ok(query.table().to_string()),
            CollectionSource::List {
                owner, property, ..
            } => list_target(schema, &owner.table, property),
            CollectionSource::LinkingObjects { table, .. } => Ok(table.clone()),
        }
    }

    /// Whether the collection can still be read at `snapshot`.
    pub(crate) fn is_valid_at(&self, snapshot: &Snapshot) -> bool {
        match self {
            CollectionSource::Results(_) => true,
            CollectionSource::List { owner, .. } => snapshot.exists(owner),
            CollectionSource::LinkingObjects { target, .. } => snapshot.exists(target),
        }
    }

    /// Narrow the source with another predicate.
    pub(crate) fn filtered(&self, schema: &Schema, predicate: Expr) -> Result<CollectionSource> {
        let narrowed = |filter: &Option<CompiledQuery>| -> Result<Option<CompiledQuery>> {
            let query = match filter {
                Some(existing) => existing.query().clone().filter(predicate.clone()),
                None => Query::new(self.element_table(schema)?).filter(predicate.clone()),
            };
            Ok(Some(compile(schema, &query)?))
        };

        Ok(match self {
            CollectionSource::Results(query) => CollectionSource::Results(compile(
                schema,
                &query.query().clone().filter(predicate.clone()),
            )?),
            CollectionSource::List {
                owner,
                property,
                filter,
            } => CollectionSource::List {
                owner: owner.clone(),
                property: property.clone(),
                filter: narrowed(filter)?,
            },
            CollectionSource::LinkingObjects {
                target,
                table,
                property,
                filter,
            } => CollectionSource::LinkingObjects {
                target: target.clone(),
                table: table.clone(),
                property: property.clone(),
                filter: narrowed(filter)?,
            },
        })
    }
}

/// Keys held by a link or list property of `record`.
pub(crate) fn linked_keys<'a>(record: &'a Record, property: &str) -> Vec<&'a str> {
    match record.get(property) {
        Some(Value::String(key)) => vec![key.as_str()],
        Some(Value::Array(items)) => items.iter().filter_map(Value::as_str).collect(),
        _ => Vec::new(),
    }
}

fn links_to(record: &Record, property: &str, key: &str) -> bool {
    linked_keys(record, property).contains(&key)
}

/// Source of the objects of `table` linking to `target` through `property`,
/// validating that the property is a link or list of `target`'s table.
pub(crate) fn linking_source(
    schema: &Schema,
    target: &ObjectId,
    table: &str,
    property: &str,
) -> Result<CollectionSource> {
    let descriptor = schema.require(table)?.require(property)?;
    let links = matches!(descriptor.property_type, PropertyType::Link | PropertyType::List);
    if !links || descriptor.target.as_deref() != Some(target.table.as_str()) {
        return Err(ripple_engine::Error::TypeMismatch {
            property: property.to_string(),
            expected: format!("link to {}", target.table),
            got: descriptor.property_type.to_string(),
        }
        .into());
    }
    Ok(CollectionSource::LinkingObjects {
        target: target.clone(),
        table: table.to_string(),
        property: property.to_string(),
        filter: None,
    })
}

/// Target table of a list property, validating that it is one.
pub(crate) fn list_target(schema: &Schema, table: &str, property: &str) -> Result<String> {
    let descriptor = schema.require(table)?.require(property)?;
    match (&descriptor.property_type, &descriptor.target) {
        (PropertyType::List, Some(target)) => Ok(target.clone()),
        _ => Err(ripple_engine::Error::TypeMismatch {
            property: property.to_string(),
            expected: PropertyType::List.to_string(),
            got: descriptor.property_type.to_string(),
        }
        .into()),
    }
}

/// Read access shared by live and frozen collections.
pub trait Collection {
    /// Handle type of one element
    type Element;

    /// Element identities in collection order.
    fn ids(&self) -> Result<Vec<ObjectId>>;

    /// Wrap an element identity in this collection's handle type.
    fn element(&self, id: ObjectId) -> Self::Element;

    fn len(&self) -> Result<usize> {
        Ok(self.ids()?.len())
    }

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// The element at `index`, if in bounds.
    fn get(&self, index: usize) -> Result<Option<Self::Element>> {
        Ok(self
            .ids()?
            .into_iter()
            .nth(index)
            .map(|id| self.element(id)))
    }

    /// Every element, in order.
    fn elements(&self) -> Result<Vec<Self::Element>> {
        Ok(self
            .ids()?
            .into_iter()
            .map(|id| self.element(id))
            .collect())
    }
}

/// A collection bound to a realm. Reads always see the realm's current
/// version.
#[derive(Clone)]
pub struct LiveCollection {
    realm: Realm,
    source: CollectionSource,
}

impl fmt::Debug for LiveCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveCollection")
            .field("realm", &self.realm.id())
            .field("source", &self.source)
            .finish()
    }
}

impl PartialEq for LiveCollection {
    fn eq(&self, other: &Self) -> bool {
        self.realm.id() == other.realm.id() && self.source == other.source
    }
}

impl LiveCollection {
    pub(crate) fn new(realm: Realm, source: CollectionSource) -> Self {
        Self { realm, source }
    }

    pub fn source(&self) -> &CollectionSource {
        &self.source
    }

    pub fn realm(&self) -> &Realm {
        &self.realm
    }

    /// Whether the list owner or link target is gone.
    pub fn is_invalidated(&self) -> bool {
        self.realm.with_view(|view| !self.source.is_valid_at(view))
    }

    /// A new collection holding only the elements matching `predicate`.
    pub fn filter(&self, predicate: Expr) -> Result<LiveCollection> {
        let schema = self.realm.schema();
        let source = self.source.filtered(&schema, predicate)?;
        Ok(LiveCollection::new(self.realm.clone(), source))
    }

    /// Register a change callback.
    ///
    /// With a non-empty `key_paths`, modifications that touch none of the
    /// named element properties are not reported. Insertions and deletions
    /// always are. Dotted paths reach into objects the elements link to.
    pub fn observe<F>(&self, key_paths: &[&str], mut callback: F) -> Result<NotificationToken>
    where
        F: FnMut(CollectionChange<LiveCollection>) + Send + 'static,
    {
        let schema = self.realm.schema();
        let table = self.source.element_table(&schema)?;
        let filter = KeyPathFilter::for_paths(&schema, &table, key_paths)?;
        if !self.realm.with_view(|view| self.source.is_valid_at(view)) {
            return Err(LiveError::InvalidatedObject);
        }

        let source = self.source.clone();
        self.realm.add_observer(
            ObserverTarget::Collection(self.source.clone()),
            filter,
            Box::new(move |realm, delivery| {
                let collection = LiveCollection::new(realm.clone(), source.clone());
                callback(match delivery {
                    Delivery::Initial => CollectionChange::Initial(collection),
                    Delivery::Changed(changes) => CollectionChange::Update(collection, changes),
                    Delivery::Deleted => CollectionChange::Deleted,
                    Delivery::Error(e) => CollectionChange::Error(e),
                })
            }),
        )
    }

    /// Stream of change events, starting with `Initial`.
    pub fn changeset_publisher(&self, key_paths: &[&str]) -> Publisher<CollectionChange<LiveCollection>> {
        publisher::changesets(self, key_paths)
    }

    /// Stream of the collection itself, once per delivered version.
    pub fn value_publisher(&self, key_paths: &[&str]) -> Publisher<LiveCollection> {
        publisher::values(self, key_paths)
    }
}

impl Collection for LiveCollection {
    type Element = LiveObject;

    fn ids(&self) -> Result<Vec<ObjectId>> {
        self.realm
            .with_view(|view| self.source.ids(view))
            .ok_or(LiveError::InvalidatedObject)
    }

    fn element(&self, id: ObjectId) -> LiveObject {
        LiveObject::new(self.realm.clone(), id)
    }
}

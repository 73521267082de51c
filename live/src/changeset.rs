//! Change sets and the events delivered to observers.

use crate::error::LiveError;
use crate::registry::KeyPathFilter;
use serde::Serialize;
use serde_json::Value;

/// One property that differs between two versions of an object.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyChange {
    /// Property name
    pub name: String,
    /// Value at the prior version. Absent when no prior value is known.
    pub old_value: Option<Value>,
    /// Value at the new version. Absent when the object was deleted.
    pub new_value: Option<Value>,
}

/// The difference between two versions of an object or collection.
///
/// Deletion indices refer to the prior ordering; insertion and
/// `modifications_new` indices refer to the new ordering. All index lists
/// are sorted. `property_diffs` is only populated for single objects.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSet {
    pub insertions: Vec<usize>,
    pub deletions: Vec<usize>,
    pub modifications_old: Vec<usize>,
    pub modifications_new: Vec<usize>,
    pub property_diffs: Vec<PropertyChange>,
    /// Descriptor indices changed by each modification, parallel to
    /// `modifications_old`
    #[serde(skip)]
    pub(crate) modified_properties: Vec<Vec<usize>>,
}

impl ChangeSet {
    /// Whether nothing changed.
    pub fn is_empty(&self) -> bool {
        self.insertions.is_empty()
            && self.deletions.is_empty()
            && self.modifications_old.is_empty()
            && self.property_diffs.is_empty()
    }

    /// Whether elements were added or removed.
    pub fn has_structural_changes(&self) -> bool {
        !self.insertions.is_empty() || !self.deletions.is_empty()
    }

    /// Modified elements as `(old index, new index)` pairs.
    pub fn modifications(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.modifications_old
            .iter()
            .copied()
            .zip(self.modifications_new.iter().copied())
    }

    /// Narrow the change set to what a key-path filter cares about.
    ///
    /// Insertions and deletions are always kept. Property diffs and element
    /// modifications survive only if they touch a filtered property.
    pub fn filtered(&self, filter: &KeyPathFilter) -> ChangeSet {
        let mut out = ChangeSet {
            insertions: self.insertions.clone(),
            deletions: self.deletions.clone(),
            property_diffs: self
                .property_diffs
                .iter()
                .filter(|p| filter.contains_name(&p.name))
                .cloned()
                .collect(),
            ..ChangeSet::default()
        };

        for (k, (old, new)) in self.modifications().enumerate() {
            let touched = self
                .modified_properties
                .get(k)
                .is_some_and(|props| props.iter().any(|i| filter.contains_index(*i)));
            if touched {
                out.modifications_old.push(old);
                out.modifications_new.push(new);
                out.modified_properties
                    .push(self.modified_properties[k].clone());
            }
        }

        out
    }
}

/// An event delivered to an object observer.
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectChange<O> {
    /// First delivery, carrying the current state
    Initial(O),
    /// One or more properties changed
    Change(O, Vec<PropertyChange>),
    /// The object was deleted. No further events follow.
    Deleted,
    /// The database failed. No further events follow.
    Error(LiveError),
}

impl<O> ObjectChange<O> {
    /// The object carried by the event, if any.
    pub fn object(&self) -> Option<&O> {
        match self {
            ObjectChange::Initial(o) | ObjectChange::Change(o, _) => Some(o),
            ObjectChange::Deleted | ObjectChange::Error(_) => None,
        }
    }

    /// Changed properties, empty for anything but `Change`.
    pub fn properties(&self) -> &[PropertyChange] {
        match self {
            ObjectChange::Change(_, properties) => properties,
            _ => &[],
        }
    }

    /// Convert the carried object, failing the whole event on error.
    pub fn try_map<U, F>(self, f: F) -> crate::Result<ObjectChange<U>>
    where
        F: FnOnce(O) -> crate::Result<U>,
    {
        Ok(match self {
            ObjectChange::Initial(o) => ObjectChange::Initial(f(o)?),
            ObjectChange::Change(o, properties) => ObjectChange::Change(f(o)?, properties),
            ObjectChange::Deleted => ObjectChange::Deleted,
            ObjectChange::Error(e) => ObjectChange::Error(e),
        })
    }
}

/// An event delivered to a collection observer.
#[derive(Debug, Clone, PartialEq)]
pub enum CollectionChange<C> {
    /// First delivery, carrying the current contents
    Initial(C),
    /// The collection changed
    Update(C, ChangeSet),
    /// The object owning a list was deleted. No further events follow.
    Deleted,
    /// The database failed. No further events follow.
    Error(LiveError),
}

impl<C> CollectionChange<C> {
    /// The collection carried by the event, if any.
    pub fn collection(&self) -> Option<&C> {
        match self {
            CollectionChange::Initial(c) | CollectionChange::Update(c, _) => Some(c),
            CollectionChange::Deleted | CollectionChange::Error(_) => None,
        }
    }

    /// The change set, if this is an update.
    pub fn changes(&self) -> Option<&ChangeSet> {
        match self {
            CollectionChange::Update(_, changes) => Some(changes),
            _ => None,
        }
    }

    /// Convert the carried collection, failing the whole event on error.
    pub fn try_map<U, F>(self, f: F) -> crate::Result<CollectionChange<U>>
    where
        F: FnOnce(C) -> crate::Result<U>,
    {
        Ok(match self {
            CollectionChange::Initial(c) => CollectionChange::Initial(f(c)?),
            CollectionChange::Update(c, changes) => CollectionChange::Update(f(c)?, changes),
            CollectionChange::Deleted => CollectionChange::Deleted,
            CollectionChange::Error(e) => CollectionChange::Error(e),
        })
    }
}

/// Database-level notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RealmNotification {
    /// The instance advanced to a new version
    DidChange,
}

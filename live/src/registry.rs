//! Observer registry and notification tokens.
//!
//! Each realm owns one [`Registry`]. Observers are kept in registration
//! order, which is also the order callbacks run in for a given version.

use crate::changeset::ChangeSet;
use crate::collection::CollectionSource;
use crate::error::{LiveError, Result};
use crate::realm::Realm;
use parking_lot::Mutex;
use ripple_engine::{ObjectId, PropertyType, Schema, Snapshot};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// A path through link and list properties to a property of the linked
/// objects, e.g. `dogs.age` on owners.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct KeyPath {
    /// Descriptor index of the first property on the observed table
    pub(crate) root: usize,
    /// Each link or list property followed, with the table it points to
    pub(crate) links: Vec<(String, String)>,
    /// Property read on the objects at the end of the chain
    pub(crate) leaf: String,
}

/// The properties an observer cares about.
///
/// A dotted path such as `friend.age` selects its first property, and a
/// change to `age` on any object reached through `friend` counts as a change
/// to `friend`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPathFilter {
    names: BTreeSet<String>,
    indices: BTreeSet<usize>,
    linked: BTreeSet<KeyPath>,
}

impl KeyPathFilter {
    /// Resolve key paths of `table` against the schema.
    ///
    /// Every step but the last must be a link or list property. An unknown
    /// step is reported against the table it was looked up on.
    pub fn resolve(schema: &Schema, table: &str, names: &[&str]) -> Result<Self> {
        let object_schema = schema.require(table)?;
        let mut filter = KeyPathFilter {
            names: BTreeSet::new(),
            indices: BTreeSet::new(),
            linked: BTreeSet::new(),
        };

        for name in names {
            let unknown = |table: &str| LiveError::UnknownKeyPath {
                table: table.to_string(),
                property: name.to_string(),
            };
            let mut steps = name.split('.');
            let first = steps.next().unwrap_or_default();
            let root = object_schema
                .property_index(first)
                .ok_or_else(|| unknown(table))?;

            let mut current = object_schema;
            let mut property = first;
            let mut links = Vec::new();
            for step in steps {
                let descriptor = current
                    .properties
                    .iter()
                    .find(|d| d.name == property)
                    .ok_or_else(|| unknown(current.name.as_str()))?;
                let target = match (descriptor.property_type, &descriptor.target) {
                    (PropertyType::Link | PropertyType::List, Some(target)) => target,
                    _ => return Err(unknown(current.name.as_str())),
                };
                links.push((property.to_string(), target.clone()));
                current = schema
                    .get_object(target)
                    .ok_or_else(|| unknown(target.as_str()))?;
                if current.property_index(step).is_none() {
                    return Err(unknown(current.name.as_str()));
                }
                property = step;
            }

            if !links.is_empty() {
                filter.linked.insert(KeyPath {
                    root,
                    links,
                    leaf: property.to_string(),
                });
            }
            filter.names.insert(first.to_string());
            filter.indices.insert(root);
        }

        Ok(filter)
    }

    /// `None` for an empty list, meaning "every property".
    pub(crate) fn for_paths(schema: &Schema, table: &str, names: &[&str]) -> Result<Option<Self>> {
        if names.is_empty() {
            return Ok(None);
        }
        Self::resolve(schema, table, names).map(Some)
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn contains_index(&self, index: usize) -> bool {
        self.indices.contains(&index)
    }

    /// Paths that reach into linked objects.
    pub(crate) fn linked(&self) -> impl Iterator<Item = &KeyPath> {
        self.linked.iter()
    }
}

/// Identifier of a registered observer, unique within its realm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverId(u64);

/// What an observer watches.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum ObserverTarget {
    Object(ObjectId),
    Collection(CollectionSource),
    Realm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    /// Waiting for the initial delivery
    Registered,
    /// Initial delivery done, receiving changes
    Delivering,
    /// Terminal
    Invalidated,
}

pub(crate) struct ObserverState {
    pub(crate) phase: Phase,
    /// Snapshot of the last delivered version
    pub(crate) last: Option<Arc<Snapshot>>,
}

/// What a callback is handed on each invocation.
#[derive(Debug, Clone)]
pub(crate) enum Delivery {
    Initial,
    Changed(ChangeSet),
    Deleted,
    Error(LiveError),
}

pub(crate) type Callback = Box<dyn FnMut(&Realm, Delivery) + Send>;

pub(crate) struct Observer {
    pub(crate) id: ObserverId,
    pub(crate) target: ObserverTarget,
    pub(crate) filter: Option<KeyPathFilter>,
    pub(crate) state: Mutex<ObserverState>,
    callback: Mutex<Callback>,
    cancelled: AtomicBool,
}

impl Observer {
    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Run the callback unless the observer was cancelled in the meantime.
    ///
    /// The flag is checked again under the callback lock: a cancellation
    /// that lands while this call waits for the lock is still honoured.
    pub(crate) fn invoke(&self, realm: &Realm, delivery: Delivery) {
        if self.is_cancelled() {
            return;
        }
        let mut callback = self.callback.lock();
        if self.is_cancelled() {
            return;
        }
        callback(realm, delivery);
    }

    /// Move to the terminal phase. Returns `false` if already there.
    pub(crate) fn invalidate(&self) -> bool {
        self.cancelled.store(true, Ordering::Release);
        let mut state = self.state.lock();
        if state.phase == Phase::Invalidated {
            return false;
        }
        state.phase = Phase::Invalidated;
        state.last = None;
        true
    }
}

impl fmt::Debug for Observer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observer")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("phase", &self.state.lock().phase)
            .finish()
    }
}

/// Live observers of one realm.
#[derive(Default)]
pub(crate) struct Registry {
    observers: Mutex<BTreeMap<ObserverId, Arc<Observer>>>,
    next_id: AtomicU64,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(
        &self,
        target: ObserverTarget,
        filter: Option<KeyPathFilter>,
        callback: Callback,
    ) -> Arc<Observer> {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let observer = Arc::new(Observer {
            id,
            target,
            filter,
            state: Mutex::new(ObserverState {
                phase: Phase::Registered,
                last: None,
            }),
            callback: Mutex::new(callback),
            cancelled: AtomicBool::new(false),
        });
        self.observers.lock().insert(id, Arc::clone(&observer));
        observer
    }

    pub(crate) fn remove(&self, id: ObserverId) -> bool {
        self.observers.lock().remove(&id).is_some()
    }

    /// Observers in registration order.
    pub(crate) fn snapshot(&self) -> Vec<Arc<Observer>> {
        self.observers.lock().values().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.observers.lock().len()
    }
}

/// Keeps an observer registered. Dropping the token unregisters it.
///
/// Tokens may be invalidated or dropped from any thread. Once
/// [`invalidate`](Self::invalidate) returns, the callback will not be
/// invoked again.
pub struct NotificationToken {
    observer: Arc<Observer>,
    realm: Realm,
}

impl NotificationToken {
    pub(crate) fn new(observer: Arc<Observer>, realm: Realm) -> Self {
        Self { observer, realm }
    }

    /// Unregister the observer. Safe to call more than once.
    pub fn invalidate(&self) {
        let first = self.observer.invalidate();
        self.realm.registry().remove(self.observer.id);
        if first {
            tracing::info!(observer = ?self.observer.id, realm = %self.realm.id(), "Observer unregistered");
        }
    }

    pub fn is_invalidated(&self) -> bool {
        self.observer.is_cancelled()
    }

    pub(crate) fn observer(&self) -> &Arc<Observer> {
        &self.observer
    }

    pub(crate) fn realm(&self) -> &Realm {
        &self.realm
    }
}

impl fmt::Debug for NotificationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationToken")
            .field("observer", &self.observer.id)
            .field("invalidated", &self.is_invalidated())
            .finish()
    }
}

impl Drop for NotificationToken {
    fn drop(&mut self) {
        self.invalidate();
    }
}

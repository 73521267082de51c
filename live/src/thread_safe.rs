//! Handing confined objects to other threads and queues.
//!
//! Live handles never cross confinement contexts. Instead, a handle's
//! identity is captured on the source side and re-resolved in the
//! destination realm, which is refreshed to at least the captured version
//! first.

use crate::collection::{CollectionSource, LiveCollection};
use crate::database::Database;
use crate::error::{LiveError, Result};
use crate::object::LiveObject;
use crate::queue::Confinement;
use crate::realm::{Realm, RealmInner};
use parking_lot::Mutex;
use ripple_engine::{ObjectId, Snapshot, Version};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Weak};
use uuid::Uuid;

/// A confined handle that can be captured and re-resolved elsewhere.
pub trait ThreadConfined: Sized {
    /// What survives the trip between contexts
    type Identity: Clone + Send + Sync + 'static;

    fn realm(&self) -> &Realm;

    fn is_invalidated(&self) -> bool;

    /// Capture the identity. Fails for objects that only exist in an
    /// uncommitted write transaction, or that no longer exist.
    fn capture(&self) -> Result<Self::Identity>;

    /// Look the identity up in `realm` at its current version.
    fn resolve_in(identity: &Self::Identity, realm: &Realm) -> Result<Option<Self>>;
}

impl ThreadConfined for LiveObject {
    type Identity = ObjectId;

    fn realm(&self) -> &Realm {
        LiveObject::realm(self)
    }

    fn is_invalidated(&self) -> bool {
        LiveObject::is_invalidated(self)
    }

    fn capture(&self) -> Result<ObjectId> {
        let realm = LiveObject::realm(self);
        if realm.snapshot().exists(self.id()) {
            return Ok(self.id().clone());
        }
        if realm.with_view(|view| view.exists(self.id())) {
            return Err(LiveError::UnmanagedObject);
        }
        Err(LiveError::InvalidatedReference(format!(
            "object {} has been deleted",
            self.id()
        )))
    }

    fn resolve_in(identity: &ObjectId, realm: &Realm) -> Result<Option<Self>> {
        realm.object(&identity.table, &identity.key)
    }
}

impl ThreadConfined for LiveCollection {
    type Identity = CollectionSource;

    fn realm(&self) -> &Realm {
        LiveCollection::realm(self)
    }

    fn is_invalidated(&self) -> bool {
        LiveCollection::is_invalidated(self)
    }

    fn capture(&self) -> Result<CollectionSource> {
        let realm = LiveCollection::realm(self);
        if self.source().is_valid_at(&realm.snapshot()) {
            return Ok(self.source().clone());
        }
        if realm.with_view(|view| self.source().is_valid_at(view)) {
            return Err(LiveError::UnmanagedObject);
        }
        Err(LiveError::InvalidatedReference(
            "list owner has been deleted".into(),
        ))
    }

    fn resolve_in(identity: &CollectionSource, realm: &Realm) -> Result<Option<Self>> {
        let valid = realm.with_view(|view| identity.is_valid_at(view));
        Ok(valid.then(|| LiveCollection::new(realm.clone(), identity.clone())))
    }
}

impl ThreadConfined for Realm {
    type Identity = ();

    fn realm(&self) -> &Realm {
        self
    }

    fn is_invalidated(&self) -> bool {
        false
    }

    fn capture(&self) -> Result<()> {
        Ok(())
    }

    fn resolve_in(_: &(), realm: &Realm) -> Result<Option<Self>> {
        Ok(Some(realm.clone()))
    }
}

/// A one-shot handle for moving a confined value to another context.
///
/// The reference pins the version it was created at until it is resolved
/// or dropped. It can be resolved exactly once.
pub struct ThreadSafeReference<T: ThreadConfined> {
    db: Uuid,
    identity: Mutex<Option<T::Identity>>,
    snapshot: Arc<Snapshot>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: ThreadConfined> fmt::Debug for ThreadSafeReference<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadSafeReference")
            .field("database", &self.db)
            .field("version", &self.snapshot.version())
            .field("resolved", &self.identity.lock().is_none())
            .finish()
    }
}

impl<T: ThreadConfined> ThreadSafeReference<T> {
    /// Capture `value` on its own context.
    pub fn new(value: &T) -> Result<Self> {
        let identity = value.capture()?;
        Ok(Self {
            db: value.realm().database().id(),
            identity: Mutex::new(Some(identity)),
            snapshot: value.realm().snapshot(),
            _marker: PhantomData,
        })
    }

    /// The version the reference was created at.
    pub fn version(&self) -> Version {
        self.snapshot.version()
    }

    /// Resolve in `realm`, refreshing it first if it is behind.
    ///
    /// `None` if the value was deleted in the meantime. A second call fails
    /// with [`LiveError::InvalidatedReference`]. A realm of another database
    /// is rejected without consuming the reference.
    pub fn resolve(&self, realm: &Realm) -> Result<Option<T>> {
        realm.database().ensure_is(self.db)?;
        let identity = self
            .identity
            .lock()
            .take()
            .ok_or_else(|| LiveError::InvalidatedReference("reference already resolved".into()))?;
        realm.ensure_at_least(self.version())?;
        T::resolve_in(&identity, realm)
    }
}

struct ThreadSafeState<T: ThreadConfined> {
    identity: Option<(T::Identity, Version)>,
    /// Realms that already caught up with `identity`, per context. Held
    /// weakly so a slot never keeps a finished thread's realm alive.
    resolved: HashMap<Confinement, Weak<RealmInner>>,
}

/// A shareable slot holding a confined value.
///
/// Unlike [`ThreadSafeReference`], it can be read any number of times from
/// any context; each context lazily gets its own live handle.
pub struct ThreadSafe<T: ThreadConfined> {
    db: Database,
    state: Mutex<ThreadSafeState<T>>,
}

impl<T: ThreadConfined> fmt::Debug for ThreadSafe<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ThreadSafe")
            .field("database", &self.db.id())
            .field("version", &state.identity.as_ref().map(|(_, v)| *v))
            .field("contexts", &state.resolved.len())
            .finish()
    }
}

impl<T: ThreadConfined + Clone> ThreadSafe<T> {
    pub fn new(value: &T) -> Result<Self> {
        let slot = Self::empty(value.realm().database());
        slot.set(Some(value))?;
        Ok(slot)
    }

    pub fn empty(db: &Database) -> Self {
        Self {
            db: db.clone(),
            state: Mutex::new(ThreadSafeState {
                identity: None,
                resolved: HashMap::new(),
            }),
        }
    }

    /// The value as seen from the calling context.
    ///
    /// `None` if the slot is empty or the value no longer exists.
    pub fn get(&self) -> Result<Option<T>> {
        let confinement = Confinement::current();
        let (identity, version, known) = {
            let mut state = self.state.lock();
            state.resolved.retain(|_, realm| realm.strong_count() > 0);
            let Some((identity, version)) = &state.identity else {
                return Ok(None);
            };
            let known = state.resolved.get(&confinement).and_then(Weak::upgrade);
            (identity.clone(), *version, known)
        };

        let realm = match known {
            Some(inner) => Realm::from_inner(inner),
            None => {
                let realm = self.db.realm()?;
                realm.ensure_at_least(version)?;
                let mut state = self.state.lock();
                // A concurrent `set` may have moved the slot on meanwhile
                if state.identity.as_ref().map(|(_, v)| *v) == Some(version) {
                    state.resolved.insert(confinement, realm.downgrade());
                }
                drop(state);
                realm
            }
        };
        T::resolve_in(&identity, &realm)
    }

    /// Replace the held value. Every context resolves the new value on its
    /// next read.
    pub fn set(&self, value: Option<&T>) -> Result<()> {
        let identity = match value {
            Some(value) => {
                self.db.ensure_is(value.realm().database().id())?;
                Some((value.capture()?, value.realm().version()))
            }
            None => None,
        };
        let mut state = self.state.lock();
        state.identity = identity;
        state.resolved.clear();
        Ok(())
    }
}

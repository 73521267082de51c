//! Store - the multi-version state container.
//!
//! The store publishes a new immutable [`Snapshot`] for every commit. Readers
//! pin versions by holding the `Arc<Snapshot>`; the store itself only keeps
//! weak references to older versions, so a version disappears as soon as
//! nothing pins it.
//!
//! There is a single writer slot. [`Store::begin_write`] blocks until it is
//! free and the returned [`WriteTransaction`] holds it until it is committed,
//! cancelled or dropped.

use crate::{
    error::Result, CommitLog, Error, ObjectId, Schema, Snapshot, Version, WriteTransaction,
};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Store tuning.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreConfig {
    /// Upper bound on simultaneously pinned versions. `None` is unbounded.
    pub max_active_versions: Option<usize>,
}

/// Events delivered to commit listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// A new version was published
    Committed(Version),
    /// The store entered the failed state; nothing further will be committed
    Failed(String),
}

/// The result of a successful commit.
#[derive(Debug, Clone)]
pub struct Commit {
    /// Snapshot the transaction started from
    pub base: Arc<Snapshot>,
    /// The newly published snapshot
    pub snapshot: Arc<Snapshot>,
    /// What the transaction changed
    pub log: CommitLog,
}

impl Commit {
    /// Version produced by the commit.
    pub fn version(&self) -> Version {
        self.snapshot.version()
    }
}

/// Handle returned by [`Store::on_commit`].
pub type ListenerId = u64;

type Listener = Arc<dyn Fn(&StoreEvent) + Send + Sync>;

struct StoreState {
    latest: Arc<Snapshot>,
    history: BTreeMap<Version, Weak<Snapshot>>,
    failed: Option<String>,
}

/// The database engine.
pub struct Store {
    schema: Arc<Schema>,
    config: StoreConfig,
    state: Mutex<StoreState>,
    writer_busy: Mutex<bool>,
    writer_free: Condvar,
    listeners: Mutex<Vec<(ListenerId, Listener)>>,
    next_listener: AtomicU64,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("version", &self.current_version())
            .field("config", &self.config)
            .finish()
    }
}

impl Store {
    /// Create an empty store.
    pub fn new(schema: Schema, config: StoreConfig) -> Arc<Self> {
        let schema = Arc::new(schema);
        let initial = Arc::new(Snapshot::empty(Arc::clone(&schema)));
        let mut history = BTreeMap::new();
        history.insert(initial.version(), Arc::downgrade(&initial));

        Arc::new(Self {
            schema,
            config,
            state: Mutex::new(StoreState {
                latest: initial,
                history,
                failed: None,
            }),
            writer_busy: Mutex::new(false),
            writer_free: Condvar::new(),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(1),
        })
    }

    /// The store schema.
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// The store configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Version of the latest published snapshot.
    pub fn current_version(&self) -> Version {
        self.state.lock().latest.version()
    }

    /// The latest published snapshot.
    pub fn snapshot(&self) -> Result<Arc<Snapshot>> {
        let state = self.state.lock();
        check_failed(&state)?;
        Ok(Arc::clone(&state.latest))
    }

    /// A snapshot at `version`, if anything still pins it.
    pub fn open_at(&self, version: Version) -> Result<Arc<Snapshot>> {
        let state = self.state.lock();
        check_failed(&state)?;
        if state.latest.version() == version {
            return Ok(Arc::clone(&state.latest));
        }
        state
            .history
            .get(&version)
            .and_then(Weak::upgrade)
            .ok_or(Error::VersionUnavailable(version))
    }

    /// Number of versions currently pinned, the latest included.
    pub fn active_versions(&self) -> usize {
        let state = self.state.lock();
        state
            .history
            .values()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    /// Read one property of an object at a given version.
    pub fn read_property(&self, id: &ObjectId, name: &str, version: Version) -> Result<Option<Value>> {
        Ok(self.open_at(version)?.read_property(id, name))
    }

    /// Whether `id` exists at `version`.
    pub fn resolve_identity(&self, id: &ObjectId, version: Version) -> Result<bool> {
        Ok(self.open_at(version)?.exists(id))
    }

    /// Start a write transaction, blocking until the writer slot is free.
    pub fn begin_write(self: &Arc<Self>) -> Result<WriteTransaction> {
        {
            let mut busy = self.writer_busy.lock();
            while *busy {
                self.writer_free.wait(&mut busy);
            }
            *busy = true;
        }

        let base = {
            let state = self.state.lock();
            match check_failed(&state) {
                Ok(()) => Arc::clone(&state.latest),
                Err(e) => {
                    drop(state);
                    self.release_writer();
                    return Err(e);
                }
            }
        };
        Ok(WriteTransaction::new(Arc::clone(self), base))
    }

    /// Publish a transaction as a new version.
    ///
    /// Listeners are notified after the store lock is released but before
    /// the writer slot is, so `Committed` events arrive in version order.
    pub fn commit(&self, txn: WriteTransaction) -> Result<Commit> {
        if !std::ptr::eq(Arc::as_ptr(txn.store()), self) {
            return Err(Error::StoreFailed(
                "transaction belongs to a different store".into(),
            ));
        }

        let commit = {
            let mut state = self.state.lock();
            check_failed(&state)?;

            state.history.retain(|_, w| w.strong_count() > 0);
            if let Some(limit) = self.config.max_active_versions {
                let active = state.history.len() + 1;
                if active > limit {
                    return Err(Error::TooManyActiveVersions { active, limit });
                }
            }

            let (base, working, log) = txn.finish();
            let snapshot = Arc::new(working);
            state
                .history
                .insert(snapshot.version(), Arc::downgrade(&snapshot));
            state.latest = Arc::clone(&snapshot);
            Commit {
                base,
                snapshot,
                log,
            }
        };

        self.emit(&StoreEvent::Committed(commit.version()));
        self.release_writer();
        Ok(commit)
    }

    /// Abandon a transaction.
    pub fn cancel(&self, txn: WriteTransaction) {
        drop(txn);
    }

    /// Register a commit listener.
    pub fn on_commit<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&StoreEvent) + Send + Sync + 'static,
    {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().push((id, Arc::new(listener)));
        id
    }

    /// Remove a commit listener. Returns whether it was registered.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// Put the store into the failed state.
    ///
    /// Every later read or write returns [`Error::StoreFailed`]. Only the
    /// first call notifies listeners.
    pub fn fail(&self, reason: impl Into<String>) {
        let reason = reason.into();
        {
            let mut state = self.state.lock();
            if state.failed.is_some() {
                return;
            }
            state.failed = Some(reason.clone());
        }
        self.emit(&StoreEvent::Failed(reason));
    }

    /// The failure reason, if the store has failed.
    pub fn failure(&self) -> Option<String> {
        self.state.lock().failed.clone()
    }

    pub(crate) fn release_writer(&self) {
        let mut busy = self.writer_busy.lock();
        *busy = false;
        self.writer_free.notify_one();
    }

    fn emit(&self, event: &StoreEvent) {
        // Snapshot the listener list so callbacks may register or remove
        // listeners without deadlocking.
        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener(event);
        }
    }
}

fn check_failed(state: &StoreState) -> Result<()> {
    match &state.failed {
        Some(reason) => Err(Error::StoreFailed(reason.clone())),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ObjectSchema, PropertyDescriptor, PropertyType};
    use serde_json::json;
    use std::thread;
    use std::time::Duration;

    fn test_schema() -> Schema {
        Schema::new(1).with_object(ObjectSchema::new(
            "dogs",
            "name",
            vec![PropertyDescriptor::optional("age", PropertyType::Int)],
        ))
    }

    fn test_store() -> Arc<Store> {
        Store::new(test_schema(), StoreConfig::default())
    }

    #[test]
    fn create_store() {
        let store = test_store();
        assert_eq!(store.current_version(), Version::INITIAL);
        assert_eq!(store.snapshot().unwrap().object_count(), 0);
    }

    #[test]
    fn commit_publishes_new_version() {
        let store = test_store();
        let before = store.snapshot().unwrap();

        let mut txn = store.begin_write().unwrap();
        let rex = txn.create("dogs", json!({"name": "rex", "age": 3})).unwrap();
        let commit = store.commit(txn).unwrap();

        assert_eq!(commit.version(), Version::new(1));
        assert_eq!(commit.base.version(), Version::INITIAL);
        assert!(commit.log.created.contains(&rex));
        assert!(store.snapshot().unwrap().exists(&rex));
        // the old snapshot is unchanged
        assert!(!before.exists(&rex));
    }

    #[test]
    fn cancel_publishes_nothing() {
        let store = test_store();
        let mut txn = store.begin_write().unwrap();
        txn.create("dogs", json!({"name": "rex"})).unwrap();
        store.cancel(txn);

        assert_eq!(store.current_version(), Version::INITIAL);
        // the writer slot was released
        let txn = store.begin_write().unwrap();
        store.cancel(txn);
    }

    #[test]
    fn old_versions_live_while_pinned() {
        let store = test_store();
        let v0 = store.snapshot().unwrap();

        let mut txn = store.begin_write().unwrap();
        txn.create("dogs", json!({"name": "rex"})).unwrap();
        store.commit(txn).unwrap();

        assert!(store.open_at(Version::INITIAL).is_ok());
        assert_eq!(store.active_versions(), 2);
        drop(v0);
        assert!(matches!(
            store.open_at(Version::INITIAL),
            Err(Error::VersionUnavailable(_))
        ));
    }

    #[test]
    fn max_active_versions_bounds_commits() {
        let store = Store::new(
            test_schema(),
            StoreConfig {
                max_active_versions: Some(2),
            },
        );
        let _v0 = store.snapshot().unwrap();

        let mut txn = store.begin_write().unwrap();
        txn.create("dogs", json!({"name": "rex"})).unwrap();
        let _v1 = store.commit(txn).unwrap();

        let mut txn = store.begin_write().unwrap();
        txn.create("dogs", json!({"name": "fido"})).unwrap();
        let result = store.commit(txn);
        assert!(matches!(
            result,
            Err(Error::TooManyActiveVersions { active: 3, limit: 2 })
        ));
        assert_eq!(store.current_version(), Version::new(1));
    }

    #[test]
    fn listeners_see_commits_and_failure() {
        let store = test_store();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let id = store.on_commit(move |e| sink.lock().push(e.clone()));

        let txn = store.begin_write().unwrap();
        store.commit(txn).unwrap();
        store.fail("disk on fire");
        store.fail("again");

        assert_eq!(
            *events.lock(),
            vec![
                StoreEvent::Committed(Version::new(1)),
                StoreEvent::Failed("disk on fire".into())
            ]
        );
        assert!(store.off(id));
        assert!(!store.off(id));
    }

    #[test]
    fn failed_store_rejects_everything() {
        let store = test_store();
        store.fail("boom");
        assert!(matches!(store.snapshot(), Err(Error::StoreFailed(_))));
        assert!(matches!(store.begin_write(), Err(Error::StoreFailed(_))));
        assert_eq!(store.failure().as_deref(), Some("boom"));
    }

    #[test]
    fn read_property_and_resolve_identity() {
        let store = test_store();
        let mut txn = store.begin_write().unwrap();
        let rex = txn.create("dogs", json!({"name": "rex", "age": 3})).unwrap();
        let v1 = store.commit(txn).unwrap().snapshot;

        assert_eq!(
            store.read_property(&rex, "age", v1.version()).unwrap(),
            Some(json!(3))
        );
        assert!(store.resolve_identity(&rex, v1.version()).unwrap());
        assert!(!store
            .resolve_identity(&ObjectId::new("dogs", "ghost"), v1.version())
            .unwrap());
    }

    #[test]
    fn writers_are_serialized() {
        let store = test_store();
        let txn = store.begin_write().unwrap();

        let other = Arc::clone(&store);
        let handle = thread::spawn(move || {
            let mut txn = other.begin_write().unwrap();
            txn.create("dogs", json!({"name": "late"})).unwrap();
            other.commit(txn).unwrap().version()
        });

        thread::sleep(Duration::from_millis(20));
        assert_eq!(store.current_version(), Version::INITIAL);
        store.commit(txn).unwrap();

        assert_eq!(handle.join().unwrap(), Version::new(2));
    }
}

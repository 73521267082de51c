//! Confined database instances.
//!
//! A [`Realm`] is bound to the thread or queue that opened it and holds one
//! pinned snapshot. It only moves to a newer version at well-defined points:
//! an explicit [`Realm::refresh`], the start of a write transaction, the
//! realm's own commit, or (for queue-confined realms) a notification pass
//! dispatched onto its queue.
//!
//! # Delivery
//!
//! Every advance runs the same settle loop: take whatever the background
//! notifier posted, move the snapshot forward, then work out one delivery per
//! observer (initial, change, deletion) before invoking any callback.
//! Callbacks run with no lock held, so they are free to read, write, refresh
//! or drop tokens. A refresh issued from inside a callback only advances the
//! snapshot; the outer loop then delivers the newer version.

use crate::changeset::{ChangeSet, RealmNotification};
use crate::collection::{CollectionSource, LiveCollection};
use crate::database::Database;
use crate::differ::{
    diff_collection, diff_observed, object_change_from_log, with_linked_changes, Delta,
};
use crate::error::{LiveError, Result};
use crate::notifier::Batch;
use crate::object::LiveObject;
use crate::queue::{Confinement, Queue};
use crate::registry::{
    Callback, Delivery, KeyPathFilter, NotificationToken, Observer, ObserverId, ObserverState,
    ObserverTarget, Phase, Registry,
};
use parking_lot::Mutex;
use ripple_engine::{
    compile, Commit, ObjectId, Query, Schema, Snapshot, Store, Version, WriteTransaction,
};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use uuid::Uuid;

/// What a settle pass should advance to.
pub(crate) enum SettleTarget {
    /// The store's latest version
    Latest,
    /// Whatever the notifier posted
    Mailbox,
    /// At least this snapshot
    Snapshot(Arc<Snapshot>),
}

#[derive(Default)]
struct Mailbox {
    batch: Option<Batch>,
    failure: Option<String>,
}

struct RealmState {
    snapshot: Arc<Snapshot>,
    write: Option<WriteTransaction>,
    mailbox: Mailbox,
}

#[derive(Default)]
struct DispatchState {
    /// A batch is posted and not yet consumed
    in_flight: bool,
    /// A notifier pass was skipped while in flight
    stale: bool,
}

pub(crate) struct RealmInner {
    id: Uuid,
    db: Database,
    confinement: Confinement,
    queue: Option<Queue>,
    registry: Registry,
    state: Mutex<RealmState>,
    delivering: AtomicBool,
    dispatch: Mutex<DispatchState>,
}

/// Resets the delivering flag when the outermost delivery finishes.
struct DeliveryGuard<'a>(&'a AtomicBool);

impl<'a> DeliveryGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        (!flag.swap(true, Ordering::AcqRel)).then(|| Self(flag))
    }
}

impl Drop for DeliveryGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

type Deliveries = Vec<(Arc<Observer>, Delivery)>;

enum Pass {
    Deliver(Arc<Snapshot>, Deliveries),
    Failed(String),
}

/// A database instance confined to one thread or queue.
///
/// Cloning yields another handle to the same instance. Every method panics
/// when called from a different confinement context.
#[derive(Clone)]
pub struct Realm {
    inner: Arc<RealmInner>,
}

impl fmt::Debug for Realm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Realm")
            .field("id", &self.inner.id)
            .field("confinement", &self.inner.confinement)
            .finish()
    }
}

impl Realm {
    pub(crate) fn open(db: Database, confinement: Confinement, queue: Option<Queue>) -> Result<Self> {
        let snapshot = db.store().snapshot()?;
        let inner = Arc::new(RealmInner {
            id: Uuid::new_v4(),
            db,
            confinement,
            queue,
            registry: Registry::new(),
            state: Mutex::new(RealmState {
                snapshot,
                write: None,
                mailbox: Mailbox::default(),
            }),
            delivering: AtomicBool::new(false),
            dispatch: Mutex::new(DispatchState::default()),
        });
        tracing::debug!(realm = %inner.id, confinement = %confinement, "Realm opened");
        Ok(Self { inner })
    }

    pub(crate) fn from_inner(inner: Arc<RealmInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<RealmInner> {
        Arc::downgrade(&self.inner)
    }

    /// Identifier of this instance. Stable for its lifetime.
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn database(&self) -> &Database {
        &self.inner.db
    }

    pub fn confinement(&self) -> Confinement {
        self.inner.confinement
    }

    /// The queue this realm is confined to, if any.
    pub fn queue(&self) -> Option<&Queue> {
        self.inner.queue.as_ref()
    }

    pub fn schema(&self) -> Arc<Schema> {
        Arc::clone(self.inner.db.store().schema())
    }

    pub(crate) fn store(&self) -> &Arc<Store> {
        self.inner.db.store()
    }

    pub(crate) fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    fn check(&self) {
        let current = Confinement::current();
        if current != self.inner.confinement {
            panic!(
                "confinement violation: realm belongs to {} but was used from {}",
                self.inner.confinement, current
            );
        }
    }

    /// Version of the pinned snapshot.
    pub fn version(&self) -> Version {
        self.check();
        self.inner.state.lock().snapshot.version()
    }

    /// The pinned snapshot.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.check();
        Arc::clone(&self.inner.state.lock().snapshot)
    }

    /// Run `f` against the current read view: the write transaction's
    /// working state while one is open, the pinned snapshot otherwise.
    pub(crate) fn with_view<R>(&self, f: impl FnOnce(&Snapshot) -> R) -> R {
        self.check();
        let state = self.inner.state.lock();
        match &state.write {
            Some(txn) => f(txn.view()),
            None => f(&state.snapshot),
        }
    }

    pub(crate) fn with_write<R>(
        &self,
        f: impl FnOnce(&mut WriteTransaction) -> ripple_engine::Result<R>,
    ) -> Result<R> {
        self.check();
        let mut state = self.inner.state.lock();
        let txn = state.write.as_mut().ok_or(LiveError::NotInWriteTransaction)?;
        Ok(f(txn)?)
    }

    pub fn is_in_write_transaction(&self) -> bool {
        self.check();
        self.inner.state.lock().write.is_some()
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    /// Open a write transaction, blocking until the writer slot is free.
    ///
    /// The realm first advances to the version the transaction starts from,
    /// delivering any pending notifications.
    pub fn begin_write(&self) -> Result<()> {
        if self.is_in_write_transaction() {
            return Err(LiveError::AlreadyInWriteTransaction);
        }
        let txn = self.store().begin_write()?;
        let base = Arc::clone(txn.base());
        self.inner.state.lock().write = Some(txn);

        self.settle(SettleTarget::Snapshot(base));
        Ok(())
    }

    /// Commit the open write transaction.
    ///
    /// Observers of this realm are notified before this returns.
    pub fn commit_write(&self) -> Result<()> {
        self.check();
        self.commit_skipping(&[])
    }

    /// Commit without notifying the observers behind `tokens`.
    ///
    /// Those observers still move to the new version, so they will not see
    /// this commit later either. Every token must belong to this realm.
    pub fn commit_write_without_notifying(&self, tokens: &[&NotificationToken]) -> Result<()> {
        self.check();
        if tokens.iter().any(|token| token.realm().id() != self.id()) {
            return Err(LiveError::ForeignToken);
        }
        let skip: Vec<ObserverId> = tokens.iter().map(|token| token.observer().id).collect();
        self.commit_skipping(&skip)
    }

    /// Abandon the open write transaction.
    pub fn cancel_write(&self) -> Result<()> {
        self.check();
        let txn = self
            .inner
            .state
            .lock()
            .write
            .take()
            .ok_or(LiveError::NotInWriteTransaction)?;
        self.store().cancel(txn);
        tracing::debug!(realm = %self.inner.id, "Write cancelled");
        Ok(())
    }

    /// Run `body` in a write transaction. Commits on success, cancels on
    /// error.
    pub fn write<R>(&self, body: impl FnOnce(&Realm) -> Result<R>) -> Result<R> {
        self.write_skipping(&[], body)
    }

    /// Like [`write`](Self::write), but commits without notifying `tokens`.
    pub fn write_without_notifying<R>(
        &self,
        tokens: &[&NotificationToken],
        body: impl FnOnce(&Realm) -> Result<R>,
    ) -> Result<R> {
        self.write_skipping(tokens, body)
    }

    fn write_skipping<R>(
        &self,
        tokens: &[&NotificationToken],
        body: impl FnOnce(&Realm) -> Result<R>,
    ) -> Result<R> {
        self.begin_write()?;
        match body(self) {
            Ok(value) => {
                if tokens.is_empty() {
                    self.commit_write()?;
                } else if let Err(e) = self.commit_write_without_notifying(tokens) {
                    if self.is_in_write_transaction() {
                        self.cancel_write()?;
                    }
                    return Err(e);
                }
                Ok(value)
            }
            Err(e) => {
                if self.is_in_write_transaction() {
                    self.cancel_write()?;
                }
                Err(e)
            }
        }
    }

    fn commit_skipping(&self, skip: &[ObserverId]) -> Result<()> {
        let txn = self
            .inner
            .state
            .lock()
            .write
            .take()
            .ok_or(LiveError::NotInWriteTransaction)?;
        let commit = self.store().commit(txn)?;
        tracing::debug!(realm = %self.inner.id, version = %commit.version(), "Write committed");
        self.deliver_commit(&commit, skip);
        Ok(())
    }

    /// Advance to the latest version, delivering notifications.
    ///
    /// Returns whether the version changed. Does nothing inside a write
    /// transaction.
    pub fn refresh(&self) -> Result<bool> {
        if self.is_in_write_transaction() {
            return Ok(false);
        }
        let before = self.version();
        self.settle(SettleTarget::Latest);
        if let Some(reason) = self.store().failure() {
            return Err(ripple_engine::Error::StoreFailed(reason).into());
        }
        Ok(self.version() > before)
    }

    /// Refresh if the pinned version is older than `version`.
    pub(crate) fn ensure_at_least(&self, version: Version) -> Result<()> {
        if self.version() < version && !self.is_in_write_transaction() {
            self.refresh()?;
        }
        Ok(())
    }

    // ========================================================================
    // Objects
    // ========================================================================

    /// Look up an object by primary key.
    pub fn object(&self, table: &str, key: &str) -> Result<Option<LiveObject>> {
        self.schema().require(table)?;
        let id = ObjectId::new(table, key);
        let exists = self.with_view(|view| view.exists(&id));
        Ok(exists.then(|| LiveObject::new(self.clone(), id)))
    }

    /// Every object in a table, in insertion order.
    pub fn objects(&self, table: &str) -> Result<LiveCollection> {
        self.query(Query::new(table))
    }

    /// Objects matching a query.
    pub fn query(&self, query: Query) -> Result<LiveCollection> {
        self.check();
        let compiled = compile(&self.schema(), &query)?;
        Ok(LiveCollection::new(
            self.clone(),
            CollectionSource::Results(compiled),
        ))
    }

    /// Create an object. Requires an open write transaction.
    pub fn create(&self, table: &str, payload: Value) -> Result<LiveObject> {
        let id = self.with_write(|txn| txn.create(table, payload))?;
        Ok(LiveObject::new(self.clone(), id))
    }

    /// Delete an object. Requires an open write transaction, and the
    /// handle must have been obtained from this realm.
    pub fn delete(&self, object: &LiveObject) -> Result<()> {
        if object.realm().id() != self.id() {
            return Err(LiveError::ForeignObject);
        }
        self.with_write(|txn| txn.delete(object.id()))
    }

    // ========================================================================
    // Observation
    // ========================================================================

    /// Register a callback invoked each time this realm advances to a new
    /// version.
    pub fn observe<F>(&self, mut callback: F) -> Result<NotificationToken>
    where
        F: FnMut(RealmNotification, &Realm) + Send + 'static,
    {
        self.add_observer(
            ObserverTarget::Realm,
            None,
            Box::new(move |realm, delivery| {
                if let Delivery::Changed(_) = delivery {
                    callback(RealmNotification::DidChange, realm);
                }
            }),
        )
    }

    pub(crate) fn add_observer(
        &self,
        target: ObserverTarget,
        filter: Option<KeyPathFilter>,
        callback: Callback,
    ) -> Result<NotificationToken> {
        if self.is_in_write_transaction() {
            return Err(LiveError::ObserveInWriteTransaction);
        }

        let is_realm = matches!(target, ObserverTarget::Realm);
        let observer = self.inner.registry.register(target, filter, callback);
        if is_realm {
            // No initial delivery, so start from the current version
            let current = self.snapshot();
            let mut state = observer.state.lock();
            state.phase = Phase::Delivering;
            state.last = Some(current);
        } else if let Some(queue) = &self.inner.queue {
            let realm = self.clone();
            queue.dispatch(move || realm.settle(SettleTarget::Latest));
        }

        tracing::info!(realm = %self.inner.id, observer = ?observer.id, "Observer registered");
        Ok(NotificationToken::new(observer, self.clone()))
    }

    // ========================================================================
    // Notifier hand-off
    // ========================================================================

    /// Claim the right to post a batch. Returns `false` (and marks the realm
    /// stale) if an earlier batch has not been consumed yet.
    pub(crate) fn begin_dispatch(&self) -> bool {
        let mut dispatch = self.inner.dispatch.lock();
        if dispatch.in_flight {
            dispatch.stale = true;
            return false;
        }
        dispatch.in_flight = true;
        true
    }

    pub(crate) fn end_dispatch(&self) {
        self.inner.dispatch.lock().in_flight = false;
    }

    /// Version of the pinned snapshot, without the confinement check.
    pub(crate) fn pinned_version(&self) -> Version {
        self.inner.state.lock().snapshot.version()
    }

    pub(crate) fn post(&self, batch: Batch) {
        self.inner.state.lock().mailbox.batch = Some(batch);
        self.wake();
    }

    pub(crate) fn post_failure(&self, reason: String) {
        self.inner.state.lock().mailbox.failure = Some(reason);
        self.wake();
    }

    fn wake(&self) {
        if let Some(queue) = &self.inner.queue {
            let realm = self.clone();
            queue.dispatch(move || realm.settle(SettleTarget::Mailbox));
        }
    }

    // ========================================================================
    // Delivery
    // ========================================================================

    pub(crate) fn settle(&self, target: SettleTarget) {
        let Some(_guard) = DeliveryGuard::acquire(&self.inner.delivering) else {
            // Nested inside a callback: advance only, the outer loop delivers
            let candidate = match target {
                SettleTarget::Latest => self.store().snapshot().ok(),
                SettleTarget::Snapshot(snapshot) => Some(snapshot),
                SettleTarget::Mailbox => None,
            };
            self.advance_to(candidate);
            return;
        };

        let mut target = Some(target);
        loop {
            match self.prepare_pass(target.take()) {
                Pass::Failed(reason) => {
                    self.fail_observers(reason);
                    return;
                }
                Pass::Deliver(snapshot, deliveries) => {
                    self.invoke_all(deliveries);
                    if self.pinned_version() <= snapshot.version() {
                        return;
                    }
                }
            }
        }
    }

    fn prepare_pass(&self, target: Option<SettleTarget>) -> Pass {
        let (batch, failure) = {
            let mut state = self.inner.state.lock();
            let mailbox = std::mem::take(&mut state.mailbox);
            (mailbox.batch, mailbox.failure)
        };

        if batch.is_some() {
            let stale = {
                let mut dispatch = self.inner.dispatch.lock();
                dispatch.in_flight = false;
                std::mem::take(&mut dispatch.stale)
            };
            if stale {
                self.inner.db.kick_notifier();
            }
        }

        if let Some(reason) = failure.or_else(|| self.store().failure()) {
            return Pass::Failed(reason);
        }

        let mut candidate = match target {
            Some(SettleTarget::Latest) => self.store().snapshot().ok(),
            Some(SettleTarget::Snapshot(snapshot)) => Some(snapshot),
            Some(SettleTarget::Mailbox) | None => None,
        };
        if let Some(batch) = &batch {
            let newer = candidate
                .as_ref()
                .map_or(true, |c| c.version() < batch.snapshot.version());
            if newer {
                candidate = Some(Arc::clone(&batch.snapshot));
            }
        }

        let snapshot = self.advance_to(candidate);
        let deliveries = self.collect(&snapshot, batch.as_ref());
        Pass::Deliver(snapshot, deliveries)
    }

    fn advance_to(&self, candidate: Option<Arc<Snapshot>>) -> Arc<Snapshot> {
        let mut state = self.inner.state.lock();
        if let Some(snapshot) = candidate {
            if snapshot.version() > state.snapshot.version() {
                tracing::trace!(realm = %self.inner.id, version = %snapshot.version(), "Advanced");
                state.snapshot = snapshot;
            }
        }
        Arc::clone(&state.snapshot)
    }

    /// Work out what every observer should be told about `snapshot`.
    fn collect(&self, snapshot: &Arc<Snapshot>, batch: Option<&Batch>) -> Deliveries {
        let mut deliveries = Vec::new();

        for observer in self.inner.registry.snapshot() {
            if observer.is_cancelled() {
                continue;
            }
            let mut state = observer.state.lock();
            let delivery = match state.phase {
                Phase::Invalidated => None,
                Phase::Registered => {
                    if target_exists(&observer.target, snapshot) {
                        state.phase = Phase::Delivering;
                        state.last = Some(Arc::clone(snapshot));
                        Some(Delivery::Initial)
                    } else {
                        self.classify(&observer, &mut state, Delta::Deleted)
                    }
                }
                Phase::Delivering => {
                    let Some(last) = state.last.clone() else {
                        continue;
                    };
                    if last.version() >= snapshot.version() {
                        continue;
                    }
                    let precomputed = batch
                        .filter(|b| b.snapshot.version() == snapshot.version())
                        .and_then(|b| b.deltas.get(&observer.id))
                        .filter(|(from, _)| *from == last.version())
                        .map(|(_, delta)| delta.clone());
                    let delta = precomputed.unwrap_or_else(|| {
                        diff_observed(&observer.target, observer.filter.as_ref(), &last, snapshot)
                    });
                    state.last = Some(Arc::clone(snapshot));
                    self.classify(&observer, &mut state, delta)
                }
            };
            drop(state);

            if let Some(delivery) = delivery {
                deliveries.push((observer, delivery));
            }
        }

        deliveries
    }

    /// Deliver a commit made by this realm, using the commit log where it
    /// is enough.
    fn deliver_commit(&self, commit: &Commit, skip: &[ObserverId]) {
        let new = Arc::clone(&commit.snapshot);
        let Some(guard) = DeliveryGuard::acquire(&self.inner.delivering) else {
            self.advance_to(Some(Arc::clone(&new)));
            for observer in self.inner.registry.snapshot() {
                if !skip.contains(&observer.id) {
                    continue;
                }
                let mut state = observer.state.lock();
                if state.phase == Phase::Delivering {
                    state.last = Some(Arc::clone(&new));
                }
            }
            return;
        };

        self.advance_to(Some(Arc::clone(&new)));
        let base = commit.base.version();
        let schema = self.schema();
        let mut deliveries = Vec::new();

        for observer in self.inner.registry.snapshot() {
            if observer.is_cancelled() {
                continue;
            }
            let mut state = observer.state.lock();
            if state.phase != Phase::Delivering {
                continue;
            }
            let Some(last) = state.last.clone() else {
                continue;
            };
            if last.version() >= new.version() {
                continue;
            }
            state.last = Some(Arc::clone(&new));
            if skip.contains(&observer.id) {
                continue;
            }

            let filter = observer.filter.as_ref();
            let delta = match (&observer.target, last.version() == base) {
                (ObserverTarget::Object(id), true) => with_linked_changes(
                    object_change_from_log(&schema, &commit.log, id),
                    &observer.target,
                    filter,
                    &commit.base,
                    &new,
                ),
                (ObserverTarget::Collection(source), true) => with_linked_changes(
                    diff_collection(source, &commit.base, &new),
                    &observer.target,
                    filter,
                    &commit.base,
                    &new,
                ),
                (ObserverTarget::Realm, true) => Delta::Changed(ChangeSet::default()),
                (target, false) => diff_observed(target, filter, &last, &new),
            };
            let delivery = self.classify(&observer, &mut state, delta);
            drop(state);

            if let Some(delivery) = delivery {
                deliveries.push((observer, delivery));
            }
        }

        self.invoke_all(deliveries);
        drop(guard);

        if self.pinned_version() > new.version() {
            self.settle(SettleTarget::Mailbox);
        }
    }

    fn classify(&self, observer: &Observer, state: &mut ObserverState, delta: Delta) -> Option<Delivery> {
        match delta {
            Delta::Deleted => {
                state.phase = Phase::Invalidated;
                state.last = None;
                self.inner.registry.remove(observer.id);
                Some(Delivery::Deleted)
            }
            Delta::Changed(changes) => match (&observer.target, &observer.filter) {
                (ObserverTarget::Realm, _) => Some(Delivery::Changed(changes)),
                (_, Some(filter)) => {
                    let changes = changes.filtered(filter);
                    (!changes.is_empty()).then_some(Delivery::Changed(changes))
                }
                (_, None) => (!changes.is_empty()).then_some(Delivery::Changed(changes)),
            },
        }
    }

    fn fail_observers(&self, reason: String) {
        let error = LiveError::StreamTerminal(reason);
        let mut deliveries = Vec::new();

        for observer in self.inner.registry.snapshot() {
            let mut state = observer.state.lock();
            if state.phase == Phase::Invalidated || observer.is_cancelled() {
                continue;
            }
            state.phase = Phase::Invalidated;
            state.last = None;
            drop(state);
            self.inner.registry.remove(observer.id);
            deliveries.push((observer, Delivery::Error(error.clone())));
        }

        if !deliveries.is_empty() {
            tracing::warn!(realm = %self.inner.id, error = %error, "Terminating observers");
        }
        self.invoke_all(deliveries);
    }

    fn invoke_all(&self, deliveries: Deliveries) {
        for (observer, delivery) in deliveries {
            observer.invoke(self, delivery);
        }
    }
}

fn target_exists(target: &ObserverTarget, snapshot: &Snapshot) -> bool {
    match target {
        ObserverTarget::Object(id) => snapshot.exists(id),
        ObserverTarget::Collection(source) => source.is_valid_at(snapshot),
        ObserverTarget::Realm => true,
    }
}

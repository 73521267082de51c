//! Push-based change streams.
//!
//! A [`Publisher`] is a recipe: nothing is observed until it is subscribed
//! with [`Publisher::sink`] or [`Publisher::into_stream`]. The root
//! publishers capture their object or collection eagerly, then resolve and
//! observe it on whatever context subscription happens on. Operators wrap
//! the downstream sink.
//!
//! Confined handles cannot be moved between contexts, so operators that hop
//! queues ([`Publisher::receive_on`]) only accept [`Unconfined`] values.
//! Freeze the values first, or hand them over with
//! [`Publisher::thread_safe_reference`] and [`Publisher::resolve`].

mod stream;

pub use stream::SignalStream;

use crate::changeset::{ChangeSet, CollectionChange, ObjectChange, PropertyChange, RealmNotification};
use crate::collection::LiveCollection;
use crate::database::Database;
use crate::error::{LiveError, Result};
use crate::freeze::{Freeze, FrozenCollection, FrozenObject, FrozenRealm};
use crate::latch::Latch;
use crate::object::LiveObject;
use crate::queue::Queue;
use crate::realm::Realm;
use crate::registry::NotificationToken;
use crate::thread_safe::{ThreadConfined, ThreadSafeReference};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// One event on a publisher.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal<T> {
    Value(T),
    /// Normal completion. Nothing follows.
    Finished,
    /// Abnormal completion. Nothing follows.
    Failed(LiveError),
}

impl<T> Signal<T> {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Signal::Value(_))
    }

    fn map<U>(self, f: impl FnOnce(T) -> U) -> Signal<U> {
        match self {
            Signal::Value(v) => Signal::Value(f(v)),
            Signal::Finished => Signal::Finished,
            Signal::Failed(e) => Signal::Failed(e),
        }
    }
}

/// Downstream end of a publisher.
pub type Sink<T> = Box<dyn FnMut(Signal<T>) + Send>;

type Subscribe<T> = Box<dyn FnOnce(Sink<T>, Arc<SubscriptionContext>) + Send>;

/// State shared by every stage of one subscription.
pub(crate) struct SubscriptionContext {
    token: Mutex<Option<NotificationToken>>,
    registered: Latch,
    cancelled: AtomicBool,
}

impl SubscriptionContext {
    fn new() -> Self {
        Self {
            token: Mutex::new(None),
            registered: Latch::new(),
            cancelled: AtomicBool::new(false),
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.release();
    }

    /// Unregister the upstream observer without cancelling delivery of
    /// signals already in flight.
    fn release(&self) {
        let token = self.token.lock().take();
        drop(token);
    }

    /// Keep `token` alive for the subscription, unless it was cancelled
    /// while registering.
    fn adopt(&self, token: NotificationToken) {
        if self.is_cancelled() {
            return;
        }
        *self.token.lock() = Some(token);
        if self.is_cancelled() {
            let token = self.token.lock().take();
            drop(token);
        }
    }
}

/// A lazily-started stream of values.
pub struct Publisher<T> {
    subscribe: Subscribe<T>,
    timeout: Duration,
}

impl<T> fmt::Debug for Publisher<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publisher")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> Publisher<T> {
    fn new<F>(timeout: Duration, subscribe: F) -> Self
    where
        F: FnOnce(Sink<T>, Arc<SubscriptionContext>) + Send + 'static,
    {
        Self {
            subscribe: Box::new(subscribe),
            timeout,
        }
    }

    /// A publisher that fails immediately.
    pub fn fail(error: LiveError, timeout: Duration) -> Self {
        Self::new(timeout, move |mut sink, ctx| {
            sink(Signal::Failed(error));
            ctx.registered.open();
        })
    }

    /// Register the upstream observation on `queue` instead of the caller's
    /// context.
    pub fn subscribe_on(self, queue: Queue) -> Publisher<T> {
        let Publisher { subscribe, timeout } = self;
        Publisher::new(timeout, move |sink, ctx| {
            queue.dispatch(move || subscribe(sink, ctx));
        })
    }

    /// Transform every value.
    pub fn map<U, F>(self, mut f: F) -> Publisher<U>
    where
        U: Send + 'static,
        F: FnMut(T) -> U + Send + 'static,
    {
        let Publisher { subscribe, timeout } = self;
        Publisher::new(timeout, move |mut sink: Sink<U>, ctx| {
            subscribe(Box::new(move |signal: Signal<T>| sink(signal.map(&mut f))), ctx)
        })
    }

    /// Transform every value, failing the stream on the first error.
    pub fn try_map<U, F>(self, mut f: F) -> Publisher<U>
    where
        U: Send + 'static,
        F: FnMut(T) -> Result<U> + Send + 'static,
    {
        let Publisher { subscribe, timeout } = self;
        Publisher::new(timeout, move |mut sink: Sink<U>, ctx| {
            let upstream = Arc::clone(&ctx);
            let mut failed = false;
            subscribe(
                Box::new(move |signal: Signal<T>| {
                    if failed {
                        return;
                    }
                    let out = match signal {
                        Signal::Value(v) => match f(v) {
                            Ok(u) => Signal::Value(u),
                            Err(e) => {
                                failed = true;
                                Signal::Failed(e)
                            }
                        },
                        Signal::Finished => Signal::Finished,
                        Signal::Failed(e) => Signal::Failed(e),
                    };
                    sink(out);
                    if failed {
                        upstream.release();
                    }
                }),
                ctx,
            )
        })
    }

    /// Subscribe with a callback.
    ///
    /// The callback sees values until the first terminal signal, or until
    /// the returned subscription is cancelled or dropped.
    pub fn sink<F>(self, mut f: F) -> Subscription
    where
        F: FnMut(Signal<T>) + Send + 'static,
    {
        let ctx = Arc::new(SubscriptionContext::new());
        let guard = Arc::clone(&ctx);
        let mut finished = false;

        (self.subscribe)(
            Box::new(move |signal| {
                if finished || guard.is_cancelled() {
                    return;
                }
                finished = signal.is_terminal();
                f(signal)
            }),
            Arc::clone(&ctx),
        );

        Subscription {
            ctx,
            timeout: self.timeout,
        }
    }
}

impl<T: Unconfined> Publisher<T> {
    /// Deliver every signal on `queue`, in order.
    pub fn receive_on(self, queue: Queue) -> Publisher<T> {
        let Publisher { subscribe, timeout } = self;
        Publisher::new(timeout, move |sink: Sink<T>, ctx| {
            let sink = Arc::new(Mutex::new(sink));
            let downstream = Arc::clone(&ctx);
            subscribe(
                Box::new(move |signal| {
                    let sink = Arc::clone(&sink);
                    let ctx = Arc::clone(&downstream);
                    queue.dispatch(move || {
                        if !ctx.is_cancelled() {
                            (sink.lock())(signal);
                        }
                    });
                }),
                ctx,
            )
        })
    }

    /// Deliver on `queue`, dropping values that were superseded before the
    /// queue got to them. Terminal signals are never dropped.
    pub fn receive_latest_on(self, queue: Queue) -> Publisher<T> {
        let Publisher { subscribe, timeout } = self;
        Publisher::new(timeout, move |sink: Sink<T>, ctx| {
            let sink = Arc::new(Mutex::new(sink));
            let pending: Arc<Mutex<VecDeque<Signal<T>>>> = Arc::new(Mutex::new(VecDeque::new()));
            let downstream = Arc::clone(&ctx);

            subscribe(
                Box::new(move |signal| {
                    let schedule = {
                        let mut pending = pending.lock();
                        let was_empty = pending.is_empty();
                        let unmerged = match (pending.back_mut(), signal) {
                            (Some(Signal::Value(slot)), Signal::Value(v)) => {
                                *slot = v;
                                None
                            }
                            (_, signal) => Some(signal),
                        };
                        if let Some(signal) = unmerged {
                            pending.push_back(signal);
                        }
                        was_empty
                    };
                    if !schedule {
                        return;
                    }

                    let pending = Arc::clone(&pending);
                    let sink = Arc::clone(&sink);
                    let ctx = Arc::clone(&downstream);
                    queue.dispatch(move || loop {
                        let Some(next) = pending.lock().pop_front() else {
                            break;
                        };
                        if ctx.is_cancelled() {
                            break;
                        }
                        (sink.lock())(next);
                    });
                }),
                ctx,
            )
        })
    }
}

impl<T: Freeze + Send + 'static> Publisher<T>
where
    T::Frozen: Send + 'static,
{
    /// Freeze every value so it can leave its context.
    pub fn freeze(self) -> Publisher<T::Frozen> {
        self.try_map(|value| value.freeze())
    }
}

impl<T: Handoverable + Send + 'static> Publisher<T> {
    /// Wrap every value for handover to another context.
    pub fn thread_safe_reference(self) -> Publisher<Handover<T>> {
        self.try_map(|value| Handover::new(&value))
    }
}

impl<T: Handoverable + Send + 'static> Publisher<Handover<T>> {
    /// Resolve handed-over values in the realm of the receiving context.
    ///
    /// Finishes if a value was deleted before it could be resolved.
    pub fn resolve(self, db: &Database) -> Publisher<T> {
        let db = db.clone();
        let Publisher { subscribe, timeout } = self;
        Publisher::new(timeout, move |mut sink: Sink<T>, ctx| {
            let upstream = Arc::clone(&ctx);
            let mut done = false;
            subscribe(
                Box::new(move |signal: Signal<Handover<T>>| {
                    if done {
                        return;
                    }
                    let out = match signal {
                        Signal::Value(handover) => {
                            match db.realm().and_then(|realm| handover.resolve(&realm)) {
                                Ok(Some(value)) => Signal::Value(value),
                                Ok(None) => Signal::Finished,
                                Err(e) => Signal::Failed(e),
                            }
                        }
                        Signal::Finished => Signal::Finished,
                        Signal::Failed(e) => Signal::Failed(e),
                    };
                    done = out.is_terminal();
                    sink(out);
                    if done {
                        upstream.release();
                    }
                }),
                ctx,
            )
        })
    }
}

/// Handle to an active subscription. Dropping it cancels.
pub struct Subscription {
    ctx: Arc<SubscriptionContext>,
    timeout: Duration,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("registered", &self.ctx.registered.is_open())
            .field("cancelled", &self.ctx.is_cancelled())
            .finish()
    }
}

impl Subscription {
    /// Block until the upstream observer is registered and has delivered its
    /// initial value, bounded by the configured registration timeout.
    pub fn wait_registered(&self) -> Result<()> {
        if self.ctx.registered.wait(self.timeout) {
            Ok(())
        } else {
            Err(LiveError::RegistrationTimeout(self.timeout))
        }
    }

    pub fn wait_registered_for(&self, timeout: Duration) -> bool {
        self.ctx.registered.wait(timeout)
    }

    /// Stop delivery and unregister the upstream observer.
    pub fn cancel(&self) {
        self.ctx.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.ctx.is_cancelled()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

// ============================================================================
// Root publishers
// ============================================================================

/// An event type produced by observing a live handle.
pub trait LiveChange: Send + 'static {
    type Item;

    /// The handle carried by an initial or change event.
    fn into_item(self) -> Option<Self::Item>;

    /// `Some(Ok(()))` when the observed value is gone, `Some(Err(_))` when
    /// the stream failed.
    fn termination(&self) -> Option<std::result::Result<(), LiveError>>;
}

impl LiveChange for ObjectChange<LiveObject> {
    type Item = LiveObject;

    fn into_item(self) -> Option<LiveObject> {
        match self {
            ObjectChange::Initial(o) | ObjectChange::Change(o, _) => Some(o),
            ObjectChange::Deleted | ObjectChange::Error(_) => None,
        }
    }

    fn termination(&self) -> Option<std::result::Result<(), LiveError>> {
        match self {
            ObjectChange::Deleted => Some(Ok(())),
            ObjectChange::Error(e) => Some(Err(e.clone())),
            _ => None,
        }
    }
}

impl LiveChange for CollectionChange<LiveCollection> {
    type Item = LiveCollection;

    fn into_item(self) -> Option<LiveCollection> {
        match self {
            CollectionChange::Initial(c) | CollectionChange::Update(c, _) => Some(c),
            CollectionChange::Deleted | CollectionChange::Error(_) => None,
        }
    }

    fn termination(&self) -> Option<std::result::Result<(), LiveError>> {
        match self {
            CollectionChange::Deleted => Some(Ok(())),
            CollectionChange::Error(e) => Some(Err(e.clone())),
            _ => None,
        }
    }
}

/// A live handle that can back a root publisher.
pub trait Observable: ThreadConfined + Send + 'static {
    type Change: LiveChange<Item = Self>;

    fn observe_change(
        &self,
        key_paths: &[&str],
        callback: Box<dyn FnMut(Self::Change) + Send>,
    ) -> Result<NotificationToken>;
}

impl Observable for LiveObject {
    type Change = ObjectChange<LiveObject>;

    fn observe_change(
        &self,
        key_paths: &[&str],
        callback: Box<dyn FnMut(Self::Change) + Send>,
    ) -> Result<NotificationToken> {
        self.observe(key_paths, callback)
    }
}

impl Observable for LiveCollection {
    type Change = CollectionChange<LiveCollection>;

    fn observe_change(
        &self,
        key_paths: &[&str],
        callback: Box<dyn FnMut(Self::Change) + Send>,
    ) -> Result<NotificationToken> {
        self.observe(key_paths, callback)
    }
}

/// Build a root publisher around `item`.
///
/// `forward` turns each raw change into downstream signals.
fn root<O, T, F>(item: &O, key_paths: &[&str], forward: F) -> Publisher<T>
where
    O: Observable,
    T: Send + 'static,
    F: FnMut(O::Change, &mut Sink<T>) + Send + 'static,
{
    let db = item.realm().database().clone();
    let timeout = db.config().registration_timeout;
    let key_paths: Vec<String> = key_paths.iter().map(|p| p.to_string()).collect();
    let reference = ThreadSafeReference::new(item);

    Publisher::new(timeout, move |sink: Sink<T>, ctx| {
        let sink = Arc::new(Mutex::new(sink));
        let fail = |e: LiveError| {
            (sink.lock())(Signal::Failed(e));
            ctx.registered.open();
        };

        let realm = match db.realm() {
            Ok(realm) => realm,
            Err(e) => return fail(e),
        };
        let item = match reference.and_then(|r| r.resolve(&realm)) {
            Ok(Some(item)) => item,
            Ok(None) => {
                (sink.lock())(Signal::Finished);
                ctx.registered.open();
                return;
            }
            Err(e) => return fail(e),
        };

        let downstream = Arc::clone(&sink);
        let guard = Arc::clone(&ctx);
        let mut forward = forward;
        let paths: Vec<&str> = key_paths.iter().map(String::as_str).collect();
        let token = item.observe_change(
            &paths,
            Box::new(move |change| {
                if !guard.is_cancelled() {
                    forward(change, &mut downstream.lock());
                }
            }),
        );

        match token {
            Ok(token) => {
                ctx.adopt(token);
                open_after_initial(&realm, &ctx);
            }
            Err(e) => fail(e),
        }
    })
}

/// Open the registration latch once the initial delivery has happened.
fn open_after_initial(realm: &Realm, ctx: &Arc<SubscriptionContext>) {
    match realm.queue() {
        // Queued behind the settle job the registration dispatched
        Some(queue) => {
            let opener = Arc::clone(ctx);
            if !queue.dispatch(move || opener.registered.open()) {
                ctx.registered.open();
            }
        }
        None => ctx.registered.open(),
    }
}

/// Every change event, including `Initial`. A deletion is emitted and then
/// the stream finishes; a failure fails the stream.
pub(crate) fn changesets<O: Observable>(item: &O, key_paths: &[&str]) -> Publisher<O::Change> {
    root(item, key_paths, |change: O::Change, sink: &mut Sink<O::Change>| {
        match change.termination() {
            None => sink(Signal::Value(change)),
            Some(Ok(())) => {
                sink(Signal::Value(change));
                sink(Signal::Finished);
            }
            Some(Err(e)) => sink(Signal::Failed(e)),
        }
    })
}

/// The observed handle itself on every delivery. Finishes on deletion.
pub(crate) fn values<O: Observable>(item: &O, key_paths: &[&str]) -> Publisher<O> {
    root(item, key_paths, |change: O::Change, sink: &mut Sink<O>| {
        match change.termination() {
            None => {
                if let Some(item) = change.into_item() {
                    sink(Signal::Value(item));
                }
            }
            Some(Ok(())) => sink(Signal::Finished),
            Some(Err(e)) => sink(Signal::Failed(e)),
        }
    })
}

// ============================================================================
// Handover
// ============================================================================

/// A value that can be packed on one context and unpacked on another.
pub trait Handoverable: Sized {
    type Capsule: Send + 'static;

    fn pack(&self) -> Result<Self::Capsule>;

    /// `None` when the value no longer exists in `realm`.
    fn unpack(capsule: Self::Capsule, realm: &Realm) -> Result<Option<Self>>;
}

impl Handoverable for LiveObject {
    type Capsule = ThreadSafeReference<LiveObject>;

    fn pack(&self) -> Result<Self::Capsule> {
        ThreadSafeReference::new(self)
    }

    fn unpack(capsule: Self::Capsule, realm: &Realm) -> Result<Option<Self>> {
        capsule.resolve(realm)
    }
}

impl Handoverable for LiveCollection {
    type Capsule = ThreadSafeReference<LiveCollection>;

    fn pack(&self) -> Result<Self::Capsule> {
        ThreadSafeReference::new(self)
    }

    fn unpack(capsule: Self::Capsule, realm: &Realm) -> Result<Option<Self>> {
        capsule.resolve(realm)
    }
}

impl Handoverable for ObjectChange<LiveObject> {
    type Capsule = ObjectChange<ThreadSafeReference<LiveObject>>;

    fn pack(&self) -> Result<Self::Capsule> {
        self.clone().try_map(|o| ThreadSafeReference::new(&o))
    }

    fn unpack(capsule: Self::Capsule, realm: &Realm) -> Result<Option<Self>> {
        Ok(Some(match capsule {
            ObjectChange::Initial(r) => match r.resolve(realm)? {
                Some(o) => ObjectChange::Initial(o),
                None => ObjectChange::Deleted,
            },
            ObjectChange::Change(r, properties) => match r.resolve(realm)? {
                Some(o) => ObjectChange::Change(o, properties),
                None => ObjectChange::Deleted,
            },
            ObjectChange::Deleted => ObjectChange::Deleted,
            ObjectChange::Error(e) => ObjectChange::Error(e),
        }))
    }
}

impl Handoverable for CollectionChange<LiveCollection> {
    type Capsule = CollectionChange<ThreadSafeReference<LiveCollection>>;

    fn pack(&self) -> Result<Self::Capsule> {
        self.clone().try_map(|c| ThreadSafeReference::new(&c))
    }

    fn unpack(capsule: Self::Capsule, realm: &Realm) -> Result<Option<Self>> {
        Ok(Some(match capsule {
            CollectionChange::Initial(r) => match r.resolve(realm)? {
                Some(c) => CollectionChange::Initial(c),
                None => CollectionChange::Deleted,
            },
            CollectionChange::Update(r, changes) => match r.resolve(realm)? {
                Some(c) => CollectionChange::Update(c, changes),
                None => CollectionChange::Deleted,
            },
            CollectionChange::Deleted => CollectionChange::Deleted,
            CollectionChange::Error(e) => CollectionChange::Error(e),
        }))
    }
}

/// A packed value in transit between contexts.
pub struct Handover<T: Handoverable> {
    capsule: T::Capsule,
}

impl<T: Handoverable> fmt::Debug for Handover<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handover").finish_non_exhaustive()
    }
}

impl<T: Handoverable> Handover<T> {
    pub fn new(value: &T) -> Result<Self> {
        Ok(Self {
            capsule: value.pack()?,
        })
    }

    /// Unpack in `realm`. Consumes the handover.
    pub fn resolve(self, realm: &Realm) -> Result<Option<T>> {
        T::unpack(self.capsule, realm)
    }
}

// ============================================================================
// Unconfined values
// ============================================================================

/// Values that may be delivered on any context.
///
/// Live handles are deliberately excluded: they must be frozen or handed
/// over before crossing to another queue.
pub trait Unconfined: Send + 'static {}

impl Unconfined for FrozenObject {}
impl Unconfined for FrozenCollection {}
impl Unconfined for FrozenRealm {}
impl Unconfined for RealmNotification {}
impl Unconfined for ChangeSet {}
impl Unconfined for PropertyChange {}
impl Unconfined for LiveError {}
impl Unconfined for Value {}
impl Unconfined for String {}
impl<T: ThreadConfined + 'static> Unconfined for ThreadSafeReference<T> {}
impl<T: Handoverable + 'static> Unconfined for Handover<T> {}
impl<T: Unconfined> Unconfined for ObjectChange<T> {}
impl<T: Unconfined> Unconfined for CollectionChange<T> {}
impl<T: Unconfined> Unconfined for Vec<T> {}
impl<T: Unconfined> Unconfined for Option<T> {}
impl<T: Unconfined> Unconfined for std::result::Result<T, LiveError> {}
impl<A: Unconfined, B: Unconfined> Unconfined for (A, B) {}

macro_rules! unconfined_primitives {
    ($($t:ty),*) => {
        $(impl Unconfined for $t {})*
    };
}

unconfined_primitives!(bool, char, i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize, f32, f64, ());

#[cfg(test)]
mod tests {
    use super::*;

    fn manual<T: Send + 'static>(signals: Vec<Signal<T>>) -> Publisher<T> {
        Publisher::new(Duration::from_secs(1), move |mut sink, ctx| {
            for signal in signals {
                sink(signal);
            }
            ctx.registered.open();
        })
    }

    fn collect<T: Send + 'static>(publisher: Publisher<T>) -> (Subscription, Arc<Mutex<Vec<Signal<T>>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let subscription = publisher.sink(move |signal| sink.lock().push(signal));
        (subscription, seen)
    }

    #[test]
    fn sink_stops_after_terminal() {
        let publisher = manual(vec![
            Signal::Value(1),
            Signal::Finished,
            Signal::Value(2),
        ]);
        let (subscription, seen) = collect(publisher);

        subscription.wait_registered().unwrap();
        assert_eq!(*seen.lock(), vec![Signal::Value(1), Signal::Finished]);
    }

    #[test]
    fn try_map_fails_once() {
        let publisher = manual(vec![Signal::Value(1), Signal::Value(-1), Signal::Value(3)])
            .try_map(|n: i32| {
                if n < 0 {
                    Err(LiveError::InvalidatedObject)
                } else {
                    Ok(n * 10)
                }
            });
        let (_subscription, seen) = collect(publisher);

        assert_eq!(
            *seen.lock(),
            vec![Signal::Value(10), Signal::Failed(LiveError::InvalidatedObject)]
        );
    }

    #[test]
    fn receive_on_delivers_in_order_on_queue() {
        let queue = Queue::new("receive").unwrap();
        let id = queue.id();
        let on_queue = Arc::new(AtomicBool::new(true));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let _subscription = manual((0..5).map(Signal::Value).collect())
            .receive_on(queue.clone())
            .sink({
                let seen = Arc::clone(&seen);
                let on_queue = Arc::clone(&on_queue);
                move |signal| {
                    if Queue::current().map(|q| q.id()) != Some(id) {
                        on_queue.store(false, Ordering::SeqCst);
                    }
                    seen.lock().push(signal);
                }
            });
        queue.sync(|| ()).unwrap();

        assert!(on_queue.load(Ordering::SeqCst));
        assert_eq!(*seen.lock(), (0..5).map(Signal::Value).collect::<Vec<_>>());
    }

    #[test]
    fn receive_latest_keeps_terminal_signals() {
        let queue = Queue::new("latest").unwrap();
        let (_subscription, seen) = collect(
            manual(vec![
                Signal::Value(1),
                Signal::Value(2),
                Signal::Value(3),
                Signal::Finished,
            ])
            .receive_latest_on(queue.clone()),
        );
        queue.sync(|| ()).unwrap();

        let seen = seen.lock();
        assert_eq!(seen.last(), Some(&Signal::Finished));
        assert_eq!(seen[seen.len() - 2], Signal::Value(3));
    }

    #[test]
    fn failing_publisher_opens_latch() {
        let (subscription, seen) = collect(Publisher::<u8>::fail(
            LiveError::InvalidatedObject,
            Duration::from_millis(10),
        ));
        assert!(subscription.wait_registered().is_ok());
        assert_eq!(*seen.lock(), vec![Signal::Failed(LiveError::InvalidatedObject)]);
    }
}

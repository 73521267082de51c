//! Background notifier.
//!
//! One thread per database. Each commit wakes it up; it then diffs every
//! delivering observer of every live realm from the version that observer
//! last saw up to the latest version, and posts the results to the realm's
//! mailbox. Diffs are shared between observers watching the same target
//! from the same version; changes reached through nested key paths are
//! folded in per observer.
//!
//! A realm that has not consumed its previous batch is skipped and marked
//! stale; consuming the batch kicks the notifier so it catches up. This keeps
//! at most one batch per realm in flight and coalesces bursts of commits.

use crate::differ::{diff_target, with_linked_changes, Delta};
use crate::error::{LiveError, Result};
use crate::queue::Confinement;
use crate::realm::{Realm, RealmInner};
use crate::registry::{ObserverId, ObserverTarget, Phase};
use dashmap::DashMap;
use ripple_engine::{ListenerId, Snapshot, Store, StoreEvent, Version};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::thread;
use tokio::sync::mpsc;

pub(crate) type RealmMap = DashMap<Confinement, Weak<RealmInner>>;

/// Precomputed deltas for one realm, valid for one target version.
pub(crate) struct Batch {
    pub(crate) snapshot: Arc<Snapshot>,
    /// Per observer: the version the delta starts from, and the delta
    pub(crate) deltas: HashMap<ObserverId, (Version, Delta)>,
}

#[derive(Debug)]
enum Command {
    Commit(Version),
    Failed(String),
    Kick,
    Shutdown,
}

/// Handle to the notifier thread.
pub(crate) struct Notifier {
    sender: mpsc::UnboundedSender<Command>,
    store: Arc<Store>,
    listener: ListenerId,
}

impl Notifier {
    pub(crate) fn start(store: Arc<Store>, realms: Arc<RealmMap>, thread_name: &str) -> Result<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();

        let events = sender.clone();
        let listener = store.on_commit(move |event| {
            let command = match event {
                StoreEvent::Committed(version) => Command::Commit(*version),
                StoreEvent::Failed(reason) => Command::Failed(reason.clone()),
            };
            let _ = events.send(command);
        });

        let worker = Worker {
            store: Arc::clone(&store),
            realms,
            receiver,
        };
        let spawned = thread::Builder::new()
            .name(thread_name.to_string())
            .spawn(move || worker.run());
        if let Err(e) = spawned {
            store.off(listener);
            return Err(LiveError::Spawn(e.to_string()));
        }

        tracing::debug!(thread = %thread_name, "Notifier started");
        Ok(Self {
            sender,
            store,
            listener,
        })
    }

    /// Ask for another pass, e.g. after a realm consumed a stale batch.
    pub(crate) fn kick(&self) {
        let _ = self.sender.send(Command::Kick);
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        self.store.off(self.listener);
        let _ = self.sender.send(Command::Shutdown);
    }
}

struct Worker {
    store: Arc<Store>,
    realms: Arc<RealmMap>,
    receiver: mpsc::UnboundedReceiver<Command>,
}

impl Worker {
    fn run(mut self) {
        while let Some(command) = self.receiver.blocking_recv() {
            let mut command = command;

            // Coalesce everything already queued into a single pass
            loop {
                match command {
                    Command::Commit(version) => {
                        tracing::trace!(version = %version, "Commit observed");
                    }
                    Command::Kick => {}
                    Command::Failed(reason) => {
                        self.fail(reason);
                        return;
                    }
                    Command::Shutdown => {
                        tracing::debug!("Notifier shutting down");
                        return;
                    }
                }
                match self.receiver.try_recv() {
                    Ok(next) => command = next,
                    Err(_) => break,
                }
            }

            self.pass();
        }
    }

    fn live_realms(&self) -> Vec<Realm> {
        self.realms.retain(|_, weak| weak.strong_count() > 0);
        self.realms
            .iter()
            .filter_map(|entry| entry.value().upgrade())
            .map(Realm::from_inner)
            .collect()
    }

    fn pass(&self) {
        let current = match self.store.snapshot() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::debug!(error = %e, "Skipping notifier pass");
                return;
            }
        };

        let mut memo: HashMap<(ObserverTarget, Version), Delta> = HashMap::new();
        let mut posted = 0usize;

        for realm in self.live_realms() {
            if !realm.begin_dispatch() {
                continue;
            }

            let mut deltas = HashMap::new();
            for observer in realm.registry().snapshot() {
                if observer.is_cancelled() {
                    continue;
                }
                let last = {
                    let state = observer.state.lock();
                    match (&state.phase, &state.last) {
                        (Phase::Delivering, Some(last)) => Arc::clone(last),
                        _ => continue,
                    }
                };
                if last.version() >= current.version() {
                    continue;
                }

                let delta = memo
                    .entry((observer.target.clone(), last.version()))
                    .or_insert_with(|| diff_target(&observer.target, &last, &current))
                    .clone();
                let delta = with_linked_changes(
                    delta,
                    &observer.target,
                    observer.filter.as_ref(),
                    &last,
                    &current,
                );
                deltas.insert(observer.id, (last.version(), delta));
            }

            if deltas.is_empty() && realm.pinned_version() >= current.version() {
                realm.end_dispatch();
                continue;
            }

            realm.post(Batch {
                snapshot: Arc::clone(&current),
                deltas,
            });
            posted += 1;
        }

        tracing::debug!(
            version = %current.version(),
            realms = posted,
            diffs = memo.len(),
            "Notifier pass complete"
        );
    }

    fn fail(&self, reason: String) {
        tracing::warn!(reason = %reason, "Store failed, terminating notifications");
        for realm in self.live_realms() {
            realm.post_failure(reason.clone());
        }
    }
}

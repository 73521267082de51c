//! Database handles.

use crate::config::Config;
use crate::error::{LiveError, Result};
use crate::notifier::{Notifier, RealmMap};
use crate::queue::{Confinement, Queue};
use crate::realm::Realm;
use dashmap::DashMap;
use ripple_engine::{Schema, Store};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

struct DatabaseInner {
    id: Uuid,
    store: Arc<Store>,
    config: Config,
    realms: Arc<RealmMap>,
    notifier: Notifier,
}

/// A shared database.
///
/// The handle is cheap to clone and may be used from any thread. Confined
/// access goes through [`Database::realm`].
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("id", &self.inner.id)
            .field("version", &self.inner.store.current_version())
            .field("realms", &self.inner.realms.len())
            .finish()
    }
}

impl Database {
    /// Create an empty database and start its notifier.
    pub fn open(schema: Schema, config: Config) -> Result<Self> {
        let store = Store::new(schema, config.store_config());
        let realms = Arc::new(DashMap::new());
        let notifier = Notifier::start(Arc::clone(&store), Arc::clone(&realms), &config.notifier_thread)?;

        let id = Uuid::new_v4();
        tracing::info!(database = %id, "Database opened");
        Ok(Self {
            inner: Arc::new(DatabaseInner {
                id,
                store,
                config,
                realms,
                notifier,
            }),
        })
    }

    /// Open a database configured from the environment.
    pub fn open_from_env(schema: Schema) -> Result<Self> {
        Self::open(schema, Config::from_env()?)
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<Store> {
        &self.inner.store
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// The realm for the calling thread or queue.
    ///
    /// Repeated calls from the same context return the same instance for as
    /// long as any handle to it is alive.
    pub fn realm(&self) -> Result<Realm> {
        let confinement = Confinement::current();
        let cached = self
            .inner
            .realms
            .get(&confinement)
            .and_then(|entry| entry.value().upgrade());
        if let Some(inner) = cached {
            return Ok(Realm::from_inner(inner));
        }

        let realm = Realm::open(self.clone(), confinement, Queue::current())?;
        self.inner.realms.insert(confinement, realm.downgrade());
        Ok(realm)
    }

    /// Fail unless this is the database identified by `source`.
    pub(crate) fn ensure_is(&self, source: Uuid) -> Result<()> {
        if source != self.inner.id {
            return Err(LiveError::DatabaseMismatch {
                source_db: source,
                target_db: self.inner.id,
            });
        }
        Ok(())
    }

    pub(crate) fn kick_notifier(&self) {
        self.inner.notifier.kick();
    }
}

impl Drop for DatabaseInner {
    fn drop(&mut self) {
        tracing::info!(database = %self.id, "Database closed");
    }
}

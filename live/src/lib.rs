//! # Ripple Live
//!
//! Live objects, change notifications and thread confinement on top of
//! [`ripple_engine`].
//!
//! ## Design Principles
//!
//! - **Confinement**: a live handle belongs to the thread or queue that
//!   opened its [`Realm`]; using it anywhere else panics
//! - **Explicit handover**: values cross contexts only frozen, or through a
//!   [`ThreadSafeReference`]
//! - **Off-thread diffing**: change sets are computed by a background
//!   notifier and delivered on the observer's own context
//! - **Ordered delivery**: every observer sees versions in commit order, and
//!   all observers of one realm see the same version in registration order
//!
//! ## Core Concepts
//!
//! ### Realms
//!
//! [`Database::realm`] returns the instance for the calling context. It pins
//! one version until it is refreshed, writes, or (on a [`Queue`]) receives a
//! notification pass.
//!
//! ### Observers
//!
//! [`LiveObject::observe`], [`LiveCollection::observe`] and
//! [`Realm::observe`] register callbacks. Each returns a
//! [`NotificationToken`]; dropping the token unregisters the callback. The
//! first delivery is an initial event, later ones carry a [`ChangeSet`] or
//! the list of changed properties, optionally restricted to a set of key
//! paths.
//!
//! ### Publishers
//!
//! [`Publisher`] wraps observation as a lazily-started stream with queue
//! hopping, freezing and handover operators.
//!
//! ## Quick Start
//!
//! ```rust
//! use ripple_engine::{ObjectSchema, PropertyDescriptor, PropertyType, Schema};
//! use ripple_live::{Config, Database, ObjectChange};
//! use serde_json::json;
//! use std::sync::{Arc, Mutex};
//!
//! let schema = Schema::new(1).with_object(ObjectSchema::new(
//!     "dogs",
//!     "name",
//!     vec![PropertyDescriptor::optional("age", PropertyType::Int)],
//! ));
//! let db = Database::open(schema, Config::default()).unwrap();
//! let realm = db.realm().unwrap();
//!
//! let rex = realm
//!     .write(|r| r.create("dogs", json!({"name": "rex", "age": 3})))
//!     .unwrap();
//!
//! let ages = Arc::new(Mutex::new(Vec::new()));
//! let seen = Arc::clone(&ages);
//! let _token = rex
//!     .observe(&["age"], move |change| {
//!         if let ObjectChange::Change(_, properties) = change {
//!             seen.lock().unwrap().push(properties[0].new_value.clone());
//!         }
//!     })
//!     .unwrap();
//!
//! realm.refresh().unwrap(); // initial delivery
//! realm.write(|_| rex.set("age", 4)).unwrap();
//! assert_eq!(*ages.lock().unwrap(), vec![Some(json!(4))]);
//! ```

pub mod changeset;
pub mod collection;
pub mod config;
pub mod database;
pub mod differ;
pub mod error;
pub mod freeze;
pub(crate) mod latch;
pub(crate) mod notifier;
pub mod object;
pub mod publisher;
pub mod queue;
pub mod realm;
pub mod registry;
pub mod thread_safe;

// Re-export main types at crate root
pub use changeset::{ChangeSet, CollectionChange, ObjectChange, PropertyChange, RealmNotification};
pub use collection::{Collection, CollectionSource, LiveCollection};
pub use config::{Config, ConfigError};
pub use database::Database;
pub use differ::{diff_collection, diff_object, object_change_from_log, Delta};
pub use error::{LiveError, Result};
pub use freeze::{Freeze, FrozenCollection, FrozenObject, FrozenRealm};
pub use object::LiveObject;
pub use publisher::{
    Handover, Handoverable, LiveChange, Observable, Publisher, Signal, SignalStream, Sink,
    Subscription, Unconfined,
};
pub use queue::{Confinement, Queue, QueueId};
pub use realm::Realm;
pub use registry::{KeyPathFilter, NotificationToken, ObserverId};
pub use thread_safe::{ThreadConfined, ThreadSafe, ThreadSafeReference};

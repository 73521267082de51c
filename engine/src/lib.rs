//! # Ripple Engine
//!
//! An in-memory, multi-version object store for embedded applications.
//!
//! This crate is the storage side of Ripple: it holds typed objects in
//! tables, publishes an immutable snapshot for every committed write
//! transaction, and compiles queries over those snapshots. It knows nothing
//! about threads, observers or notifications; that lives in `ripple-live`.
//!
//! ## Design Principles
//!
//! - **No IO**: the engine has no knowledge of files, network, or platform
//! - **Immutable versions**: a published [`Snapshot`] never changes
//! - **Single writer**: at most one [`WriteTransaction`] is open at a time
//! - **Testable**: pure logic, no mocks needed
//!
//! ## Core Concepts
//!
//! ### Objects
//!
//! Every object lives in a table declared by an [`ObjectSchema`] and is
//! identified by an [`ObjectId`]: its table plus primary key. Identities are
//! stable across versions, which is what lets a reference to "the same row"
//! be re-resolved at a later version or on another thread.
//!
//! ### Versions
//!
//! Each commit produces a new [`Version`]. Readers pin a version by holding
//! its `Arc<Snapshot>`; the store drops a version once nothing pins it.
//!
//! ### Write log
//!
//! Every commit returns a [`CommitLog`] describing the objects it created,
//! deleted and modified. The log holds new values only.
//!
//! ### Queries
//!
//! A [`Query`] is an explicit expression tree. [`compile`] validates it
//! against the schema and yields a [`CompiledQuery`] that can be evaluated
//! against any snapshot.
//!
//! ## Quick Start
//!
//! ```rust
//! use ripple_engine::{
//!     compile, Expr, ObjectSchema, PropertyDescriptor, PropertyType, Query, Schema, Store,
//!     StoreConfig,
//! };
//! use serde_json::json;
//!
//! // 1. Define a schema
//! let schema = Schema::new(1).with_object(ObjectSchema::new(
//!     "dogs",
//!     "name",
//!     vec![PropertyDescriptor::optional("age", PropertyType::Int)],
//! ));
//!
//! // 2. Create a store
//! let store = Store::new(schema, StoreConfig::default());
//!
//! // 3. Write
//! let mut txn = store.begin_write().unwrap();
//! txn.create("dogs", json!({"name": "rex", "age": 3})).unwrap();
//! let commit = store.commit(txn).unwrap();
//! assert_eq!(commit.log.created.len(), 1);
//!
//! // 4. Query
//! let query = compile(store.schema(), &Query::new("dogs").filter(Expr::gt("age", 1))).unwrap();
//! let snapshot = store.snapshot().unwrap();
//! assert_eq!(query.evaluate(&snapshot).len(), 1);
//! ```

pub mod error;
pub mod query;
pub mod record;
pub mod schema;
pub mod snapshot;
pub mod store;
pub mod version;
pub mod write;

// Re-export main types at crate root
pub use error::{Error, Result};
pub use query::{compile, CompareOp, CompiledQuery, Expr, Query, SortDescriptor};
pub use record::{ObjectId, Record};
pub use schema::{ObjectSchema, PropertyDescriptor, PropertyType, Schema};
pub use snapshot::{Snapshot, Table};
pub use store::{Commit, ListenerId, Store, StoreConfig, StoreEvent};
pub use version::Version;
pub use write::{CommitLog, WriteTransaction};

/// Type aliases for clarity
pub type TableName = String;
pub type ObjectKey = String;
pub type SchemaVersion = u32;

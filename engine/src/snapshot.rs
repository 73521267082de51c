//! Immutable point-in-time views of the store.
//!
//! A [`Snapshot`] is what every reader holds: it never changes once
//! published, and holding an `Arc<Snapshot>` is what keeps a version alive.
//! Tables are shared copy-on-write between consecutive versions, so a commit
//! only clones the tables it touched.

use crate::{ObjectId, ObjectKey, Record, Schema, TableName, Version};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// The rows of one table at one version.
#[derive(Debug, Clone, Default)]
pub struct Table {
    pub(crate) rows: BTreeMap<ObjectKey, Arc<Record>>,
    pub(crate) next_seq: u64,
}

impl Table {
    /// Number of objects in the table.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the table holds no objects.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Look up a record by primary key.
    pub fn get(&self, key: &str) -> Option<&Arc<Record>> {
        self.rows.get(key)
    }

    /// All records in insertion order.
    pub fn in_insertion_order(&self) -> Vec<&Arc<Record>> {
        let mut records: Vec<&Arc<Record>> = self.rows.values().collect();
        records.sort_by_key(|r| r.seq);
        records
    }
}

/// A consistent, immutable view of every table at one version.
#[derive(Debug, Clone)]
pub struct Snapshot {
    version: Version,
    schema: Arc<Schema>,
    tables: BTreeMap<TableName, Arc<Table>>,
}

impl Snapshot {
    /// An empty snapshot with one (empty) table per object type.
    pub fn empty(schema: Arc<Schema>) -> Self {
        let tables = schema
            .objects
            .keys()
            .map(|name| (name.clone(), Arc::new(Table::default())))
            .collect();
        Self {
            version: Version::INITIAL,
            schema,
            tables,
        }
    }

    /// The version this snapshot represents.
    pub fn version(&self) -> Version {
        self.version
    }

    /// The schema the snapshot was written with.
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// A table by name.
    pub fn table(&self, name: &str) -> Option<&Arc<Table>> {
        self.tables.get(name)
    }

    /// Look up a record.
    pub fn get(&self, id: &ObjectId) -> Option<&Arc<Record>> {
        self.tables.get(&id.table)?.get(&id.key)
    }

    /// Whether the object exists at this version.
    pub fn exists(&self, id: &ObjectId) -> bool {
        self.get(id).is_some()
    }

    /// Read one property, falling back to the descriptor default when the
    /// property was never written. `None` if the object or property does not
    /// exist.
    pub fn read_property(&self, id: &ObjectId, name: &str) -> Option<Value> {
        let record = self.get(id)?;
        let descriptor = self.schema.get_object(&id.table)?.descriptor(name)?;
        Some(
            record
                .get(name)
                .cloned()
                .unwrap_or_else(|| descriptor.default_value()),
        )
    }

    /// All records of a table in insertion order.
    pub fn records(&self, table: &str) -> Vec<&Arc<Record>> {
        self.tables
            .get(table)
            .map(|t| t.in_insertion_order())
            .unwrap_or_default()
    }

    /// Number of objects in a table.
    pub fn table_len(&self, table: &str) -> usize {
        self.tables.get(table).map(|t| t.len()).unwrap_or(0)
    }

    /// Count of objects across all tables.
    pub fn object_count(&self) -> usize {
        self.tables.values().map(|t| t.len()).sum()
    }

    pub(crate) fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    pub(crate) fn table_mut(&mut self, name: &str) -> Option<&mut Table> {
        self.tables.get_mut(name).map(Arc::make_mut)
    }

    pub(crate) fn table_names(&self) -> Vec<TableName> {
        self.tables.keys().cloned().collect()
    }

    /// Whether two snapshots share the same storage for `table`.
    pub fn shares_table(&self, other: &Snapshot, table: &str) -> bool {
        match (self.tables.get(table), other.tables.get(table)) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

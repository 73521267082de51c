//! Write transactions and the commit log.
//!
//! A [`WriteTransaction`] mutates a private working copy of the latest
//! snapshot. Nothing is visible to readers until [`Store::commit`] publishes
//! it as a new version. Every mutation is also recorded in a [`CommitLog`],
//! which holds the new values only.
//!
//! [`Store::commit`]: crate::Store::commit

use crate::{
    error::Result, Error, ObjectId, ObjectSchema, PropertyType, Record, Snapshot, Store,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// What a transaction changed, by object identity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitLog {
    /// Objects created by the transaction
    pub created: BTreeSet<ObjectId>,
    /// Pre-existing objects deleted by the transaction
    pub deleted: BTreeSet<ObjectId>,
    /// New values written to pre-existing objects
    pub modified: BTreeMap<ObjectId, BTreeMap<String, Value>>,
}

impl CommitLog {
    /// Whether the transaction changed nothing.
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.deleted.is_empty() && self.modified.is_empty()
    }

    /// New values written to `id`, if any.
    pub fn modifications(&self, id: &ObjectId) -> Option<&BTreeMap<String, Value>> {
        self.modified.get(id)
    }

    fn record_write(&mut self, id: &ObjectId, property: &str, value: Value) {
        if self.created.contains(id) {
            return;
        }
        self.modified
            .entry(id.clone())
            .or_default()
            .insert(property.to_string(), value);
    }

    fn record_delete(&mut self, id: &ObjectId) {
        self.modified.remove(id);
        if !self.created.remove(id) {
            self.deleted.insert(id.clone());
        }
    }
}

/// An open write transaction.
///
/// Holds the store's single writer slot until it is committed, cancelled or
/// dropped.
pub struct WriteTransaction {
    store: Arc<Store>,
    base: Arc<Snapshot>,
    working: Snapshot,
    log: CommitLog,
    finished: bool,
}

impl std::fmt::Debug for WriteTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteTransaction")
            .field("base", &self.base.version())
            .field("log", &self.log)
            .finish()
    }
}

impl WriteTransaction {
    pub(crate) fn new(store: Arc<Store>, base: Arc<Snapshot>) -> Self {
        let mut working = (*base).clone();
        working.set_version(base.version().next());
        Self {
            store,
            base,
            working,
            log: CommitLog::default(),
            finished: false,
        }
    }

    /// The snapshot the transaction started from.
    pub fn base(&self) -> &Arc<Snapshot> {
        &self.base
    }

    /// The uncommitted working view, including this transaction's writes.
    pub fn view(&self) -> &Snapshot {
        &self.working
    }

    /// Changes recorded so far.
    pub fn log(&self) -> &CommitLog {
        &self.log
    }

    /// Look up a record in the working view.
    pub fn get(&self, id: &ObjectId) -> Option<&Arc<Record>> {
        self.working.get(id)
    }

    /// Create an object from a full payload. The primary key is read from the
    /// payload.
    pub fn create(&mut self, table: &str, payload: Value) -> Result<ObjectId> {
        let schema = Arc::clone(self.working.schema());
        let object_schema = schema.require(table)?;
        object_schema.validate_object(&payload)?;

        let key = payload
            .get(&object_schema.primary_key)
            .and_then(Value::as_str)
            .ok_or_else(|| Error::MissingRequiredProperty(object_schema.primary_key.clone()))?
            .to_string();
        let id = ObjectId::new(table, key.clone());
        if self.working.exists(&id) {
            return Err(Error::ObjectAlreadyExists(id));
        }

        let values: BTreeMap<String, Value> = payload
            .as_object()
            .map(|obj| obj.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        for (name, value) in &values {
            self.check_targets(object_schema, name, value)?;
        }

        let version = self.working.version();
        let table = self
            .working
            .table_mut(table)
            .ok_or_else(|| Error::TableNotFound(table.to_string()))?;
        let seq = table.next_seq;
        table.next_seq += 1;
        table
            .rows
            .insert(key, Arc::new(Record::new(id.clone(), values, version, seq)));

        self.log.created.insert(id.clone());
        Ok(id)
    }

    /// Write one property of an existing object.
    pub fn set(&mut self, id: &ObjectId, property: &str, value: Value) -> Result<()> {
        let schema = Arc::clone(self.working.schema());
        let object_schema = schema.require(&id.table)?;
        object_schema.validate_value(property, &value)?;
        if property == object_schema.primary_key {
            return Err(Error::PrimaryKeyChange(id.clone()));
        }
        self.check_targets(object_schema, property, &value)?;

        self.write_value(id, property, value)
    }

    /// Delete an object.
    ///
    /// Links to the object are nullified and its key is removed from every
    /// list that holds it; those are recorded as modifications.
    pub fn delete(&mut self, id: &ObjectId) -> Result<()> {
        let version = self.working.version();
        let table = self
            .working
            .table_mut(&id.table)
            .ok_or_else(|| Error::TableNotFound(id.table.clone()))?;
        if table.rows.remove(&id.key).is_none() {
            return Err(Error::ObjectNotFound(id.clone()));
        }
        self.log.record_delete(id);

        let schema = Arc::clone(self.working.schema());
        for object_schema in schema.objects.values() {
            for property in &object_schema.properties {
                if property.target.as_deref() != Some(id.table.as_str()) {
                    continue;
                }
                let referencing: Vec<Arc<Record>> = self
                    .working
                    .records(&object_schema.name)
                    .into_iter()
                    .filter(|r| references(r, &property.name, property.property_type, &id.key))
                    .cloned()
                    .collect();

                for record in referencing {
                    let value = match property.property_type {
                        PropertyType::List => Value::Array(
                            record
                                .list(&property.name)
                                .into_iter()
                                .filter(|k| k != &id.key)
                                .map(Value::String)
                                .collect(),
                        ),
                        _ => Value::Null,
                    };
                    self.log.record_write(&record.id, &property.name, value.clone());
                    if let Some(table) = self.working.table_mut(&object_schema.name) {
                        if let Some(row) = table.rows.get_mut(&record.id.key) {
                            Arc::make_mut(row).set(property.name.clone(), value, version);
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Insert `key` into a list property at `index`.
    pub fn list_insert(&mut self, id: &ObjectId, property: &str, index: usize, key: &str) -> Result<()> {
        let mut keys = self.list_keys(id, property)?;
        if index > keys.len() {
            return Err(Error::IndexOutOfBounds {
                index,
                len: keys.len(),
            });
        }
        keys.insert(index, key.to_string());
        self.set(id, property, keys_value(keys))
    }

    /// Append `key` to a list property.
    pub fn list_push(&mut self, id: &ObjectId, property: &str, key: &str) -> Result<()> {
        let len = self.list_keys(id, property)?.len();
        self.list_insert(id, property, len, key)
    }

    /// Remove the element at `index` from a list property, returning its key.
    pub fn list_remove(&mut self, id: &ObjectId, property: &str, index: usize) -> Result<String> {
        let mut keys = self.list_keys(id, property)?;
        if index >= keys.len() {
            return Err(Error::IndexOutOfBounds {
                index,
                len: keys.len(),
            });
        }
        let removed = keys.remove(index);
        self.set(id, property, keys_value(keys))?;
        Ok(removed)
    }

    /// Move a list element from one position to another.
    pub fn list_move(&mut self, id: &ObjectId, property: &str, from: usize, to: usize) -> Result<()> {
        let mut keys = self.list_keys(id, property)?;
        let len = keys.len();
        if from >= len || to >= len {
            return Err(Error::IndexOutOfBounds {
                index: from.max(to),
                len,
            });
        }
        let key = keys.remove(from);
        keys.insert(to, key);
        self.set(id, property, keys_value(keys))
    }

    pub(crate) fn finish(mut self) -> (Arc<Snapshot>, Snapshot, CommitLog) {
        self.finished = true;
        let working = std::mem::replace(&mut self.working, Snapshot::empty(Arc::clone(self.base.schema())));
        (Arc::clone(&self.base), working, std::mem::take(&mut self.log))
    }

    pub(crate) fn store(&self) -> &Arc<Store> {
        &self.store
    }

    fn list_keys(&self, id: &ObjectId, property: &str) -> Result<Vec<String>> {
        let schema = self.working.schema();
        let descriptor = schema.require(&id.table)?.require(property)?;
        if descriptor.property_type != PropertyType::List {
            return Err(Error::TypeMismatch {
                property: property.to_string(),
                expected: PropertyType::List.to_string(),
                got: descriptor.property_type.to_string(),
            });
        }
        let record = self
            .working
            .get(id)
            .ok_or_else(|| Error::ObjectNotFound(id.clone()))?;
        Ok(record.list(property))
    }

    fn write_value(&mut self, id: &ObjectId, property: &str, value: Value) -> Result<()> {
        let version = self.working.version();
        let table = self
            .working
            .table_mut(&id.table)
            .ok_or_else(|| Error::TableNotFound(id.table.clone()))?;
        let row = table
            .rows
            .get_mut(&id.key)
            .ok_or_else(|| Error::ObjectNotFound(id.clone()))?;
        Arc::make_mut(row).set(property, value.clone(), version);
        self.log.record_write(id, property, value);
        Ok(())
    }

    fn check_targets(&self, object_schema: &ObjectSchema, property: &str, value: &Value) -> Result<()> {
        let Some(descriptor) = object_schema.descriptor(property) else {
            return Ok(());
        };
        let Some(target) = descriptor.target.as_deref() else {
            return Ok(());
        };
        let keys: Vec<&str> = match value {
            Value::String(key) => vec![key.as_str()],
            Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
            _ => Vec::new(),
        };
        for key in keys {
            let target_id = ObjectId::new(target, key);
            if !self.working.exists(&target_id) {
                return Err(Error::ObjectNotFound(target_id));
            }
        }
        Ok(())
    }
}

impl Drop for WriteTransaction {
    fn drop(&mut self) {
        if !self.finished {
            self.store.release_writer();
        }
    }
}

fn references(record: &Record, property: &str, property_type: PropertyType, key: &str) -> bool {
    match property_type {
        PropertyType::List => record.list(property).iter().any(|k| k == key),
        PropertyType::Link => record.get(property).and_then(Value::as_str) == Some(key),
        _ => false,
    }
}

fn keys_value(keys: Vec<String>) -> Value {
    Value::Array(keys.into_iter().map(Value::String).collect())
}

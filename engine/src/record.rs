//! Object identities and stored records.

use crate::{ObjectKey, TableName, Version};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Stable identity of an object: its table plus primary key.
///
/// Identities stay valid across versions and threads, so they are the unit
/// used to re-resolve the same logical row anywhere.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectId {
    /// Table the object lives in
    pub table: TableName,
    /// Primary key within the table
    pub key: ObjectKey,
}

impl ObjectId {
    /// Create a new object identity.
    pub fn new(table: impl Into<TableName>, key: impl Into<ObjectKey>) -> Self {
        Self {
            table: table.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.table, self.key)
    }
}

/// A stored object at one version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Identity of this object
    pub id: ObjectId,
    /// Property values by name
    pub values: BTreeMap<String, Value>,
    /// Version of the commit that created the object
    pub created_in: Version,
    /// Version of the last commit that modified the object
    pub updated_in: Version,
    /// Insertion sequence within the table
    pub seq: u64,
}

impl Record {
    /// Create a new record.
    pub fn new(id: ObjectId, values: BTreeMap<String, Value>, version: Version, seq: u64) -> Self {
        Self {
            id,
            values,
            created_in: version,
            updated_in: version,
            seq,
        }
    }

    /// Read a property value.
    pub fn get(&self, property: &str) -> Option<&Value> {
        self.values.get(property)
    }

    /// Write a property value.
    ///
    /// Returns `true` if the stored value changed.
    pub fn set(&mut self, property: impl Into<String>, value: Value, version: Version) -> bool {
        let property = property.into();
        self.updated_in = version;
        match self.values.get(&property) {
            Some(existing) if *existing == value => false,
            _ => {
                self.values.insert(property, value);
                true
            }
        }
    }

    /// Keys held by a `List` property, empty when unset.
    pub fn list(&self, property: &str) -> Vec<String> {
        self.values
            .get(property)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }
}
